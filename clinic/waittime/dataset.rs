//! Historical visit records read from a delimited file.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Columns every dataset must provide (compared after trimming and lower-casing headers).
pub const REQUIRED_COLUMNS: [&str; 12] = [
    "doctor_id",
    "doctor_type",
    "clinic_type",
    "visit_type",
    "day",
    "emergency",
    "gender",
    "problem",
    "age",
    "token_no",
    "time",
    "service_time",
];

/// Cell values treated as missing, mirroring the usual dataframe NA spellings.
const NA_TOKENS: [&str; 19] = [
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// One historical visit row; any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Doctor identifier.
    pub doctor_id: Option<String>,
    /// Doctor specialty.
    pub doctor_type: Option<String>,
    /// Clinic setting.
    pub clinic_type: Option<String>,
    /// Visit type.
    pub visit_type: Option<String>,
    /// Day of week.
    pub day: Option<String>,
    /// Emergency flag.
    pub emergency: Option<String>,
    /// Patient gender.
    pub gender: Option<String>,
    /// Presenting problem.
    pub problem: Option<String>,
    /// Patient age.
    pub age: Option<String>,
    /// Queue token number.
    pub token_no: Option<String>,
    /// Time of day of the visit.
    pub time: Option<String>,
    /// Observed service time in minutes.
    pub service_time: Option<String>,
}

impl RawRecord {
    fn from_cells(cells: [Option<String>; 12]) -> Self {
        let [doctor_id, doctor_type, clinic_type, visit_type, day, emergency, gender, problem, age, token_no, time, service_time] =
            cells;
        Self {
            doctor_id,
            doctor_type,
            clinic_type,
            visit_type,
            day,
            emergency,
            gender,
            problem,
            age,
            token_no,
            time,
            service_time,
        }
    }

    /// True when every required field is present.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.doctor_id.is_some()
            && self.doctor_type.is_some()
            && self.clinic_type.is_some()
            && self.visit_type.is_some()
            && self.day.is_some()
            && self.emergency.is_some()
            && self.gender.is_some()
            && self.problem.is_some()
            && self.age.is_some()
            && self.token_no.is_some()
            && self.time.is_some()
            && self.service_time.is_some()
    }
}

/// Errors raised while reading or validating the training data.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// Dataset file could not be read.
    #[error("reading dataset {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// No header line was found.
    #[error("dataset has no header row")]
    MissingHeader,
    /// Required columns are absent from the header.
    #[error("dataset is missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    /// A row carries more cells than the header declares.
    #[error("line {line}: expected {expected} fields, found {found}")]
    RaggedRow {
        /// 1-based line number where the row starts.
        line: usize,
        /// Header width.
        expected: usize,
        /// Cells found on the row.
        found: usize,
    },
    /// A quoted cell was never closed.
    #[error("line {line}: unterminated quoted field")]
    UnterminatedQuote {
        /// 1-based line number where the quote opened.
        line: usize,
    },
    /// Too few rows survived cleaning to train on.
    #[error("only {usable} usable rows after cleaning, need at least {required}")]
    InsufficientRows {
        /// Rows that survived filtering.
        usable: usize,
        /// Minimum rows needed for a train/validation split.
        required: usize,
    },
}

/// Anything that can hand the trainer a fresh set of raw records.
pub trait DatasetSource: Send + Sync {
    /// Loads every row, validating the header.
    fn load(&self) -> Result<Vec<RawRecord>, DatasetError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Delimited file on disk, re-read on every load.
#[derive(Debug, Clone)]
pub struct DelimitedFileSource {
    path: PathBuf,
    delimiter: char,
}

impl DelimitedFileSource {
    /// Comma-delimited file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: ',',
        }
    }

    /// Overrides the field delimiter.
    #[must_use]
    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DatasetSource for DelimitedFileSource {
    fn load(&self) -> Result<Vec<RawRecord>, DatasetError> {
        let text = fs::read_to_string(&self.path).map_err(|source| DatasetError::Io {
            path: self.path.clone(),
            source,
        })?;
        parse_delimited(&text, self.delimiter)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Delimited text held in memory.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    text: String,
    delimiter: char,
}

impl InMemorySource {
    /// Comma-delimited `text`.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            delimiter: ',',
        }
    }
}

impl DatasetSource for InMemorySource {
    fn load(&self) -> Result<Vec<RawRecord>, DatasetError> {
        parse_delimited(&self.text, self.delimiter)
    }

    fn describe(&self) -> String {
        format!("in-memory ({} bytes)", self.text.len())
    }
}

/// Parses delimited text with a header row into raw records.
///
/// Headers match [`REQUIRED_COLUMNS`] case- and whitespace-insensitively; extra columns are
/// ignored. Blank lines are skipped, short rows leave their tail missing.
pub fn parse_delimited(text: &str, delimiter: char) -> Result<Vec<RawRecord>, DatasetError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut rows = split_rows(text, delimiter)?.into_iter();
    let (_, header) = rows.next().ok_or(DatasetError::MissingHeader)?;
    let header: Vec<String> = header
        .iter()
        .map(|name| name.trim().to_lowercase())
        .collect();

    let mut positions = [0usize; 12];
    let mut missing = Vec::new();
    for (slot, column) in positions.iter_mut().zip(REQUIRED_COLUMNS) {
        match header.iter().position(|name| name == column) {
            Some(idx) => *slot = idx,
            None => missing.push(column.to_string()),
        }
    }
    if !missing.is_empty() {
        return Err(DatasetError::MissingColumns(missing));
    }

    let mut records = Vec::new();
    for (line, cells) in rows {
        if cells.len() > header.len() {
            return Err(DatasetError::RaggedRow {
                line,
                expected: header.len(),
                found: cells.len(),
            });
        }
        let picked = positions.map(|idx| cells.get(idx).map(String::as_str).and_then(present));
        records.push(RawRecord::from_cells(picked));
    }
    Ok(records)
}

fn present(cell: &str) -> Option<String> {
    if NA_TOKENS.contains(&cell) {
        None
    } else {
        Some(cell.to_string())
    }
}

/// Splits text into rows of cells, honoring double quotes and `""` escapes.
fn split_rows(text: &str, delimiter: char) -> Result<Vec<(usize, Vec<String>)>, DatasetError> {
    let mut rows = Vec::new();
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut quote_line = 0;
    let mut line = 1;
    let mut row_line = 1;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    cell.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    cell.push('\n');
                }
                other => cell.push(other),
            }
            continue;
        }
        match ch {
            '"' if cell.is_empty() => {
                in_quotes = true;
                quote_line = line;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                finish_row(&mut rows, &mut cells, &mut cell, row_line);
                line += 1;
                row_line = line;
            }
            c if c == delimiter => cells.push(std::mem::take(&mut cell)),
            other => cell.push(other),
        }
    }
    if in_quotes {
        return Err(DatasetError::UnterminatedQuote { line: quote_line });
    }
    finish_row(&mut rows, &mut cells, &mut cell, row_line);
    Ok(rows)
}

fn finish_row(
    rows: &mut Vec<(usize, Vec<String>)>,
    cells: &mut Vec<String>,
    cell: &mut String,
    line: usize,
) {
    cells.push(std::mem::take(cell));
    let row = std::mem::take(cells);
    let blank = row.len() == 1 && row[0].trim().is_empty();
    if !blank {
        rows.push((line, row));
    }
}
