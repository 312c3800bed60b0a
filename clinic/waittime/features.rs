//! Normalization rules shared by training and inference.
//!
//! Everything here is a pure function over its inputs. The trainer and the predictor both
//! go through [`NormalizedVisit::from_input`], so a category spelled differently at serving
//! time lands on the same key the model saw during training.

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Label used for absent categorical values.
pub const MISSING: &str = "missing";

/// Minutes past midnight used when a time-of-day cannot be parsed (09:00).
pub const DEFAULT_TIME_MINUTES: u16 = 540;

/// Number of categorical model inputs.
pub const CATEGORICAL_FEATURES: usize = 8;

/// Number of numeric model inputs.
pub const NUMERIC_FEATURES: usize = 4;

/// Total number of model inputs.
pub const FEATURE_COUNT: usize = CATEGORICAL_FEATURES + NUMERIC_FEATURES;

/// Model input names in column order.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "emergency",
    "priority_chain",
    "doctor_id",
    "doctor_type",
    "visit_type",
    "day",
    "time_min",
    "clinic_type",
    "age",
    "gender",
    "token_no",
    "problem_complexity",
];

const EMERGENCY_TOKENS: [&str; 3] = ["true", "yes", "1"];
const NORMAL_TOKENS: [&str; 3] = ["false", "no", "0"];

/// Normalizes a free-form categorical value.
///
/// Missing values become `"missing"`. Otherwise the value is trimmed and lower-cased, then
/// anything containing `follow` collapses to `"followup"` and anything containing `new` to
/// `"new"`. Only after those substring checks do the boolean spellings map to
/// `"emergency"` / `"normal"`.
#[must_use]
pub fn normalize_category(value: Option<&str>) -> String {
    let Some(value) = value else {
        return MISSING.to_string();
    };
    let cleaned = value.trim().to_lowercase();
    if cleaned.contains("follow") {
        return "followup".to_string();
    }
    if cleaned.contains("new") {
        return "new".to_string();
    }
    if EMERGENCY_TOKENS.contains(&cleaned.as_str()) {
        return "emergency".to_string();
    }
    if NORMAL_TOKENS.contains(&cleaned.as_str()) {
        return "normal".to_string();
    }
    cleaned
}

/// Parses a time of day into minutes past midnight, falling back to 09:00.
///
/// Case and spaces are ignored, so `"4:50 pm"` and `"16:50:00"` both yield `1010`.
#[must_use]
pub fn parse_time_to_minutes(value: &str) -> u16 {
    let compact: String = value
        .to_uppercase()
        .chars()
        .filter(|ch| *ch != ' ')
        .collect();
    parse_compact_time(&compact).map_or(DEFAULT_TIME_MINUTES, |time| {
        // hour <= 23 and minute <= 59, so this fits comfortably
        u16::try_from(time.hour() * 60 + time.minute()).unwrap_or(DEFAULT_TIME_MINUTES)
    })
}

fn parse_compact_time(compact: &str) -> Option<NaiveTime> {
    if compact.is_empty() {
        return None;
    }
    if compact.ends_with("AM") || compact.ends_with("PM") {
        return parse_meridiem(compact);
    }
    const TIME_FORMATS: [&str; 3] = ["%H:%M:%S%.f", "%H:%M:%S", "%H:%M"];
    const DATETIME_FORMATS: [&str; 6] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d%H:%M:%S%.f",
        "%Y-%m-%d%H:%M:%S",
        "%Y-%m-%d%H:%M",
    ];
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(compact, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(compact, fmt).ok())
                .map(|dt| dt.time())
        })
}

fn parse_meridiem(compact: &str) -> Option<NaiveTime> {
    const FORMATS: [&str; 2] = ["%I:%M:%S%p", "%I:%M%p"];
    if let Some(time) = FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(compact, fmt).ok())
    {
        return Some(time);
    }
    // bare hour, e.g. "4PM"
    let (digits, suffix) = compact.split_at(compact.len() - 2);
    let hour: u32 = digits.parse().ok()?;
    if !(1..=12).contains(&hour) {
        return None;
    }
    let hour = match (hour, suffix) {
        (12, "AM") => 0,
        (12, _) => 12,
        (h, "PM") => h + 12,
        (h, _) => h,
    };
    NaiveTime::from_hms_opt(hour, 0, 0)
}

/// Joins already-normalized values into the composite priority key.
#[must_use]
pub fn build_priority_chain(
    emergency: &str,
    doctor_id: &str,
    doctor_type: &str,
    visit_type: &str,
) -> String {
    format!("{emergency}_{doctor_id}_{doctor_type}_{visit_type}")
}

/// Looks up the complexity score of a normalized problem, defaulting to `fallback_mean`.
#[must_use]
pub fn lookup_complexity(problem: &str, lookup: &ProblemLookup, fallback_mean: f64) -> f64 {
    lookup.get(problem).unwrap_or(fallback_mean)
}

/// Mean observed service time per normalized problem label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProblemLookup {
    means: IndexMap<String, f64>,
}

impl ProblemLookup {
    /// Builds the lookup from `(normalized problem, service time)` observations.
    ///
    /// Keys keep first-seen order so identical inputs produce identical lookups.
    pub fn from_observations<'a>(observations: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        let mut totals: IndexMap<String, (f64, usize)> = IndexMap::new();
        for (problem, service_time) in observations {
            let entry = totals.entry(problem.to_string()).or_insert((0.0, 0));
            entry.0 += service_time;
            entry.1 += 1;
        }
        let means = totals
            .into_iter()
            .map(|(problem, (sum, count))| (problem, sum / count as f64))
            .collect();
        Self { means }
    }

    /// Mean service time for `problem`, if it was observed.
    #[must_use]
    pub fn get(&self, problem: &str) -> Option<f64> {
        self.means.get(problem).copied()
    }

    /// Number of distinct problems.
    #[must_use]
    pub fn len(&self) -> usize {
        self.means.len()
    }

    /// True when no problem was observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }

    /// Iterates `(problem, mean)` pairs in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.means.iter().map(|(problem, mean)| (problem.as_str(), *mean))
    }
}

/// Raw visit fields before normalization, borrowed from a dataset row or a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct VisitInput<'a> {
    /// Emergency flag as written by the source.
    pub emergency: Option<&'a str>,
    /// Doctor identifier.
    pub doctor_id: Option<&'a str>,
    /// Doctor specialty.
    pub doctor_type: Option<&'a str>,
    /// Visit type (new / follow-up).
    pub visit_type: Option<&'a str>,
    /// Day of week.
    pub day: Option<&'a str>,
    /// Clinic setting.
    pub clinic_type: Option<&'a str>,
    /// Patient gender.
    pub gender: Option<&'a str>,
    /// Presenting problem.
    pub problem: Option<&'a str>,
    /// Time of day.
    pub time: Option<&'a str>,
    /// Patient age in years.
    pub age: f64,
    /// Queue token number.
    pub token_no: f64,
}

/// Visit after every categorical field and the time have been normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedVisit {
    /// Normalized emergency flag.
    pub emergency: String,
    /// Normalized doctor identifier.
    pub doctor_id: String,
    /// Normalized doctor specialty.
    pub doctor_type: String,
    /// Normalized visit type.
    pub visit_type: String,
    /// Normalized day.
    pub day: String,
    /// Normalized clinic setting.
    pub clinic_type: String,
    /// Normalized gender.
    pub gender: String,
    /// Normalized problem label (the [`ProblemLookup`] key).
    pub problem: String,
    /// Minutes past midnight.
    pub time_min: u16,
    /// Patient age in years.
    pub age: f64,
    /// Queue token number.
    pub token_no: f64,
}

impl NormalizedVisit {
    /// Applies the shared normalization rules.
    #[must_use]
    pub fn from_input(input: &VisitInput<'_>) -> Self {
        Self {
            emergency: normalize_category(input.emergency),
            doctor_id: normalize_category(input.doctor_id),
            doctor_type: normalize_category(input.doctor_type),
            visit_type: normalize_category(input.visit_type),
            day: normalize_category(input.day),
            clinic_type: normalize_category(input.clinic_type),
            gender: normalize_category(input.gender),
            problem: normalize_category(input.problem),
            time_min: input.time.map_or(DEFAULT_TIME_MINUTES, parse_time_to_minutes),
            age: input.age,
            token_no: input.token_no,
        }
    }

    /// Derives the model inputs, scoring the problem through `lookup`.
    #[must_use]
    pub fn features(&self, lookup: &ProblemLookup, fallback_mean: f64) -> FeatureVector {
        FeatureVector {
            priority_chain: build_priority_chain(
                &self.emergency,
                &self.doctor_id,
                &self.doctor_type,
                &self.visit_type,
            ),
            emergency: self.emergency.clone(),
            doctor_id: self.doctor_id.clone(),
            doctor_type: self.doctor_type.clone(),
            visit_type: self.visit_type.clone(),
            day: self.day.clone(),
            time_min: self.time_min,
            clinic_type: self.clinic_type.clone(),
            age: self.age,
            gender: self.gender.clone(),
            token_no: self.token_no,
            problem_complexity: lookup_complexity(&self.problem, lookup, fallback_mean),
        }
    }
}

/// One column value of a [`FeatureVector`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureValue<'a> {
    /// Categorical level.
    Categorical(&'a str),
    /// Numeric value.
    Numeric(f64),
}

/// Engineered model inputs for a single visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Normalized emergency flag.
    pub emergency: String,
    /// Composite emergency/doctor/type/visit key.
    pub priority_chain: String,
    /// Normalized doctor identifier.
    pub doctor_id: String,
    /// Normalized doctor specialty.
    pub doctor_type: String,
    /// Normalized visit type.
    pub visit_type: String,
    /// Normalized day.
    pub day: String,
    /// Minutes past midnight, 0..=1439.
    pub time_min: u16,
    /// Normalized clinic setting.
    pub clinic_type: String,
    /// Patient age in years.
    pub age: f64,
    /// Normalized gender.
    pub gender: String,
    /// Queue token number.
    pub token_no: f64,
    /// Historical mean service time of the problem.
    pub problem_complexity: f64,
}

impl FeatureVector {
    /// Column values in [`FEATURE_NAMES`] order.
    #[must_use]
    pub fn columns(&self) -> [FeatureValue<'_>; FEATURE_COUNT] {
        use FeatureValue::{Categorical, Numeric};
        [
            Categorical(&self.emergency),
            Categorical(&self.priority_chain),
            Categorical(&self.doctor_id),
            Categorical(&self.doctor_type),
            Categorical(&self.visit_type),
            Categorical(&self.day),
            Numeric(f64::from(self.time_min)),
            Categorical(&self.clinic_type),
            Numeric(self.age),
            Categorical(&self.gender),
            Numeric(self.token_no),
            Numeric(self.problem_complexity),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_idempotent() {
        let samples = [
            "  FollowUp Visit ",
            "new patient",
            "YES",
            "0",
            "Gastroenterologist",
            "",
            "  ",
            "missing",
            "Emergency",
            "renewal",
            "NO",
            "Semi-Urban",
        ];
        for sample in samples {
            let once = normalize_category(Some(sample));
            assert_eq!(normalize_category(Some(&once)), once, "sample {sample:?}");
        }
        let missing = normalize_category(None);
        assert_eq!(normalize_category(Some(&missing)), missing);
    }

    #[test]
    fn substring_checks_win_over_exact_matches() {
        assert_eq!(normalize_category(Some("FollowUp Visit")), "followup");
        assert_eq!(normalize_category(Some("new patient")), "new");
        assert_eq!(normalize_category(Some("follow")), "followup");
        assert_eq!(normalize_category(Some("new-follow")), "followup");
        assert_eq!(normalize_category(Some(" Yes ")), "emergency");
        assert_eq!(normalize_category(Some("1")), "emergency");
        assert_eq!(normalize_category(Some("False")), "normal");
        assert_eq!(normalize_category(Some("Thursday")), "thursday");
        assert_eq!(normalize_category(None), MISSING);
    }

    #[test]
    fn parses_times_of_day() {
        assert_eq!(parse_time_to_minutes("16:50:00"), 1010);
        assert_eq!(parse_time_to_minutes("09:05"), 545);
        assert_eq!(parse_time_to_minutes("4:50 pm"), 1010);
        assert_eq!(parse_time_to_minutes("4:50:00PM"), 1010);
        assert_eq!(parse_time_to_minutes("12:15 am"), 15);
        assert_eq!(parse_time_to_minutes("4PM"), 960);
        assert_eq!(parse_time_to_minutes("2024-03-01 23:59:00"), 1439);
        assert_eq!(parse_time_to_minutes("00:00"), 0);
    }

    #[test]
    fn unparseable_times_default_to_nine() {
        assert_eq!(parse_time_to_minutes("not-a-time"), 540);
        assert_eq!(parse_time_to_minutes(""), 540);
        assert_eq!(parse_time_to_minutes("25:00"), 540);
        assert_eq!(parse_time_to_minutes("13PM"), 540);
    }

    #[test]
    fn priority_chain_joins_with_underscores() {
        assert_eq!(
            build_priority_chain("normal", "d205", "gastroenterologist", "followup"),
            "normal_d205_gastroenterologist_followup"
        );
    }

    #[test]
    fn lookup_averages_and_falls_back() {
        let lookup = ProblemLookup::from_observations([("fever", 10.0), ("ibs", 30.0), ("fever", 20.0)]);
        assert_eq!(lookup.len(), 2);
        assert!((lookup_complexity("fever", &lookup, 99.0) - 15.0).abs() < f64::EPSILON);
        assert!((lookup_complexity("unknown", &lookup, 99.0) - 99.0).abs() < f64::EPSILON);
        let order: Vec<_> = lookup.iter().map(|(problem, _)| problem).collect();
        assert_eq!(order, ["fever", "ibs"]);
    }

    #[test]
    fn visit_features_follow_column_order() {
        let input = VisitInput {
            emergency: Some("no"),
            doctor_id: Some("D205"),
            doctor_type: Some("Gastroenterologist"),
            visit_type: Some("followup"),
            day: Some("Thursday"),
            clinic_type: Some("semi-urban"),
            gender: Some("female"),
            problem: Some("IBS Management"),
            time: Some("16:50:00"),
            age: 32.0,
            token_no: 14.0,
        };
        let visit = NormalizedVisit::from_input(&input);
        let lookup = ProblemLookup::from_observations([("ibs management", 18.0)]);
        let features = visit.features(&lookup, 20.0);
        assert_eq!(features.priority_chain, "normal_d205_gastroenterologist_followup");
        assert_eq!(features.time_min, 1010);
        assert!((features.problem_complexity - 18.0).abs() < f64::EPSILON);
        let columns = features.columns();
        assert_eq!(columns[0], FeatureValue::Categorical("normal"));
        assert_eq!(columns[6], FeatureValue::Numeric(1010.0));
        assert_eq!(columns[11], FeatureValue::Numeric(18.0));
    }
}
