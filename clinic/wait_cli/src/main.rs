use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use clinic_waittime::{
    PredictionRequest, TrainingOutcome, WaitConfig, WaitTimeService,
};
use serde_json::{json, Value};
use shared_logging::{JsonLogger, LogLevel, LogRecord, LogSink};
use tokio::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "waitctl", version, about = "Clinic wait-time estimator")]
struct Cli {
    /// TOML configuration; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs one training pass and prints its outcome.
    Train,
    /// Trains once, then estimates a single request.
    Predict {
        /// Request JSON, or `@path` to read it from a file.
        #[arg(long)]
        request: String,
    },
    /// Trains, starts nightly retraining, and answers JSON-lines requests on stdin.
    Serve {
        /// Appends every answered request to this JSON-lines file.
        #[arg(long)]
        audit_log: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let service = WaitTimeService::from_config(&config)?;
    match cli.command {
        Commands::Train => {
            let outcome = service.train_now();
            println!("{}", serde_json::to_string_pretty(&outcome_json(&outcome))?);
            if let TrainingOutcome::Failed(err) = outcome {
                bail!("training failed: {err}");
            }
            Ok(())
        }
        Commands::Predict { request } => {
            let request = parse_request(&request)?;
            report_bootstrap(&service.bootstrap());
            let result = service.predict(&request);
            println!("{}", serde_json::to_string(&result.response())?);
            Ok(())
        }
        Commands::Serve { audit_log } => {
            let audit = audit_log.map(JsonLogger::new).transpose()?;
            report_bootstrap(&service.bootstrap());
            let runtime = Runtime::new().context("starting tokio runtime")?;
            let scheduler = config
                .schedule()?
                .map(|schedule| service.start_scheduler(schedule, runtime.handle()));

            let stdin = io::stdin();
            let stdout = io::stdout();
            let served = serve_lines(&service, stdin.lock(), stdout.lock(), audit.as_ref())?;

            if let Some(scheduler) = scheduler {
                runtime.block_on(scheduler.shutdown());
            }
            eprintln!("served {served} requests");
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<WaitConfig> {
    match path {
        Some(path) => WaitConfig::load(path),
        None => {
            let config = WaitConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn parse_request(arg: &str) -> Result<PredictionRequest> {
    let raw = match arg.strip_prefix('@') {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("reading request file {path}"))?
        }
        None => arg.to_string(),
    };
    serde_json::from_str(&raw).context("parsing prediction request")
}

fn outcome_json(outcome: &TrainingOutcome) -> Value {
    match outcome {
        TrainingOutcome::Trained(snapshot) => json!({
            "outcome": outcome.label(),
            "snapshot_id": snapshot.id().to_string(),
            "trained_at": snapshot.trained_at(),
            "global_mean_service_time": snapshot.global_mean_service_time(),
            "problems": snapshot.problem_lookup().len(),
            "report": snapshot.report(),
        }),
        TrainingOutcome::SkippedOverlap => json!({ "outcome": outcome.label() }),
        TrainingOutcome::Failed(err) => json!({
            "outcome": outcome.label(),
            "error": err.to_string(),
        }),
    }
}

fn report_bootstrap(outcome: &TrainingOutcome) {
    if let TrainingOutcome::Failed(err) = outcome {
        eprintln!("initial training failed, serving fallback estimates: {err}");
    }
}

fn serve_lines(
    service: &WaitTimeService,
    reader: impl BufRead,
    mut writer: impl Write,
    audit: Option<&JsonLogger>,
) -> Result<usize> {
    let mut served = 0;
    for line in reader.lines() {
        let line = line.context("reading request line")?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<PredictionRequest>(&line) {
            Ok(request) => {
                let result = service.predict(&request);
                if let Some(audit) = audit {
                    let record = LogRecord::new("waitctl", LogLevel::Info, "prediction.served")
                        .with_metadata(json!({
                            "request": request,
                            "result": result,
                            "served_at": Utc::now(),
                        }));
                    audit.write(&record)?;
                }
                served += 1;
                serde_json::to_value(result.response())?
            }
            Err(err) => json!({ "error": format!("invalid request: {err}") }),
        };
        serde_json::to_writer(&mut writer, &reply)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    Ok(served)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use clinic_waittime::{InMemorySource, TrainerSettings};
    use tempfile::tempdir;

    fn untrained_service() -> WaitTimeService {
        WaitTimeService::new(
            Arc::new(InMemorySource::new("doctor_id\n")),
            TrainerSettings::default(),
            20.0,
            None,
        )
    }

    #[test]
    fn serve_answers_each_line() {
        let dir = tempdir().unwrap();
        let audit = JsonLogger::new(dir.path().join("audit.jsonl")).unwrap();
        let input = "{\"doctor_id\": \"D205\"}\n\nnot json\n{}\n";
        let mut output = Vec::new();
        let served = serve_lines(&untrained_service(), input.as_bytes(), &mut output, Some(&audit)).unwrap();
        assert_eq!(served, 2);

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["estimated_wait_time"], 20.0);
        assert!(lines[1]["error"].as_str().unwrap().starts_with("invalid request"));
        assert_eq!(lines[2]["estimated_wait_time"], 20.0);

        let audit_text = fs::read_to_string(audit.path()).unwrap();
        assert_eq!(audit_text.lines().count(), 2);
        assert!(audit_text.contains("prediction.served"));
    }

    #[test]
    fn structured_field_values_still_get_an_estimate() {
        let input = "{\"age\": [30]}\n{\"doctor_id\": {\"x\": 1}}\n";
        let mut output = Vec::new();
        let served = serve_lines(&untrained_service(), input.as_bytes(), &mut output, None).unwrap();
        assert_eq!(served, 2);
        for line in String::from_utf8(output).unwrap().lines() {
            let reply: Value = serde_json::from_str(line).unwrap();
            assert_eq!(reply, json!({ "estimated_wait_time": 20.0 }));
        }
    }

    #[test]
    fn requests_come_inline_or_from_files() {
        let inline = parse_request("{\"age\": 40, \"emergency\": true}").unwrap();
        assert!(inline.age.is_some());

        let dir = tempdir().unwrap();
        let path = dir.path().join("request.json");
        fs::write(&path, "{\"problem\": \"IBS Management\"}").unwrap();
        let from_file = parse_request(&format!("@{}", path.display())).unwrap();
        assert!(from_file.problem.is_some());

        assert!(parse_request("[1, 2]").is_err());
    }

    #[test]
    fn failed_outcomes_carry_the_error() {
        let outcome = untrained_service().train_now();
        let value = outcome_json(&outcome);
        assert_eq!(value["outcome"], "failed");
        assert!(value["error"].as_str().unwrap().contains("missing required columns"));
    }
}
