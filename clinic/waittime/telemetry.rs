use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_logging::{JsonLogger, LogLevel, LogRecord, LogSink};

/// Builder configuring wait-time telemetry sinks.
pub struct WaitTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    sinks: Vec<Arc<dyn LogSink>>,
}

impl WaitTelemetryBuilder {
    /// Creates a new builder for the given module label.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Info,
            sinks: Vec::new(),
        }
    }

    /// Sets the JSON log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops records below `level` in the file logger.
    #[must_use]
    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Registers an additional sink.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Finalizes the builder, opening the log file if one was set.
    pub fn build(self) -> Result<WaitTelemetry> {
        let mut sinks = self.sinks;
        if let Some(path) = self.log_path {
            let logger = JsonLogger::new(path)?.with_min_level(self.min_level);
            sinks.insert(0, Arc::new(logger));
        }
        Ok(WaitTelemetry {
            module: self.module,
            sinks: sinks.into(),
        })
    }
}

/// Telemetry handle shared by the trainer, predictor and scheduler.
#[derive(Clone)]
pub struct WaitTelemetry {
    module: String,
    sinks: Arc<[Arc<dyn LogSink>]>,
}

impl fmt::Debug for WaitTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitTelemetry")
            .field("module", &self.module)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl WaitTelemetry {
    /// Returns a builder for this telemetry helper.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> WaitTelemetryBuilder {
        WaitTelemetryBuilder::new(module)
    }

    /// Same sinks, different module label.
    #[must_use]
    pub fn for_component(&self, module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            sinks: Arc::clone(&self.sinks),
        }
    }

    /// Module label attached to every record.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Logs a structured record to every sink, reporting the first failure.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        let record = LogRecord::new(&self.module, level, message).with_metadata(metadata);
        let mut outcome = Ok(());
        for sink in self.sinks.iter() {
            if let Err(err) = sink.write(&record) {
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        outcome
    }
}

/// Logs through an optional handle, discarding sink failures.
pub(crate) fn emit(telemetry: Option<&WaitTelemetry>, level: LogLevel, message: &str, metadata: Value) {
    if let Some(telemetry) = telemetry {
        if let Err(err) = telemetry.log(level, message, metadata) {
            eprintln!("wait-time telemetry write failed: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_logging::MemorySink;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_file_and_memory_sinks() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("logs").join("waittime.log");
        let memory = Arc::new(MemorySink::new(8));
        let telemetry = WaitTelemetry::builder("waittime")
            .log_path(&log_path)
            .min_level(LogLevel::Warn)
            .sink(memory.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "training.started", json!({ "source": "fixture" }))
            .unwrap();
        telemetry
            .for_component("waittime.predictor")
            .log(LogLevel::Warn, "prediction.fallback", json!({ "reason": "no model" }))
            .unwrap();

        let content = std::fs::read_to_string(log_path).unwrap();
        assert!(!content.contains("training.started"));
        assert!(content.contains("prediction.fallback"));
        assert_eq!(memory.records().len(), 2);
        let fallback = memory.find("prediction.fallback");
        assert_eq!(fallback[0].module, "waittime.predictor");
        assert_eq!(fallback[0].metadata["reason"], "no model");
    }

    #[test]
    fn emit_without_handle_is_silent() {
        emit(None, LogLevel::Error, "training.failed", json!({}));
    }
}
