//! Nightly retraining on a tokio runtime.

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::{
    dataset::DatasetSource,
    telemetry::{emit, WaitTelemetry},
    trainer::Trainer,
};

/// India Standard Time, the default clinic offset.
pub const IST_OFFSET_MINUTES: i32 = 330;

/// Invalid schedule settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// Hour or minute out of range.
    #[error("{hour:02}:{minute:02} is not a valid time of day")]
    InvalidTime {
        /// Requested hour.
        hour: u32,
        /// Requested minute.
        minute: u32,
    },
    /// Offset beyond a day.
    #[error("UTC offset of {0} minutes is out of range")]
    InvalidOffset(i32),
}

/// Fires once a day at a wall-clock time in a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    at: NaiveTime,
    offset: FixedOffset,
}

impl DailySchedule {
    /// Daily at `hour:minute` local time, local being UTC plus `utc_offset_minutes`.
    pub fn new(hour: u32, minute: u32, utc_offset_minutes: i32) -> Result<Self, ScheduleError> {
        let at = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or(ScheduleError::InvalidTime { hour, minute })?;
        let offset = utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(ScheduleError::InvalidOffset(utc_offset_minutes))?;
        Ok(Self { at, offset })
    }

    /// Midnight India Standard Time.
    #[must_use]
    pub fn nightly() -> Self {
        Self {
            at: NaiveTime::MIN,
            offset: FixedOffset::east_opt(IST_OFFSET_MINUTES * 60).unwrap_or_else(|| Utc.fix()),
        }
    }

    /// First firing strictly after `now`.
    #[must_use]
    pub fn next_fire_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_date = now.with_timezone(&self.offset).date_naive();
        let offset = Duration::seconds(i64::from(self.offset.local_minus_utc()));
        let mut candidate = Utc.from_utc_datetime(&(local_date.and_time(self.at) - offset));
        while candidate <= now {
            candidate += Duration::days(1);
        }
        candidate
    }
}

impl Default for DailySchedule {
    fn default() -> Self {
        Self::nightly()
    }
}

/// Progress reported by a running scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    /// Training runs finished so far.
    pub runs: u64,
    /// Outcome label of the latest run.
    pub last_outcome: Option<&'static str>,
    /// Next scheduled firing.
    pub next_fire: Option<DateTime<Utc>>,
}

/// Retrains on a [`DailySchedule`], one run at a time.
pub struct RetrainScheduler {
    trainer: Arc<Trainer>,
    source: Arc<dyn DatasetSource>,
    schedule: DailySchedule,
    telemetry: Option<WaitTelemetry>,
}

impl std::fmt::Debug for RetrainScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrainScheduler")
            .field("source", &self.source.describe())
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl RetrainScheduler {
    /// Scheduler feeding `source` into `trainer`.
    #[must_use]
    pub fn new(trainer: Arc<Trainer>, source: Arc<dyn DatasetSource>, schedule: DailySchedule) -> Self {
        Self {
            trainer,
            source,
            schedule,
            telemetry: None,
        }
    }

    /// Attaches a telemetry handle.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: WaitTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Starts the loop on `handle`.
    ///
    /// Each run is awaited before the next firing is computed, so firings missed while
    /// training collapse into one.
    #[must_use]
    pub fn spawn(self, handle: &Handle) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(SchedulerStatus::default());
        let task = handle.spawn(self.run(shutdown_rx, trigger_rx, status_tx));
        SchedulerHandle {
            shutdown: Some(shutdown_tx),
            trigger: trigger_tx,
            status: status_rx,
            task,
        }
    }

    async fn run(
        self,
        mut shutdown: oneshot::Receiver<()>,
        mut triggers: mpsc::Receiver<()>,
        status: watch::Sender<SchedulerStatus>,
    ) {
        loop {
            let now = Utc::now();
            let next = self.schedule.next_fire_after(now);
            status.send_modify(|current| current.next_fire = Some(next));
            let wait = (next - now).to_std().unwrap_or(StdDuration::ZERO);

            let reason = tokio::select! {
                _ = &mut shutdown => break,
                () = tokio::time::sleep(wait) => "schedule",
                Some(()) = triggers.recv() => "manual",
            };
            emit(
                self.telemetry.as_ref(),
                LogLevel::Info,
                "scheduler.fired",
                json!({ "reason": reason }),
            );

            let trainer = Arc::clone(&self.trainer);
            let source = Arc::clone(&self.source);
            match tokio::task::spawn_blocking(move || trainer.train(&*source)).await {
                Ok(outcome) => status.send_modify(|current| {
                    current.runs += 1;
                    current.last_outcome = Some(outcome.label());
                }),
                Err(err) => emit(
                    self.telemetry.as_ref(),
                    LogLevel::Error,
                    "training.failed",
                    json!({ "error": err.to_string() }),
                ),
            }
        }
        emit(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "scheduler.stopped",
            json!({ "runs": status.borrow().runs }),
        );
    }
}

/// Control handle for a spawned [`RetrainScheduler`]. Dropping it stops the loop.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    trigger: mpsc::Sender<()>,
    status: watch::Receiver<SchedulerStatus>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Requests an immediate run. Returns false when one is already queued.
    pub fn trigger(&self) -> bool {
        self.trigger.try_send(()).is_ok()
    }

    /// Latest status.
    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    /// Receiver for status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }

    /// Stops the loop, letting an in-flight run finish first.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send(()).ok();
        }
        if let Err(err) = (&mut self.task).await {
            eprintln!("retrain scheduler task ended abnormally: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        boosting::BoostingParams,
        dataset::DelimitedFileSource,
        store::ModelStore,
        trainer::TrainerSettings,
    };
    use shared_logging::MemorySink;

    fn at(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn nightly_fires_at_local_midnight() {
        let schedule = DailySchedule::new(0, 0, 330).unwrap();
        assert_eq!(schedule, DailySchedule::default());
        assert_eq!(
            schedule.next_fire_after(at("2024-05-01T18:29:00Z")),
            at("2024-05-01T18:30:00Z")
        );
        assert_eq!(
            schedule.next_fire_after(at("2024-05-01T18:30:00Z")),
            at("2024-05-02T18:30:00Z")
        );
        assert_eq!(
            schedule.next_fire_after(at("2024-05-01T19:00:00Z")),
            at("2024-05-02T18:30:00Z")
        );
    }

    #[test]
    fn handles_negative_offsets_and_month_ends() {
        let schedule = DailySchedule::new(23, 15, -300).unwrap();
        assert_eq!(
            schedule.next_fire_after(at("2024-01-31T12:00:00Z")),
            at("2024-02-01T04:15:00Z")
        );
    }

    #[test]
    fn rejects_bad_settings() {
        assert_eq!(
            DailySchedule::new(24, 0, 0).unwrap_err(),
            ScheduleError::InvalidTime { hour: 24, minute: 0 }
        );
        assert_eq!(
            DailySchedule::new(1, 60, 0).unwrap_err(),
            ScheduleError::InvalidTime { hour: 1, minute: 60 }
        );
        assert_eq!(
            DailySchedule::new(0, 0, 24 * 60).unwrap_err(),
            ScheduleError::InvalidOffset(1440)
        );
    }

    fn scheduler(memory: &Arc<MemorySink>) -> (RetrainScheduler, Arc<ModelStore>) {
        let store = Arc::new(ModelStore::new());
        let settings = TrainerSettings {
            boosting: BoostingParams {
                iterations: 60,
                learning_rate: 0.2,
                depth: 3,
                early_stopping_rounds: 20,
                ..BoostingParams::default()
            },
            ..TrainerSettings::default()
        };
        let trainer = Arc::new(Trainer::new(Arc::clone(&store), settings));
        let source: Arc<dyn DatasetSource> = Arc::new(DelimitedFileSource::new(
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("dataset/synthetic_visits.csv"),
        ));
        let telemetry = WaitTelemetry::builder("waittime.scheduler")
            .sink(memory.clone())
            .build()
            .unwrap();
        (
            RetrainScheduler::new(trainer, source, DailySchedule::nightly()).with_telemetry(telemetry),
            store,
        )
    }

    #[tokio::test]
    async fn manual_trigger_trains_and_publishes() {
        let memory = Arc::new(MemorySink::new(32));
        let (scheduler, store) = scheduler(&memory);
        let handle = scheduler.spawn(&Handle::current());
        assert!(handle.trigger());

        let mut status = handle.subscribe();
        tokio::time::timeout(StdDuration::from_secs(120), status.wait_for(|s| s.runs >= 1))
            .await
            .expect("run finished in time")
            .unwrap();
        assert_eq!(handle.status().last_outcome, Some("trained"));
        assert!(handle.status().next_fire.is_some());
        assert!(!store.is_empty());

        handle.shutdown().await;
        assert_eq!(memory.find("scheduler.fired").len(), 1);
        assert_eq!(memory.find("scheduler.fired")[0].metadata["reason"], "manual");
        assert_eq!(memory.find("scheduler.stopped").len(), 1);
    }

    #[tokio::test]
    async fn shutdown_without_runs() {
        let memory = Arc::new(MemorySink::new(8));
        let (scheduler, store) = scheduler(&memory);
        let handle = scheduler.spawn(&Handle::current());
        handle.shutdown().await;
        assert!(store.is_empty());
        assert!(memory.find("scheduler.fired").is_empty());
        assert_eq!(memory.find("scheduler.stopped")[0].metadata["runs"], 0);
    }
}
