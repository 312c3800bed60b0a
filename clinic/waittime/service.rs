use std::sync::Arc;

use anyhow::Result;
use tokio::runtime::Handle;

use crate::{
    config::WaitConfig,
    dataset::DatasetSource,
    predictor::{PredictionRequest, PredictionResult, Predictor},
    scheduler::{DailySchedule, RetrainScheduler, SchedulerHandle},
    store::ModelStore,
    telemetry::WaitTelemetry,
    trainer::{Trainer, TrainerSettings, TrainingOutcome},
};

/// Store, trainer and predictor wired together over one dataset source.
#[derive(Clone)]
pub struct WaitTimeService {
    store: Arc<ModelStore>,
    trainer: Arc<Trainer>,
    predictor: Predictor,
    source: Arc<dyn DatasetSource>,
    telemetry: Option<WaitTelemetry>,
}

impl std::fmt::Debug for WaitTimeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitTimeService")
            .field("source", &self.source.describe())
            .field("trainer", &self.trainer)
            .field("has_model", &!self.store.is_empty())
            .finish_non_exhaustive()
    }
}

impl WaitTimeService {
    /// Wires a service from explicit parts.
    #[must_use]
    pub fn new(
        source: Arc<dyn DatasetSource>,
        settings: TrainerSettings,
        default_mean: f64,
        telemetry: Option<WaitTelemetry>,
    ) -> Self {
        let store = Arc::new(ModelStore::new());
        let mut trainer = Trainer::new(Arc::clone(&store), settings);
        let mut predictor = Predictor::new(Arc::clone(&store)).with_default_mean(default_mean);
        if let Some(telemetry) = &telemetry {
            trainer = trainer.with_telemetry(telemetry.for_component("waittime.trainer"));
            predictor = predictor.with_telemetry(telemetry.for_component("waittime.predictor"));
        }
        Self {
            store,
            trainer: Arc::new(trainer),
            predictor,
            source,
            telemetry,
        }
    }

    /// Wires a service from a loaded configuration.
    pub fn from_config(config: &WaitConfig) -> Result<Self> {
        let telemetry = config.telemetry("waittime")?;
        Ok(Self::new(
            Arc::new(config.dataset_source()),
            config.trainer_settings(),
            config.prediction.default_mean,
            telemetry,
        ))
    }

    /// Initial training run performed before serving.
    pub fn bootstrap(&self) -> TrainingOutcome {
        self.train_now()
    }

    /// Runs training on the calling thread.
    pub fn train_now(&self) -> TrainingOutcome {
        self.trainer.train(&*self.source)
    }

    /// Estimates the wait for one request.
    #[must_use]
    pub fn predict(&self, request: &PredictionRequest) -> PredictionResult {
        self.predictor.predict(request)
    }

    /// Starts nightly retraining on `handle`.
    #[must_use]
    pub fn start_scheduler(&self, schedule: DailySchedule, handle: &Handle) -> SchedulerHandle {
        let mut scheduler =
            RetrainScheduler::new(Arc::clone(&self.trainer), Arc::clone(&self.source), schedule);
        if let Some(telemetry) = &self.telemetry {
            scheduler = scheduler.with_telemetry(telemetry.for_component("waittime.scheduler"));
        }
        scheduler.spawn(handle)
    }

    /// Published-model store.
    #[must_use]
    pub const fn store(&self) -> &Arc<ModelStore> {
        &self.store
    }

    /// Shared trainer.
    #[must_use]
    pub const fn trainer(&self) -> &Arc<Trainer> {
        &self.trainer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::PredictionSource;
    use shared_logging::MemorySink;
    use tempfile::tempdir;

    fn fixture_config(dir: &std::path::Path) -> WaitConfig {
        let fixture = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("dataset/synthetic_visits.csv");
        let raw = format!(
            "[dataset]\npath = {:?}\n\n[training]\niterations = 120\nlearning_rate = 0.1\ndepth = 4\nearly_stopping_rounds = 25\n\n[logging]\npath = \"service.log\"\n",
            fixture.display().to_string()
        );
        WaitConfig::parse(&raw, dir).unwrap()
    }

    #[test]
    fn predicts_default_then_model_after_bootstrap() {
        let dir = tempdir().unwrap();
        let service = WaitTimeService::from_config(&fixture_config(dir.path())).unwrap();
        let before = service.predict(&PredictionRequest::default());
        assert_eq!(before.source, PredictionSource::NoModel);
        assert!((before.estimated_minutes - 20.0).abs() < f64::EPSILON);

        assert_eq!(service.bootstrap().label(), "trained");
        let after = service.predict(&PredictionRequest::default());
        assert_eq!(after.source, PredictionSource::Model);
        assert!(service.store().last_trained_at().is_some());

        let log = std::fs::read_to_string(dir.path().join("service.log")).unwrap();
        assert!(log.contains("training.completed"));
        assert!(log.contains("waittime.trainer"));
    }

    #[test]
    fn components_share_one_store() {
        let memory = Arc::new(MemorySink::new(16));
        let telemetry = WaitTelemetry::builder("waittime").sink(memory.clone()).build().unwrap();
        let source: Arc<dyn DatasetSource> = Arc::new(crate::dataset::InMemorySource::new("not,a,dataset\n"));
        let service = WaitTimeService::new(source, TrainerSettings::default(), 15.0, Some(telemetry));
        assert!(Arc::ptr_eq(service.store(), service.trainer().store()));
        assert!(matches!(service.train_now(), TrainingOutcome::Failed(_)));
        assert!(service.store().is_empty());
        assert!((service.predict(&PredictionRequest::default()).estimated_minutes - 15.0).abs() < f64::EPSILON);
        assert_eq!(memory.find("training.failed")[0].module, "waittime.trainer");
    }
}
