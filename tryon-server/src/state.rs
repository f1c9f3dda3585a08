//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::health::HealthMonitor;
use crate::model::ModelManager;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::pipeline::PipelineBackend;
use crate::store::ResultStore;
use crate::validate::{RequestValidator, ValidationLimits};

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub validator: RequestValidator,
    pub models: Arc<ModelManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<ResultStore>,
    pub health: Arc<HealthMonitor>,
    pub backend: Arc<dyn PipelineBackend>,
}

impl AppState {
    /// Wire every component from a validated configuration.
    ///
    /// Must run inside a Tokio runtime: the orchestrator starts its lane
    /// workers here.
    pub fn new(config: Config, backend: Arc<dyn PipelineBackend>) -> std::io::Result<Self> {
        let store = Arc::new(ResultStore::open(
            &config.results.dir,
            Duration::from_secs(config.results.retention_secs),
        )?);
        let models = Arc::new(ModelManager::new(&config, backend.clone()));
        let orchestrator = Arc::new(Orchestrator::start(
            OrchestratorSettings::from(&config),
            models.clone(),
            backend.clone(),
            store.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            models.clone(),
            orchestrator.clone(),
            config.server.environment.clone(),
        ));

        Ok(Self {
            validator: RequestValidator::new(ValidationLimits::from(&config.limits)),
            config,
            models,
            orchestrator,
            store,
            health,
            backend,
        })
    }

    /// Start the background tasks: model preload, result sweeping and
    /// accelerator probing.
    pub fn spawn_background_tasks(&self) {
        if self.config.models.preload {
            self.models.preload();
            tracing::info!("Preloading variants in the background");
        }
        self.store
            .spawn_sweeper(Duration::from_secs(self.config.results.sweep_interval_secs));
        self.health.spawn_probe(
            self.backend.clone(),
            Duration::from_secs(self.config.pipeline.probe_interval_secs),
        );
    }
}
