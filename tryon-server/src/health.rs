//! Service health aggregation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tryon_common::{HealthResponse, HealthStatus, VariantHealth, VariantStatus};

use crate::model::{ModelManager, VariantSnapshot};
use crate::orchestrator::Orchestrator;
use crate::pipeline::PipelineBackend;

/// Time allowed for one device probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds health snapshots from the model manager and orchestrator.
///
/// Snapshots read counters and cached state only; they never wait on a load
/// or a lane.
pub struct HealthMonitor {
    models: Arc<ModelManager>,
    orchestrator: Arc<Orchestrator>,
    /// Result of the most recent backend probe.
    probe_ok: AtomicBool,
    environment: String,
}

impl HealthMonitor {
    pub fn new(
        models: Arc<ModelManager>,
        orchestrator: Arc<Orchestrator>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            models,
            orchestrator,
            probe_ok: AtomicBool::new(true),
            environment: environment.into(),
        }
    }

    pub fn record_probe(&self, ok: bool) {
        let previous = self.probe_ok.swap(ok, Ordering::AcqRel);
        if previous != ok {
            if ok {
                tracing::info!("Accelerator probe recovered");
            } else {
                tracing::warn!("Accelerator probe failing");
            }
        }
    }

    pub fn accelerator_available(&self) -> bool {
        self.probe_ok.load(Ordering::Acquire) && self.orchestrator.lanes_alive()
    }

    pub fn snapshot(&self) -> HealthResponse {
        let variants = self.models.snapshot();
        let accelerator_available = self.accelerator_available();

        HealthResponse {
            status: overall_status(&variants, accelerator_available),
            models_loaded: variants
                .iter()
                .filter(|v| v.required)
                .all(|v| v.status.is_ready()),
            queue_depth: self.orchestrator.queue_depth(),
            queue_capacity: self.orchestrator.capacity(),
            accelerator_available,
            seconds_since_last_success: self
                .orchestrator
                .since_last_success()
                .map(|d| d.as_secs_f64()),
            accelerator_memory_bytes: variants.iter().map(|v| v.memory_bytes).sum(),
            variants: variants
                .into_iter()
                .map(|v| VariantHealth {
                    variant: v.variant,
                    device: v.device,
                    state: v.status,
                    active_handles: v.active_handles,
                })
                .collect(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: self.environment.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Probe every lane's device periodically.
    pub fn spawn_probe(
        self: &Arc<Self>,
        backend: Arc<dyn PipelineBackend>,
        every: Duration,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let ok = monitor.probe_once(backend.as_ref()).await;
                monitor.record_probe(ok);
            }
        })
    }

    async fn probe_once(&self, backend: &dyn PipelineBackend) -> bool {
        let mut ok = true;
        for device in self.orchestrator.devices() {
            match tokio::time::timeout(PROBE_TIMEOUT, backend.probe(device)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(device, "Probe failed: {}", e);
                    ok = false;
                }
                Err(_) => {
                    tracing::debug!(device, "Probe timed out");
                    ok = false;
                }
            }
        }
        ok
    }
}

/// `down` if a required variant can never load, `degraded` if anything is
/// loading, retrying or unreachable. Unloaded variants are fine: they load on
/// first demand.
pub fn overall_status(variants: &[VariantSnapshot], accelerator_available: bool) -> HealthStatus {
    if variants
        .iter()
        .any(|v| v.required && v.status.is_permanently_failed())
    {
        return HealthStatus::Down;
    }

    let unsettled = variants
        .iter()
        .any(|v| matches!(v.status, VariantStatus::Loading | VariantStatus::Failed { .. }));
    if unsettled || !accelerator_available {
        return HealthStatus::Degraded;
    }

    HealthStatus::Healthy
}
