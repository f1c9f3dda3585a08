//! Per-variant single-flight loading.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tryon_common::{Variant, VariantStatus};

use super::{ModelHandle, VariantSnapshot};
use crate::config::Config;
use crate::error::ModelLoadError;
use crate::pipeline::{LoadedModel, PipelineBackend, VariantSpec};

/// Time allowed for one unload call at shutdown.
const UNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

enum LoadState {
    Unloaded,
    Loading,
    Ready(Arc<LoadedModel>),
    Failed { error: ModelLoadError, at: Instant },
}

struct SlotState {
    load: LoadState,
    attempts: u32,
}

/// One configured variant.
struct VariantSlot {
    spec: VariantSpec,
    required: bool,
    state: RwLock<SlotState>,
    /// Bumped every time a load settles, so waiters can tell that the load
    /// they queued behind has finished.
    generation: AtomicU64,
    /// Held for the whole duration of a load.
    load_lock: Arc<Mutex<()>>,
}

impl VariantSlot {
    fn read(&self) -> RwLockReadGuard<'_, SlotState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SlotState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn error(&self, attempts: u32, retryable: bool, detail: impl Into<String>) -> ModelLoadError {
        ModelLoadError {
            variant: self.spec.variant,
            attempts,
            retryable,
            detail: detail.into(),
        }
    }

    /// The result of the most recent load, if one has settled.
    fn outcome(&self) -> Option<Result<ModelHandle, ModelLoadError>> {
        match &self.read().load {
            LoadState::Ready(model) => Some(Ok(ModelHandle(model.clone()))),
            LoadState::Failed { error, .. } => Some(Err(error.clone())),
            LoadState::Unloaded | LoadState::Loading => None,
        }
    }

    /// An outcome that must be returned without attempting a load: a ready
    /// model, a permanent failure, or a failure still inside its cool-down.
    fn settled(&self, cooldown: Duration) -> Option<Result<ModelHandle, ModelLoadError>> {
        match &self.read().load {
            LoadState::Ready(model) => Some(Ok(ModelHandle(model.clone()))),
            LoadState::Failed { error, .. } if !error.retryable => Some(Err(error.clone())),
            LoadState::Failed { error, at } if at.elapsed() < cooldown => Some(Err(error.clone())),
            _ => None,
        }
    }

    fn status(&self) -> VariantStatus {
        match &self.read().load {
            LoadState::Unloaded => VariantStatus::Unloaded,
            LoadState::Loading => VariantStatus::Loading,
            LoadState::Ready(_) => VariantStatus::Ready,
            LoadState::Failed { error, .. } => VariantStatus::Failed {
                attempts: error.attempts,
                retryable: error.retryable,
            },
        }
    }
}

/// Owns every loaded variant for the lifetime of the process.
pub struct ModelManager {
    backend: Arc<dyn PipelineBackend>,
    slots: HashMap<Variant, Arc<VariantSlot>>,
    load_timeout: Duration,
    retry_cooldown: Duration,
    max_attempts: u32,
    shutting_down: AtomicBool,
}

impl ModelManager {
    pub fn new(config: &Config, backend: Arc<dyn PipelineBackend>) -> Self {
        let slots = Variant::ALL
            .into_iter()
            .map(|variant| {
                let slot = VariantSlot {
                    spec: VariantSpec {
                        variant,
                        device: config.variant_device(variant).to_string(),
                        precision: config.accelerator.precision,
                        checkpoint: config.checkpoint_path(variant),
                    },
                    required: config.variants.get(variant).required,
                    state: RwLock::new(SlotState {
                        load: LoadState::Unloaded,
                        attempts: 0,
                    }),
                    generation: AtomicU64::new(0),
                    load_lock: Arc::new(Mutex::new(())),
                };
                (variant, Arc::new(slot))
            })
            .collect();

        Self {
            backend,
            slots,
            load_timeout: Duration::from_secs(config.models.load_timeout_secs),
            retry_cooldown: Duration::from_secs(config.models.retry_cooldown_secs),
            max_attempts: config.models.max_load_attempts,
            shutting_down: AtomicBool::new(false),
        }
    }

    fn slot(&self, variant: Variant) -> Result<&Arc<VariantSlot>, ModelLoadError> {
        self.slots.get(&variant).ok_or_else(|| ModelLoadError {
            variant,
            attempts: 0,
            retryable: false,
            detail: "variant is not configured".to_string(),
        })
    }

    /// Device a variant is pinned to.
    pub fn device_for(&self, variant: Variant) -> Option<&str> {
        self.slots.get(&variant).map(|slot| slot.spec.device.as_str())
    }

    /// Get a handle to a loaded variant, loading it on first demand.
    ///
    /// Concurrent callers for an unloaded variant share one load and all see
    /// its outcome.
    pub async fn acquire(&self, variant: Variant) -> Result<ModelHandle, ModelLoadError> {
        let slot = self.slot(variant)?;

        if self.shutting_down.load(Ordering::Acquire) {
            return Err(slot.error(0, false, "server is shutting down"));
        }

        let seen = slot.generation.load(Ordering::Acquire);
        if let Some(outcome) = slot.settled(self.retry_cooldown) {
            return outcome;
        }

        let guard = slot.load_lock.clone().lock_owned().await;

        // A load finished while we waited: share its outcome.
        if slot.generation.load(Ordering::Acquire) != seen {
            if let Some(outcome) = slot.outcome() {
                return outcome;
            }
        }
        if let Some(outcome) = slot.settled(self.retry_cooldown) {
            return outcome;
        }

        // The load runs detached so an abandoned caller cannot leave the
        // variant stuck in Loading.
        let task = tokio::spawn(load(
            slot.clone(),
            self.backend.clone(),
            self.load_timeout,
            self.max_attempts,
            guard,
        ));

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(slot.error(0, true, format!("load task failed: {}", e))),
        }
    }

    /// Return a handle. Handles are shared read access, so this never unloads.
    pub fn release(&self, handle: ModelHandle) {
        tracing::trace!(variant = %handle.variant(), "Released model handle");
        drop(handle);
    }

    pub fn status(&self, variant: Variant) -> VariantStatus {
        self.slots
            .get(&variant)
            .map(|slot| slot.status())
            .unwrap_or(VariantStatus::Unloaded)
    }

    /// State of every variant. Never blocks on a load in progress.
    pub fn snapshot(&self) -> Vec<VariantSnapshot> {
        Variant::ALL
            .into_iter()
            .filter_map(|variant| self.slots.get(&variant))
            .map(|slot| {
                let state = slot.read();
                let (active_handles, memory_bytes) = match &state.load {
                    LoadState::Ready(model) => {
                        (Arc::strong_count(model).saturating_sub(1), model.memory_bytes)
                    }
                    _ => (0, 0),
                };
                drop(state);

                VariantSnapshot {
                    variant: slot.spec.variant,
                    device: slot.spec.device.clone(),
                    required: slot.required,
                    status: slot.status(),
                    active_handles,
                    memory_bytes,
                }
            })
            .collect()
    }

    /// Accelerator memory held by ready variants.
    pub fn memory_bytes(&self) -> u64 {
        self.snapshot().iter().map(|v| v.memory_bytes).sum()
    }

    /// Load every variant in the background, one after another.
    pub fn preload(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            for variant in Variant::ALL {
                match manager.acquire(variant).await {
                    Ok(handle) => manager.release(handle),
                    Err(e) => {
                        tracing::warn!(variant = %variant, "Preload failed: {}", e.detail);
                    }
                }
            }
        })
    }

    /// Unload every ready variant. Further acquires fail.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);

        for variant in Variant::ALL {
            let Some(slot) = self.slots.get(&variant) else {
                continue;
            };
            // Waits for an in-flight load to settle.
            let _guard = slot.load_lock.lock().await;

            let model = match std::mem::replace(&mut slot.write().load, LoadState::Unloaded) {
                LoadState::Ready(model) => model,
                _ => continue,
            };

            let handles = Arc::strong_count(&model).saturating_sub(1);
            if handles > 0 {
                tracing::warn!(variant = %variant, handles, "Unloading variant with live handles");
            }

            match tokio::time::timeout(UNLOAD_TIMEOUT, self.backend.unload_variant(&model)).await {
                Ok(Ok(())) => tracing::info!(variant = %variant, "Unloaded variant"),
                Ok(Err(e)) => tracing::warn!(variant = %variant, "Failed to unload variant: {}", e),
                Err(_) => tracing::warn!(variant = %variant, "Unload timed out"),
            }
            slot.generation.fetch_add(1, Ordering::AcqRel);
        }
    }
}

async fn load(
    slot: Arc<VariantSlot>,
    backend: Arc<dyn PipelineBackend>,
    timeout: Duration,
    max_attempts: u32,
    _guard: OwnedMutexGuard<()>,
) -> Result<ModelHandle, ModelLoadError> {
    let variant = slot.spec.variant;
    slot.write().load = LoadState::Loading;

    tracing::info!(
        variant = %variant,
        device = %slot.spec.device,
        checkpoint = %slot.spec.checkpoint.display(),
        "Loading variant"
    );
    let started = Instant::now();

    let result = match tokio::time::timeout(timeout, backend.load_variant(&slot.spec)).await {
        Ok(Ok(model)) => Ok(model),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("load timed out after {:?}", timeout)),
    };

    let outcome = {
        let mut state = slot.write();
        match result {
            Ok(model) => {
                let model = Arc::new(model);
                state.load = LoadState::Ready(model.clone());
                Ok(ModelHandle(model))
            }
            Err(detail) => {
                state.attempts += 1;
                let error = slot.error(state.attempts, state.attempts < max_attempts, detail);
                state.load = LoadState::Failed {
                    error: error.clone(),
                    at: Instant::now(),
                };
                Err(error)
            }
        }
    };
    slot.generation.fetch_add(1, Ordering::AcqRel);

    match &outcome {
        Ok(model) => tracing::info!(
            variant = %variant,
            memory_bytes = model.memory_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Variant ready"
        ),
        Err(e) => tracing::error!(
            variant = %variant,
            attempts = e.attempts,
            retryable = e.retryable,
            "Variant load failed: {}",
            e.detail
        ),
    }

    outcome
}
