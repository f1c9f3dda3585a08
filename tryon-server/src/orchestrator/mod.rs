//! Inference orchestration.
//!
//! The orchestrator is the only component that touches the accelerator. Each
//! declared device gets a lane: a FIFO queue drained by a single worker, so
//! stages never overlap on one device. Every lane admits a bounded number of
//! jobs of its own and never waits; when a lane's slots are taken, `submit`
//! fails fast for that device only.

mod job;

pub use job::{JobOutcome, JobStage, JobTicket};

use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use image::ImageFormat;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tryon_common::{Category, Variant};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{CancelReason, ProcessingError, ResourceError, ServiceError, StageFailure};
use crate::model::{ModelHandle, ModelManager};
use crate::pipeline::{PipelineBackend, PipelineError, SynthesisInput};
use crate::store::{ArtifactMetadata, ResultId, ResultStore};
use crate::validate::{ProcessingRequest, SamplingParams};
use job::{JobResult, PipelineJob, QueuedJob};

/// Timeouts and sizing for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub devices: Vec<String>,
    pub max_concurrent_jobs: usize,
    pub parse_timeout: Duration,
    pub pose_timeout: Duration,
    pub synthesize_timeout: Duration,
    pub postprocess_timeout: Duration,
    pub job_timeout: Duration,
    pub output_width: u32,
    pub output_height: u32,
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        let pipeline = &config.pipeline;
        Self {
            devices: config.accelerator.devices.clone(),
            max_concurrent_jobs: config.limits.max_concurrent_jobs,
            parse_timeout: Duration::from_secs(pipeline.parse_timeout_secs),
            pose_timeout: Duration::from_secs(pipeline.pose_timeout_secs),
            synthesize_timeout: Duration::from_secs(pipeline.synthesize_timeout_secs),
            postprocess_timeout: Duration::from_secs(pipeline.postprocess_timeout_secs),
            job_timeout: config.job_timeout(),
            output_width: pipeline.output_width,
            output_height: pipeline.output_height,
        }
    }
}

impl From<PipelineError> for StageFailure {
    fn from(e: PipelineError) -> Self {
        StageFailure::Backend(e.to_string())
    }
}

/// Stages of every job still in flight.
#[derive(Default)]
struct JobRegistry {
    stages: RwLock<HashMap<Uuid, JobStage>>,
}

impl JobRegistry {
    fn set(&self, id: Uuid, stage: JobStage) {
        let mut stages = self.stages.write().unwrap_or_else(|e| e.into_inner());
        if stage.is_terminal() {
            stages.remove(&id);
        } else {
            stages.insert(id, stage);
        }
    }

    fn get(&self, id: &Uuid) -> Option<JobStage> {
        let stages = self.stages.read().unwrap_or_else(|e| e.into_inner());
        stages.get(id).copied()
    }
}

/// Shared state used by every lane worker.
struct LaneContext {
    settings: OrchestratorSettings,
    models: Arc<ModelManager>,
    backend: Arc<dyn PipelineBackend>,
    store: Arc<ResultStore>,
    jobs: JobRegistry,
    last_success: Mutex<Option<Instant>>,
}

struct Lane {
    sender: mpsc::Sender<QueuedJob>,
    admission: Arc<Semaphore>,
    capacity: usize,
}

impl Lane {
    fn in_flight(&self) -> usize {
        self.capacity - self.admission.available_permits()
    }
}

pub struct Orchestrator {
    lanes: HashMap<String, Lane>,
    context: Arc<LaneContext>,
}

/// Admission slots per device: the configured total spread over the
/// devices, earlier devices taking the remainder, never less than one.
fn lane_capacities(devices: usize, total: usize) -> Vec<usize> {
    let base = total / devices.max(1);
    let extra = total % devices.max(1);
    (0..devices)
        .map(|i| (base + usize::from(i < extra)).max(1))
        .collect()
}

impl Orchestrator {
    /// Start one lane worker per device.
    pub fn start(
        settings: OrchestratorSettings,
        models: Arc<ModelManager>,
        backend: Arc<dyn PipelineBackend>,
        store: Arc<ResultStore>,
    ) -> Self {
        let devices = settings.devices.clone();
        let capacities = lane_capacities(devices.len(), settings.max_concurrent_jobs);
        let context = Arc::new(LaneContext {
            settings,
            models,
            backend,
            store,
            jobs: JobRegistry::default(),
            last_success: Mutex::new(None),
        });

        let mut lanes = HashMap::new();
        for (device, capacity) in devices.into_iter().zip(capacities) {
            let (sender, receiver) = mpsc::channel(capacity);
            tokio::spawn(run_lane(device.clone(), receiver, context.clone()));
            tracing::debug!(device = %device, capacity, "Lane created");
            lanes.insert(
                device,
                Lane {
                    sender,
                    admission: Arc::new(Semaphore::new(capacity)),
                    capacity,
                },
            );
        }

        let orchestrator = Self { lanes, context };
        tracing::info!(
            lanes = orchestrator.lanes.len(),
            capacity = orchestrator.capacity(),
            "Orchestrator started"
        );
        orchestrator
    }

    /// Admit a validated request. Never waits for capacity.
    pub fn submit(&self, request: ProcessingRequest) -> Result<JobTicket, ResourceError> {
        let device = self
            .context
            .models
            .device_for(request.variant)
            .unwrap_or_default()
            .to_string();
        let lane = match self.lanes.get(&device) {
            Some(lane) if !lane.sender.is_closed() => lane,
            _ => return Err(ResourceError::AcceleratorUnavailable { device }),
        };

        let permit = lane
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| ResourceError::QueueFull {
                device: device.clone(),
                capacity: lane.capacity,
            })?;

        let job_id = request.id;
        let admitted_at = Instant::now();
        let cancel = Arc::new(AtomicBool::new(false));
        let (respond, receiver) = oneshot::channel();

        self.context.jobs.set(job_id, JobStage::Queued);
        let job = QueuedJob {
            job: PipelineJob {
                request,
                admitted_at,
                deadline: admitted_at + self.context.settings.job_timeout,
                cancel: cancel.clone(),
            },
            permit,
            respond,
        };

        if lane.sender.try_send(job).is_err() {
            self.context.jobs.set(job_id, JobStage::Failed);
            return Err(ResourceError::AcceleratorUnavailable { device });
        }

        tracing::debug!(job_id = %job_id, device = %device, "Job queued");
        Ok(JobTicket::new(job_id, cancel, receiver))
    }

    /// Jobs admitted and not yet finished, across all lanes.
    pub fn queue_depth(&self) -> usize {
        self.lanes.values().map(Lane::in_flight).sum()
    }

    /// Admission slots summed over all lanes.
    pub fn capacity(&self) -> usize {
        self.lanes.values().map(|lane| lane.capacity).sum()
    }

    /// Current stage of an active job.
    pub fn job_status(&self, job_id: &Uuid) -> Option<JobStage> {
        self.context.jobs.get(job_id)
    }

    /// Time since the last job completed successfully.
    pub fn since_last_success(&self) -> Option<Duration> {
        let last = self
            .context
            .last_success
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        last.map(|at| at.elapsed())
    }

    /// Whether every lane worker is still running.
    pub fn lanes_alive(&self) -> bool {
        self.lanes.values().all(|lane| !lane.sender.is_closed())
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.lanes.keys().map(String::as_str)
    }
}

/// Drain one device's queue, one job at a time.
async fn run_lane(device: String, mut receiver: mpsc::Receiver<QueuedJob>, ctx: Arc<LaneContext>) {
    tracing::debug!(device = %device, "Lane worker started");

    while let Some(QueuedJob {
        job,
        permit,
        respond,
    }) = receiver.recv().await
    {
        let job_id = job.id();
        // A job that panics fails alone; the lane keeps draining.
        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.run(&job).await }
        });
        let result = match task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(job_id = %job_id, device = %device, "Job task aborted: {}", e);
                Err(ProcessingError {
                    job_id,
                    stage: ctx.jobs.get(&job_id).unwrap_or(JobStage::Queued),
                    failure: StageFailure::Backend("job task aborted".to_string()),
                }
                .into())
            }
        };

        let final_stage = match &result {
            Ok(_) => JobStage::Completed,
            Err(ServiceError::Processing(e)) if matches!(e.failure, StageFailure::Cancelled(_)) => {
                JobStage::Cancelled
            }
            Err(_) => JobStage::Failed,
        };
        ctx.jobs.set(job_id, final_stage);

        // Free the slot before the caller hears back.
        drop(permit);

        match &result {
            Ok(outcome) => tracing::info!(
                job_id = %job_id,
                device = %device,
                results = outcome.result_ids.len(),
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "Job completed"
            ),
            Err(e) => tracing::warn!(
                job_id = %job_id,
                device = %device,
                stage = %final_stage,
                "Job ended: {}",
                e
            ),
        }

        if respond.send(result).is_err() {
            tracing::debug!(job_id = %job_id, "Caller gone before job finished");
        }
    }

    tracing::debug!(device = %device, "Lane worker stopped");
}

impl LaneContext {
    async fn run(&self, job: &PipelineJob) -> JobResult {
        let request = &job.request;

        self.checkpoint(job, JobStage::Queued)?;
        let model = self.models.acquire(request.variant).await?;
        let result = self.run_stages(job, &model).await;
        self.models.release(model);

        let result_ids = result?;
        *self.last_success.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        Ok(JobOutcome {
            job_id: request.id,
            result_ids,
            elapsed: job.admitted_at.elapsed(),
        })
    }

    async fn run_stages(
        &self,
        job: &PipelineJob,
        model: &ModelHandle,
    ) -> Result<Vec<ResultId>, ServiceError> {
        let request = &job.request;
        let settings = &self.settings;

        self.advance(job, JobStage::Parsing)?;
        let parse = self
            .stage(
                job,
                JobStage::Parsing,
                settings.parse_timeout,
                self.backend.parse(model, &request.subject),
            )
            .await?;

        self.advance(job, JobStage::PoseEstimating)?;
        let pose = self
            .stage(
                job,
                JobStage::PoseEstimating,
                settings.pose_timeout,
                self.backend.estimate_pose(model, &request.subject),
            )
            .await?;

        self.advance(job, JobStage::Synthesizing)?;
        let input = SynthesisInput {
            subject: &request.subject,
            garment: &request.garment,
            parse: &parse,
            pose: &pose,
            category: request.category,
            params: &request.params,
            width: settings.output_width,
            height: settings.output_height,
        };
        let images = self
            .stage(
                job,
                JobStage::Synthesizing,
                settings.synthesize_timeout,
                self.backend.synthesize(model, input),
            )
            .await?;

        self.advance(job, JobStage::Postprocessing)?;
        let ids = self
            .stage(
                job,
                JobStage::Postprocessing,
                settings.postprocess_timeout,
                self.postprocess(job, images),
            )
            .await?;

        Ok(ids)
    }

    /// Stop here if the job was cancelled or ran out of time.
    fn checkpoint(&self, job: &PipelineJob, stage: JobStage) -> Result<(), ProcessingError> {
        match job.cancel_reason() {
            Some(reason) => Err(ProcessingError {
                job_id: job.id(),
                stage,
                failure: StageFailure::Cancelled(reason),
            }),
            None => Ok(()),
        }
    }

    /// Move to the next stage, unless the job must stop.
    fn advance(&self, job: &PipelineJob, next: JobStage) -> Result<(), ProcessingError> {
        let current = self.jobs.get(&job.id()).unwrap_or(JobStage::Queued);
        self.checkpoint(job, current)?;
        self.jobs.set(job.id(), next);
        tracing::debug!(job_id = %job.id(), from = %current, to = %next, "Stage transition");
        Ok(())
    }

    /// Run one stage under its timeout, clamped to the job deadline.
    async fn stage<T, E, F>(
        &self,
        job: &PipelineJob,
        stage: JobStage,
        limit: Duration,
        future: F,
    ) -> Result<T, ProcessingError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<StageFailure>,
    {
        let remaining = job.deadline.saturating_duration_since(Instant::now());
        let (limit, hits_deadline) = if remaining < limit {
            (remaining, true)
        } else {
            (limit, false)
        };

        let failure = match tokio::time::timeout(limit, future).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.into(),
            Err(_) if hits_deadline => StageFailure::Cancelled(CancelReason::JobTimeout),
            Err(_) => StageFailure::Timeout(limit),
        };

        Err(ProcessingError {
            job_id: job.id(),
            stage,
            failure,
        })
    }

    /// Re-encode every synthesized image to PNG and store it.
    async fn postprocess(
        &self,
        job: &PipelineJob,
        images: Vec<Bytes>,
    ) -> Result<Vec<ResultId>, StageFailure> {
        let store = self.store.clone();
        let request = &job.request;
        let template = ArtifactTemplate {
            job_id: request.id,
            variant: request.variant,
            category: request.category,
            params: request.params,
        };
        let cancel = job.cancel.clone();
        // Set when this future is dropped, e.g. by the stage timeout.
        let abandoned = AbandonOnDrop(Arc::new(AtomicBool::new(false)));
        let stop = abandoned.0.clone();

        tokio::task::spawn_blocking(move || {
            encode_and_store(&store, &images, &template, || {
                if stop.load(Ordering::Acquire) {
                    Some(StageFailure::Storage("postprocessing abandoned".to_string()))
                } else if cancel.load(Ordering::Acquire) {
                    Some(StageFailure::Cancelled(CancelReason::Disconnected))
                } else {
                    None
                }
            })
        })
        .await
        .map_err(|e| StageFailure::Storage(format!("postprocessing task failed: {}", e)))?
    }
}

/// Generation metadata shared by every sample of a job.
struct ArtifactTemplate {
    job_id: Uuid,
    variant: Variant,
    category: Category,
    params: SamplingParams,
}

struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Decode, re-encode to PNG and store each image. `stopped` is asked before
/// every write; once it answers, nothing more is stored.
fn encode_and_store(
    store: &ResultStore,
    images: &[Bytes],
    template: &ArtifactTemplate,
    stopped: impl Fn() -> Option<StageFailure>,
) -> Result<Vec<ResultId>, StageFailure> {
    let mut ids = Vec::with_capacity(images.len());
    for (index, raw) in images.iter().enumerate() {
        let decoded = image::load_from_memory(raw).map_err(|e| {
            StageFailure::Backend(format!("sample {} is not a valid image: {}", index, e))
        })?;

        let mut png = Vec::new();
        decoded
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| StageFailure::Storage(format!("PNG encoding failed: {}", e)))?;

        if let Some(failure) = stopped() {
            tracing::debug!(
                job_id = %template.job_id,
                stored = ids.len(),
                total = images.len(),
                "Postprocessing stopped: {}",
                failure
            );
            return Err(failure);
        }

        let metadata = ArtifactMetadata {
            job_id: template.job_id,
            variant: template.variant,
            category: template.category,
            sample_index: index as u32,
            steps: template.params.steps,
            guidance_scale: template.params.guidance_scale,
            seed: template.params.seed,
            width: decoded.width(),
            height: decoded.height(),
            created_at: Utc::now(),
        };
        let id = store
            .store(&png, &metadata)
            .map_err(|e| StageFailure::Storage(e.to_string()))?;
        ids.push(id);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{test_request, ScriptedBackend};
    use tryon_common::Variant;

    struct Harness {
        orchestrator: Orchestrator,
        backend: Arc<ScriptedBackend>,
        store: Arc<ResultStore>,
        _dir: tempfile::TempDir,
    }

    fn settings(devices: &[&str], capacity: usize) -> OrchestratorSettings {
        OrchestratorSettings {
            devices: devices.iter().map(|d| d.to_string()).collect(),
            max_concurrent_jobs: capacity,
            parse_timeout: Duration::from_secs(5),
            pose_timeout: Duration::from_secs(5),
            synthesize_timeout: Duration::from_secs(5),
            postprocess_timeout: Duration::from_secs(5),
            job_timeout: Duration::from_secs(10),
            output_width: 64,
            output_height: 96,
        }
    }

    fn harness(backend: ScriptedBackend, settings: OrchestratorSettings) -> Harness {
        harness_with(backend, settings, |_| {})
    }

    fn harness_with(
        backend: ScriptedBackend,
        settings: OrchestratorSettings,
        tweak: impl FnOnce(&mut Config),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(backend);

        let mut config = Config::default();
        config.accelerator.devices = settings.devices.clone();
        tweak(&mut config);
        let models = Arc::new(ModelManager::new(&config, backend.clone()));
        let store = Arc::new(ResultStore::open(dir.path(), Duration::from_secs(3600)).unwrap());
        let orchestrator = Orchestrator::start(settings, models, backend.clone(), store.clone());

        Harness {
            orchestrator,
            backend,
            store,
            _dir: dir,
        }
    }

    async fn wait_until_idle(orchestrator: &Orchestrator) {
        for _ in 0..200 {
            if orchestrator.queue_depth() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("orchestrator never drained");
    }

    #[tokio::test]
    async fn test_job_runs_all_stages_and_stores_results() {
        let h = harness(ScriptedBackend::new(), settings(&["cuda:0"], 1));
        let mut request = test_request(Variant::HalfBody);
        request.params.samples = 2;

        let mut ticket = h.orchestrator.submit(request).unwrap();
        let outcome = ticket.wait().await.unwrap();

        assert_eq!(outcome.result_ids.len(), 2);
        assert_eq!(h.backend.stage_calls(), vec!["parse", "pose", "synthesize"]);
        for id in &outcome.result_ids {
            let artifact = h.store.fetch(id.as_str()).unwrap();
            assert_eq!(image::guess_format(&artifact.png).unwrap(), ImageFormat::Png);
            let metadata = artifact.metadata.unwrap();
            assert_eq!((metadata.width, metadata.height), (64, 96));
            assert_eq!(metadata.job_id, outcome.job_id);
        }
        assert_eq!(h.orchestrator.queue_depth(), 0);
        assert!(h.orchestrator.since_last_success().is_some());
        assert_eq!(h.orchestrator.job_status(&outcome.job_id), None);
    }

    #[tokio::test]
    async fn test_admission_rejects_beyond_capacity() {
        let backend = ScriptedBackend::new().with_stage_delay("synthesize", Duration::from_millis(300));
        let h = harness(backend, settings(&["cuda:0"], 1));

        let mut first = h.orchestrator.submit(test_request(Variant::HalfBody)).unwrap();
        let second = h.orchestrator.submit(test_request(Variant::HalfBody));

        assert_eq!(
            second.unwrap_err(),
            ResourceError::QueueFull {
                device: "cuda:0".to_string(),
                capacity: 1
            }
        );
        assert_eq!(h.orchestrator.queue_depth(), 1);

        first.wait().await.unwrap();
        assert_eq!(h.orchestrator.queue_depth(), 0);
        assert!(h.orchestrator.submit(test_request(Variant::HalfBody)).is_ok());
    }

    #[tokio::test]
    async fn test_synthesis_timeout_fails_job_and_frees_slot() {
        let backend = ScriptedBackend::new().with_stage_delay("synthesize", Duration::from_secs(2));
        let mut settings = settings(&["cuda:0"], 1);
        settings.synthesize_timeout = Duration::from_millis(50);
        let h = harness(backend, settings);

        let mut ticket = h.orchestrator.submit(test_request(Variant::HalfBody)).unwrap();
        assert_eq!(h.orchestrator.queue_depth(), 1);

        match ticket.wait().await {
            Err(ServiceError::Processing(e)) => {
                assert_eq!(e.stage, JobStage::Synthesizing);
                assert_eq!(e.failure, StageFailure::Timeout(Duration::from_millis(50)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(h.orchestrator.queue_depth(), 0);
        assert!(h.orchestrator.since_last_success().is_none());
    }

    #[tokio::test]
    async fn test_stage_error_is_not_retried() {
        let backend = ScriptedBackend::new().failing_stage("parse");
        let h = harness(backend, settings(&["cuda:0"], 1));

        let mut ticket = h.orchestrator.submit(test_request(Variant::HalfBody)).unwrap();
        match ticket.wait().await {
            Err(ServiceError::Processing(e)) => {
                assert_eq!(e.stage, JobStage::Parsing);
                assert!(matches!(e.failure, StageFailure::Backend(_)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(h.backend.stage_calls(), vec!["parse"]);
    }

    #[test]
    fn test_lane_capacities_split_the_total() {
        assert_eq!(lane_capacities(1, 1), vec![1]);
        assert_eq!(lane_capacities(2, 2), vec![1, 1]);
        assert_eq!(lane_capacities(2, 3), vec![2, 1]);
        assert_eq!(lane_capacities(3, 1), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_busy_device_does_not_block_another() {
        let backend = ScriptedBackend::new().with_stage_delay("synthesize", Duration::from_millis(300));
        let h = harness_with(backend, settings(&["cuda:0", "cuda:1"], 2), |config| {
            config.variants.dc.device = Some("cuda:1".to_string());
        });
        assert_eq!(h.orchestrator.capacity(), 2);

        let mut hd = h.orchestrator.submit(test_request(Variant::HalfBody)).unwrap();
        let second_hd = h.orchestrator.submit(test_request(Variant::HalfBody));
        assert_eq!(
            second_hd.unwrap_err(),
            ResourceError::QueueFull {
                device: "cuda:0".to_string(),
                capacity: 1
            }
        );

        let mut dc = h.orchestrator.submit(test_request(Variant::FullBody)).unwrap();
        assert_eq!(h.orchestrator.queue_depth(), 2);

        hd.wait().await.unwrap();
        dc.wait().await.unwrap();
        assert_eq!(h.orchestrator.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_dropped_ticket_cancels_queued_job() {
        // Two slots on one lane, so the second job queues behind the first.
        let backend = ScriptedBackend::new().with_stage_delay("synthesize", Duration::from_millis(200));
        let h = harness(backend, settings(&["cuda:0"], 2));

        let mut first = h.orchestrator.submit(test_request(Variant::HalfBody)).unwrap();
        let second = h.orchestrator.submit(test_request(Variant::HalfBody)).unwrap();
        let second_id = second.job_id();
        assert_eq!(h.orchestrator.job_status(&second_id), Some(JobStage::Queued));
        drop(second);

        first.wait().await.unwrap();
        wait_until_idle(&h.orchestrator).await;

        assert_eq!(h.backend.calls_to("parse"), 1);
        assert_eq!(h.orchestrator.job_status(&second_id), None);
    }

    #[tokio::test]
    async fn test_dropped_ticket_cancels_running_job_between_stages() {
        let backend = ScriptedBackend::new().with_stage_delay("parse", Duration::from_millis(200));
        let h = harness(backend, settings(&["cuda:0"], 1));

        let ticket = h.orchestrator.submit(test_request(Variant::HalfBody)).unwrap();
        let id = ticket.job_id();
        for _ in 0..100 {
            if h.orchestrator.job_status(&id) == Some(JobStage::Parsing) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.orchestrator.job_status(&id), Some(JobStage::Parsing));
        drop(ticket);

        wait_until_idle(&h.orchestrator).await;
        assert_eq!(h.backend.stage_calls(), vec!["parse"]);
        assert_eq!(h.orchestrator.job_status(&id), None);
        assert!(h.orchestrator.since_last_success().is_none());
    }

    #[tokio::test]
    async fn test_panicking_stage_fails_only_that_job() {
        let backend = ScriptedBackend::new().panicking_stage("pose");
        let h = harness(backend, settings(&["cuda:0"], 1));

        let mut ticket = h.orchestrator.submit(test_request(Variant::HalfBody)).unwrap();
        let id = ticket.job_id();
        match ticket.wait().await {
            Err(ServiceError::Processing(e)) => {
                assert_eq!(e.stage, JobStage::PoseEstimating);
                assert_eq!(e.code(), "stage_failed");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert!(h.orchestrator.lanes_alive());
        assert_eq!(h.orchestrator.job_status(&id), None);
        assert_eq!(h.orchestrator.queue_depth(), 0);
        // The lane still takes work.
        assert!(h.orchestrator.submit(test_request(Variant::HalfBody)).is_ok());
    }

    #[test]
    fn test_stopped_postprocessing_stores_nothing_more() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path(), Duration::from_secs(3600)).unwrap();
        let request = test_request(Variant::HalfBody);
        let template = ArtifactTemplate {
            job_id: request.id,
            variant: request.variant,
            category: request.category,
            params: request.params,
        };
        let images = vec![
            crate::test_util::encoded_image(ImageFormat::Jpeg, 8, 8),
            crate::test_util::encoded_image(ImageFormat::Jpeg, 8, 8),
        ];

        let asked = std::sync::atomic::AtomicUsize::new(0);
        let err = encode_and_store(&store, &images, &template, || {
            // Let the first sample through, then give up.
            if asked.fetch_add(1, Ordering::SeqCst) == 0 {
                None
            } else {
                Some(StageFailure::Storage("postprocessing abandoned".to_string()))
            }
        })
        .unwrap_err();

        assert!(matches!(err, StageFailure::Storage(_)));
        let pngs = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "png"))
            .count();
        assert_eq!(pngs, 1);
    }

    #[test]
    fn test_disconnect_during_postprocessing_is_a_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path(), Duration::from_secs(3600)).unwrap();
        let request = test_request(Variant::HalfBody);
        let template = ArtifactTemplate {
            job_id: request.id,
            variant: request.variant,
            category: request.category,
            params: request.params,
        };
        let images = vec![crate::test_util::encoded_image(ImageFormat::Png, 8, 8)];

        let err = encode_and_store(&store, &images, &template, || {
            Some(StageFailure::Cancelled(CancelReason::Disconnected))
        })
        .unwrap_err();
        assert_eq!(err, StageFailure::Cancelled(CancelReason::Disconnected));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_job_deadline_cancels_running_job() {
        let backend = ScriptedBackend::new().with_stage_delay("synthesize", Duration::from_secs(2));
        let mut settings = settings(&["cuda:0"], 1);
        settings.job_timeout = Duration::from_millis(100);
        let h = harness(backend, settings);

        let mut ticket = h.orchestrator.submit(test_request(Variant::HalfBody)).unwrap();
        match ticket.wait().await {
            Err(ServiceError::Processing(e)) => {
                assert_eq!(e.failure, StageFailure::Cancelled(CancelReason::JobTimeout));
                assert_eq!(e.code(), "job_timeout");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(h.orchestrator.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_model_load_failure_fails_job() {
        let backend = ScriptedBackend::new().failing_loads(u32::MAX);
        let h = harness(backend, settings(&["cuda:0"], 1));

        let mut ticket = h.orchestrator.submit(test_request(Variant::FullBody)).unwrap();
        let err = ticket.wait().await.unwrap_err();
        assert!(matches!(err, ServiceError::ModelLoad(_)), "{err}");
        assert!(h.backend.stage_calls().is_empty());
        assert_eq!(h.orchestrator.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_status_tracks_running_stage() {
        let backend = ScriptedBackend::new().with_stage_delay("synthesize", Duration::from_millis(300));
        let h = harness(backend, settings(&["cuda:0"], 1));

        let mut ticket = h.orchestrator.submit(test_request(Variant::HalfBody)).unwrap();
        let id = ticket.job_id();

        let mut seen = None;
        for _ in 0..100 {
            if h.orchestrator.job_status(&id) == Some(JobStage::Synthesizing) {
                seen = Some(JobStage::Synthesizing);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen, Some(JobStage::Synthesizing));

        ticket.wait().await.unwrap();
        assert!(h.orchestrator.lanes_alive());
    }
}
