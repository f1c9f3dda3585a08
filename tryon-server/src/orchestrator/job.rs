//! Job lifecycle types.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, OwnedSemaphorePermit};
use uuid::Uuid;

use crate::error::{CancelReason, ProcessingError, ServiceError, StageFailure};
use crate::store::ResultId;
use crate::validate::ProcessingRequest;

/// Position of a job in the pipeline.
///
/// Jobs move strictly forward through `Queued → Parsing → PoseEstimating →
/// Synthesizing → Postprocessing → Completed`. `Failed` and `Cancelled` can
/// be entered from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStage {
    Queued,
    Parsing,
    PoseEstimating,
    Synthesizing,
    Postprocessing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Queued => "queued",
            JobStage::Parsing => "parsing",
            JobStage::PoseEstimating => "pose_estimating",
            JobStage::Synthesizing => "synthesizing",
            JobStage::Postprocessing => "postprocessing",
            JobStage::Completed => "completed",
            JobStage::Failed => "failed",
            JobStage::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Completed | JobStage::Failed | JobStage::Cancelled)
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful job produced.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub result_ids: Vec<ResultId>,
    /// Time from admission to completion.
    pub elapsed: Duration,
}

pub(crate) type JobResult = Result<JobOutcome, ServiceError>;

/// The work of an admitted job. Runs in its own task on the lane.
pub(crate) struct PipelineJob {
    pub request: ProcessingRequest,
    pub admitted_at: Instant,
    pub deadline: Instant,
    pub cancel: Arc<AtomicBool>,
}

/// An admitted job travelling down a device lane.
pub(crate) struct QueuedJob {
    pub job: PipelineJob,
    /// One admission slot on the lane. Dropped when the job stops using the
    /// accelerator.
    pub permit: OwnedSemaphorePermit,
    pub respond: oneshot::Sender<JobResult>,
}

impl PipelineJob {
    pub fn id(&self) -> Uuid {
        self.request.id
    }

    /// Why this job should stop, if it should.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        if self.cancel.load(Ordering::Acquire) {
            Some(CancelReason::Disconnected)
        } else if Instant::now() >= self.deadline {
            Some(CancelReason::JobTimeout)
        } else {
            None
        }
    }
}

/// Caller's side of a submitted job.
///
/// Dropping the ticket before the job finishes cancels it; the lane notices
/// at the next stage boundary.
#[derive(Debug)]
pub struct JobTicket {
    job_id: Uuid,
    cancel: Arc<AtomicBool>,
    receiver: oneshot::Receiver<JobResult>,
}

impl JobTicket {
    pub(crate) fn new(
        job_id: Uuid,
        cancel: Arc<AtomicBool>,
        receiver: oneshot::Receiver<JobResult>,
    ) -> Self {
        Self {
            job_id,
            cancel,
            receiver,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Wait for the job to finish.
    pub async fn wait(&mut self) -> Result<JobOutcome, ServiceError> {
        match (&mut self.receiver).await {
            Ok(result) => result,
            // The lane went away without answering.
            Err(_) => Err(ProcessingError {
                job_id: self.job_id,
                stage: JobStage::Cancelled,
                failure: StageFailure::Cancelled(CancelReason::Shutdown),
            }
            .into()),
        }
    }

    /// Cancel the job without waiting for it.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_stages() {
        assert!(JobStage::Completed.is_terminal());
        assert!(JobStage::Failed.is_terminal());
        assert!(JobStage::Cancelled.is_terminal());
        assert!(!JobStage::Synthesizing.is_terminal());
        assert_eq!(JobStage::PoseEstimating.to_string(), "pose_estimating");
    }

    #[tokio::test]
    async fn test_dropping_ticket_sets_cancel_flag() {
        let cancel = Arc::new(AtomicBool::new(false));
        let (_tx, rx) = oneshot::channel();
        let ticket = JobTicket::new(Uuid::new_v4(), cancel.clone(), rx);

        assert!(!cancel.load(Ordering::Acquire));
        drop(ticket);
        assert!(cancel.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_wait_reports_shutdown_when_lane_disappears() {
        let (tx, rx) = oneshot::channel::<JobResult>();
        let mut ticket = JobTicket::new(Uuid::new_v4(), Arc::new(AtomicBool::new(false)), rx);
        drop(tx);

        match ticket.wait().await {
            Err(ServiceError::Processing(e)) => {
                assert_eq!(e.failure, StageFailure::Cancelled(CancelReason::Shutdown));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
