//! The contract between the queue and its durable backing store.
//!
//! The backing store is the single source of truth for job state. Every
//! state transition goes through a [`Backend`] method and is persisted
//! before the transition is reported as having occurred, which is what makes
//! the queue safe across process restarts and across multiple application
//! instances sharing one store.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{ErrorKind, JobError, JobId, JobStatus};

pub mod memory;
pub mod testing;

#[async_trait]
pub trait Backend: Clone {
    /// A stream of jobs ready for execution.
    ///
    /// Every yielded job has already been atomically claimed: its status
    /// moved `queued → processing` and its attempt counter incremented in
    /// the store before the job is handed out. A job claimed through one
    /// stream is never concurrently yielded by another, including streams
    /// held by other processes sharing the store.
    ///
    /// Eligibility: `scheduled_at` elapsed, highest priority first, ties
    /// broken by insertion order.
    async fn subscribe_ready_jobs(
        &self,
    ) -> Pin<Box<dyn Stream<Item = Result<Job, BackendError>> + Send>>;

    /// Persist a new job in `queued` state and return its snapshot.
    async fn enqueue(&self, job: EnqueuableJob) -> Result<Job, BackendError>;

    /// Read a job's current durable state. Never mutates.
    async fn job(&self, id: JobId) -> Result<Option<Job>, BackendError>;

    /// Transition `processing → completed`, recording the result and
    /// forcing progress to 100.
    ///
    /// A no-op if the job is no longer `processing` (e.g. it was cancelled
    /// while executing); terminal states are never overwritten.
    async fn mark_job_complete(
        &self,
        id: JobId,
        result: serde_json::Value,
    ) -> Result<(), BackendError>;

    /// Transition `processing → queued` for a retry at `next_attempt_at`,
    /// appending the error to the job's failure history.
    async fn mark_job_retryable(
        &self,
        id: JobId,
        next_attempt_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Result<(), BackendError>;

    /// Transition `processing → failed` permanently, appending the error.
    async fn mark_job_failed(&self, id: JobId, error: ExecutionError) -> Result<(), BackendError>;

    /// Cancel a job if it is not already terminal.
    ///
    /// Returns `true` if the job transitioned to `cancelled`, `false` if it
    /// was already terminal. Cancellation is cooperative: an in-flight
    /// processor keeps running, but no further status transition will be
    /// applied on its behalf.
    async fn mark_job_cancelled(&self, id: JobId) -> Result<bool, BackendError>;

    /// Record a progress report for a `processing` job.
    ///
    /// Rejects reports for jobs not currently `processing` and reports that
    /// would decrease the stored value.
    async fn update_progress(&self, id: JobId, progress: u8) -> Result<(), BackendError>;

    /// Aggregate counts over the current durable state, never a cached
    /// snapshot.
    async fn stats(&self) -> Result<QueueStats, BackendError>;

    /// Permanently remove terminal jobs whose `completed_at` is older than
    /// the threshold. Returns the number of jobs removed. Safe to run
    /// concurrently with dispatch.
    async fn prune_jobs(&self, older_than: TimeDelta) -> Result<usize, BackendError>;

    /// Re-queue jobs stranded in `processing` longer than `stale_after`,
    /// or fail them if their attempts are exhausted. Returns the number of
    /// jobs recovered.
    ///
    /// This is the crash-recovery path: a worker that dies mid-execution
    /// leaves its claim behind, and the claim is only reclaimed once it is
    /// demonstrably stale.
    async fn recover_stale_jobs(&self, stale_after: TimeDelta) -> Result<usize, BackendError>;
}

/// The durable representation of a job.
///
/// This is the snapshot returned by read operations and the form persisted
/// by backends; serialization round-trips losslessly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: String,
    pub data: serde_json::Value,
    pub status: JobStatus,
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub errors: Vec<JobError>,
    pub attempt: u16,
    pub max_attempts: u16,
    pub priority: u16,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The last recorded failure, present only for `failed` jobs.
    ///
    /// Earlier attempts' errors remain in [`Job::errors`] as history even
    /// when a later attempt succeeded.
    pub fn error(&self) -> Option<&JobError> {
        match self.status {
            JobStatus::Failed => self.errors.last(),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.scheduled_at <= now
    }
}

/// A job as submitted for persistence, before the backend assigns its id.
#[derive(Debug, Clone)]
pub struct EnqueuableJob {
    pub kind: String,
    pub data: serde_json::Value,
    pub max_attempts: u16,
    pub priority: u16,
    pub scheduled_at: DateTime<Utc>,
}

impl EnqueuableJob {
    /// The initial durable record for this submission.
    pub fn into_job(self, id: JobId) -> Job {
        Job {
            id,
            kind: self.kind,
            data: self.data,
            status: JobStatus::Queued,
            progress: 0,
            result: None,
            errors: Vec::new(),
            attempt: 0,
            max_attempts: self.max_attempts.max(1),
            priority: self.priority,
            inserted_at: Utc::now(),
            scheduled_at: self.scheduled_at,
            started_at: None,
            attempted_at: None,
            completed_at: None,
        }
    }
}

/// An execution failure as reported to the backend, stamped with the
/// attempt number and timestamp when recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn into_job_error(self, attempt: u16) -> JobError {
        JobError {
            attempt,
            kind: self.kind,
            message: self.message,
            recorded_at: Utc::now(),
        }
    }
}

/// Aggregate queue counts.
///
/// `waiting` covers queued jobs whose schedule has elapsed; `delayed` covers
/// queued jobs still waiting out their delay or retry backoff.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("error encoding or decoding job data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("no job found with id {0}")]
    JobNotFound(JobId),
    #[error("invalid progress update for job {id}: {detail}")]
    InvalidProgress { id: JobId, detail: String },
    #[error("cannot reach the backing store: {0}")]
    Connection(String),
    #[error("system in bad state")]
    BadState,
}

#[cfg(test)]
impl Job {
    pub(crate) fn raw_job() -> Self {
        EnqueuableJob {
            kind: "raw_job".to_owned(),
            data: serde_json::Value::String("data".to_owned()),
            max_attempts: 3,
            priority: 0,
            scheduled_at: Utc::now(),
        }
        .into_job(JobId::from(0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serde_round_trip_is_lossless() {
        let mut job = Job::raw_job();
        job.status = JobStatus::Failed;
        job.attempt = 2;
        job.progress = 40;
        job.errors.push(
            ExecutionError {
                kind: ErrorKind::Other("custom".to_owned()),
                message: "boom".to_owned(),
            }
            .into_job_error(2),
        );
        job.started_at = Some(Utc::now());
        job.completed_at = Some(Utc::now());

        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn error_is_only_exposed_for_failed_jobs() {
        let mut job = Job::raw_job();
        job.errors.push(
            ExecutionError {
                kind: ErrorKind::Panic,
                message: "first attempt panicked".to_owned(),
            }
            .into_job_error(1),
        );

        job.status = JobStatus::Completed;
        job.result = Some(serde_json::json!({"ok": true}));
        assert!(job.error().is_none());

        job.status = JobStatus::Failed;
        job.result = None;
        assert_eq!(job.error().unwrap().message, "first attempt panicked");
    }

    #[test]
    fn enqueuable_job_initial_state() {
        let job = Job::raw_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.progress, 0);
        assert!(job.result.is_none() && job.errors.is_empty());
        assert!(job.started_at.is_none() && job.completed_at.is_none());
    }
}
