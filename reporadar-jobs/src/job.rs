//! The job data model.
//!
//! A job has an immutable identity and an evolving lifecycle. The durable
//! representation lives in [`crate::backend::Job`]; this module provides the
//! identifiers, statuses, and the typed view handed to processors.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::backend;

pub mod options;
pub(crate) mod runner;

/// The identifier of a job, assigned by the backend at enqueue time.
///
/// Unique for the lifetime of the backing store, including across process
/// restarts.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i32);

impl From<i32> for JobId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<JobId> for i32 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// The lifecycle status of a job.
///
/// `Queued → Processing → {Completed | Queued (retry) | Failed}`, with any
/// non-terminal status transitioning to `Cancelled` on request.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether no further automatic transition can occur from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = UnknownJobStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(UnknownJobStatus(s.to_owned())),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown job status `{0}`")]
pub struct UnknownJobStatus(String);

/// A single recorded execution failure.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// The attempt during which this error occurred.
    pub attempt: u16,
    pub kind: ErrorKind,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// The category of a recorded failure.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The processor panicked.
    Panic,
    /// The job was left `processing` past the stale-claim threshold,
    /// typically by a crashed worker.
    StaleClaim,
    Other(String),
}

/// A job with its payload decoded to the processor's data type.
///
/// This is a local view of the durable record: the backend remains
/// authoritative and the view is never written back directly.
#[derive(Debug)]
pub struct Job<D> {
    pub id: JobId,
    pub status: JobStatus,
    pub kind: String,
    pub data: D,
    pub progress: u8,
    pub attempt: u16,
    pub max_attempts: u16,
    pub priority: u16,
    pub errors: Vec<JobError>,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl<D> TryFrom<backend::Job> for Job<D>
where
    D: DeserializeOwned,
{
    type Error = serde_json::Error;

    fn try_from(value: backend::Job) -> Result<Self, Self::Error> {
        let data = serde_json::from_value(value.data)?;
        Ok(Self {
            id: value.id,
            status: value.status,
            kind: value.kind,
            data,
            progress: value.progress,
            attempt: value.attempt,
            max_attempts: value.max_attempts,
            priority: value.priority,
            errors: value.errors,
            inserted_at: value.inserted_at,
            scheduled_at: value.scheduled_at,
            started_at: value.started_at,
            completed_at: value.completed_at,
        })
    }
}

impl<D> Job<D> {
    /// Whether another execution attempt is permitted after a failure.
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts && !self.status.is_terminal()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("pending".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn typed_view_decodes_payload() {
        let raw = backend::Job::raw_job();
        let job: Job<String> = raw.try_into().unwrap();
        assert_eq!(job.data, "data");
        assert_eq!(job.attempt, 0);
        assert!(job.can_retry());
    }

    #[test]
    fn typed_view_rejects_mismatched_payload() {
        let raw = backend::Job::raw_job();
        assert!(Job::<u64>::try_from(raw).is_err());
    }
}
