//! The contract for the handlers that perform a job's actual work.
//!
//! A [`Processor`] is bound to a job kind by [`Processor::NAME`] and isolates
//! business logic from queue mechanics: it receives a decoded [`Job`], may
//! report progress through the [`ProgressHandle`] it is given, and returns a
//! result or an error. Errors and panics are caught at the queue boundary and
//! routed into the retry/failure path; they never escape the dispatch loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{
    backend::{self, Backend, BackendError},
    job::{Job, JobId},
    QueueError,
};

/// A handler performing the work for one job kind.
///
/// # Example
///
/// ```
/// # use reporadar_jobs::prelude::*;
/// # use serde::{Deserialize, Serialize};
/// #[derive(Serialize, Deserialize)]
/// struct AnalysisRequest {
///     repository: String,
/// }
///
/// struct AnalysisProcessor;
///
/// #[async_trait::async_trait]
/// impl Processor for AnalysisProcessor {
///     type Data = AnalysisRequest;
///     type Output = u32;
///     const NAME: &'static str = "repository_analysis";
///
///     async fn process(
///         &self,
///         job: Job<Self::Data>,
///         progress: ProgressHandle,
///     ) -> Result<Self::Output, ProcessorError> {
///         progress.update(50).await.map_err(ProcessorError::from_queue)?;
///         Ok(job.data.repository.len() as u32)
///     }
/// }
/// ```
#[async_trait]
pub trait Processor {
    /// The type of the job payload.
    type Data: DeserializeOwned + Send;
    /// The type of the result recorded on successful completion.
    type Output: Serialize + Send;

    /// The job kind this processor handles.
    ///
    /// This associates jobs stored in the backend with this processor, so it
    /// must be unique within a queue and stable across deploys; renaming the
    /// Rust type does not break the association.
    const NAME: &'static str;

    /// The maximum number of execution attempts before a job of this kind is
    /// permanently failed. Can be overridden per job via
    /// [`crate::job::options::JobOptions::with_max_attempts`].
    const MAX_ATTEMPTS: u16 = 3;

    /// Perform the work for one job.
    ///
    /// Returning `Err` (or panicking) marks the attempt as failed; the queue
    /// then retries with backoff or fails the job permanently once attempts
    /// are exhausted.
    async fn process(
        &self,
        job: Job<Self::Data>,
        progress: ProgressHandle,
    ) -> Result<Self::Output, ProcessorError>;

    /// Hook invoked after a successful attempt, before the completion is
    /// persisted. For observability only; completion does not depend on it.
    async fn on_complete(&self, _job_id: JobId, _output: &Self::Output) {}

    /// Hook invoked after a failed attempt. For observability only; the
    /// retry/failure handling does not depend on it.
    async fn on_error(&self, _job_id: JobId, _error: &ProcessorError) {}
}

#[async_trait]
impl<P> Processor for Arc<P>
where
    P: Processor + Send + Sync,
    P::Data: Sync,
    // The hooks borrow the output across an await, so the delegating
    // futures are only `Send` when the output is `Sync`.
    P::Output: Sync,
{
    type Data = P::Data;
    type Output = P::Output;
    const NAME: &'static str = P::NAME;
    const MAX_ATTEMPTS: u16 = P::MAX_ATTEMPTS;

    async fn process(
        &self,
        job: Job<Self::Data>,
        progress: ProgressHandle,
    ) -> Result<Self::Output, ProcessorError> {
        self.as_ref().process(job, progress).await
    }

    async fn on_complete(&self, job_id: JobId, output: &Self::Output) {
        self.as_ref().on_complete(job_id, output).await;
    }

    async fn on_error(&self, job_id: JobId, error: &ProcessorError) {
        self.as_ref().on_error(job_id, error).await;
    }
}

/// An error returned by [`Processor::process`].
///
/// The message is recorded in the job's error history and, on permanent
/// failure, remains queryable until the job is cleaned up.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProcessorError {
    kind: &'static str,
    message: String,
}

impl ProcessorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: "processor",
            message: message.into(),
        }
    }

    pub fn with_kind(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Wrap an underlying error, keeping its message.
    pub fn from_err(error: impl std::error::Error) -> Self {
        Self::new(error.to_string())
    }

    /// Wrap a queue error encountered inside a processor, e.g. from
    /// [`ProgressHandle::update`].
    pub fn from_queue(error: QueueError) -> Self {
        Self::with_kind("queue", error.to_string())
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn decode(error: serde_json::Error) -> Self {
        Self::with_kind("decode", error.to_string())
    }
}

/// The sanctioned path for a processor to report progress on the job it is
/// currently executing.
///
/// Progress is persisted through the backend, so it is visible to status
/// polls from any instance. Reports are validated: values above 100,
/// decreasing values, and reports against a job that is no longer
/// `processing` are rejected. The latter doubles as the cooperative
/// cancellation signal: once a job is cancelled its progress reports fail,
/// letting a processor that checks the result abandon the work.
#[derive(Clone)]
pub struct ProgressHandle {
    job_id: JobId,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressHandle {
    pub(crate) fn new<B>(job_id: JobId, backend: B) -> Self
    where
        B: Backend + Send + Sync + 'static,
    {
        Self {
            job_id,
            sink: Arc::new(BackendSink(backend)),
        }
    }

    /// Record a progress value in `0..=100` for the current job.
    ///
    /// All rejected reports surface as [`QueueError::InvalidProgress`],
    /// whether caught here or by the backend's own validation.
    pub async fn update(&self, value: u8) -> Result<(), QueueError> {
        if value > 100 {
            return Err(QueueError::InvalidProgress(value));
        }
        match self.sink.record(self.job_id, value).await {
            Ok(()) => Ok(()),
            Err(BackendError::InvalidProgress { .. }) => Err(QueueError::InvalidProgress(value)),
            Err(error) => Err(error.into()),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

#[async_trait]
trait ProgressSink: Send + Sync {
    async fn record(&self, id: JobId, value: u8) -> Result<(), BackendError>;
}

struct BackendSink<B>(B);

#[async_trait]
impl<B> ProgressSink for BackendSink<B>
where
    B: Backend + Send + Sync,
{
    async fn record(&self, id: JobId, value: u8) -> Result<(), BackendError> {
        self.0.update_progress(id, value).await
    }
}

/// Object-safe adapter over a [`Processor`] so the queue can hold a registry
/// of processors for heterogeneous data types.
#[async_trait]
pub(crate) trait ErasedProcessor: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(
        &self,
        job: backend::Job,
        progress: ProgressHandle,
    ) -> Result<serde_json::Value, ProcessorError>;
}

pub(crate) struct Registered<P>(pub(crate) P);

#[async_trait]
impl<P> ErasedProcessor for Registered<P>
where
    P: Processor + Send + Sync,
    P::Data: Sync,
{
    fn name(&self) -> &'static str {
        P::NAME
    }

    async fn run(
        &self,
        job: backend::Job,
        progress: ProgressHandle,
    ) -> Result<serde_json::Value, ProcessorError> {
        let job_id = job.id;
        let job: Job<P::Data> = job.try_into().map_err(ProcessorError::decode)?;
        match self.0.process(job, progress).await {
            Ok(output) => {
                self.0.on_complete(job_id, &output).await;
                serde_json::to_value(output).map_err(ProcessorError::decode)
            }
            Err(error) => {
                self.0.on_error(job_id, &error).await;
                Err(error)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use super::*;

    /// Completes immediately, echoing back the length of its payload.
    pub(crate) struct SimpleProcessor;

    #[async_trait]
    impl Processor for SimpleProcessor {
        type Data = String;
        type Output = usize;
        const NAME: &'static str = "simple_processor";
        const MAX_ATTEMPTS: u16 = 2;

        async fn process(
            &self,
            job: Job<Self::Data>,
            _progress: ProgressHandle,
        ) -> Result<Self::Output, ProcessorError> {
            Ok(job.data.len())
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) enum Behaviour {
        Succeed,
        Panic,
        Fail { message: String },
        SucceedAfter { failures: u16 },
        ReportProgress { values: Vec<u8> },
    }

    /// Does whatever its payload tells it to; used to drive the queue's
    /// failure paths from tests.
    #[derive(Default)]
    pub(crate) struct ScriptedProcessor {
        pub(crate) executions: AtomicUsize,
        pub(crate) completions: Mutex<Vec<JobId>>,
        pub(crate) errors: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Processor for ScriptedProcessor {
        type Data = Behaviour;
        type Output = &'static str;
        const NAME: &'static str = "scripted_processor";
        const MAX_ATTEMPTS: u16 = 3;

        async fn process(
            &self,
            job: Job<Self::Data>,
            progress: ProgressHandle,
        ) -> Result<Self::Output, ProcessorError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            match job.data {
                Behaviour::Succeed => Ok("done"),
                Behaviour::Panic => panic!("job panicked"),
                Behaviour::Fail { message } => Err(ProcessorError::new(message)),
                Behaviour::SucceedAfter { failures } => {
                    if job.attempt <= failures {
                        Err(ProcessorError::new(format!(
                            "failing attempt {}",
                            job.attempt
                        )))
                    } else {
                        Ok("done")
                    }
                }
                Behaviour::ReportProgress { values } => {
                    for value in values {
                        progress
                            .update(value)
                            .await
                            .map_err(ProcessorError::from_queue)?;
                    }
                    Ok("done")
                }
            }
        }

        async fn on_complete(&self, job_id: JobId, _output: &Self::Output) {
            self.completions.lock().unwrap().push(job_id);
        }

        async fn on_error(&self, _job_id: JobId, error: &ProcessorError) {
            self.errors.lock().unwrap().push(error.message().to_owned());
        }
    }
}
