use std::{collections::HashMap, sync::Arc};

use chrono::{TimeDelta, Utc};
use tokio::task::JoinError;
use tracing::{instrument, Instrument};

use crate::{
    backend::{Backend, ExecutionError},
    backoff::Strategy,
    job::{ErrorKind, JobId},
    processor::{ErasedProcessor, ProcessorError, ProgressHandle},
};

const ERROR_TYPE_UNKNOWN_KIND: &str = "unknown_kind";

/// Executes claimed jobs and records their outcomes.
///
/// Each execution runs in its own task so a panicking processor takes down
/// only its own job, not the dispatch loop.
pub(crate) struct JobRunner<B> {
    backend: B,
    retry: Arc<dyn Strategy + Send + Sync>,
    processors: Arc<HashMap<&'static str, Arc<dyn ErasedProcessor>>>,
}

impl<B> JobRunner<B>
where
    B: Backend + Send + Sync + 'static,
{
    pub(crate) fn new(
        backend: B,
        retry: Arc<dyn Strategy + Send + Sync>,
        processors: Arc<HashMap<&'static str, Arc<dyn ErasedProcessor>>>,
    ) -> Self {
        Self {
            backend,
            retry,
            processors,
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind, attempt = job.attempt))]
    pub(crate) async fn execute_job(&self, job: crate::backend::Job) {
        let job_id = job.id;
        let is_final_attempt = job.attempt >= job.max_attempts;
        let delay = self.retry.backoff(job.attempt);

        let Some(processor) = self.processors.get(job.kind.as_str()).cloned() else {
            // Instances may register different processor sets; release the
            // claim through the retry path so an instance that does handle
            // this kind can pick the job up, failing it only once attempts
            // are exhausted.
            self.handle_job_error(
                is_final_attempt,
                job_id,
                delay,
                ExecutionError {
                    kind: ErrorKind::Other(ERROR_TYPE_UNKNOWN_KIND.to_owned()),
                    message: format!("no processor registered for job kind: {}", job.kind),
                },
            )
            .await;
            return;
        };

        let progress = ProgressHandle::new(job_id, self.backend.clone());
        tracing::debug!(%job_id, "Executing job {job_id}");
        let handle =
            tokio::spawn(async move { processor.run(job, progress).await }.in_current_span());

        match handle.await {
            Ok(Ok(result)) => self.handle_job_complete(job_id, result).await,
            Ok(Err(error)) => {
                self.handle_job_error(is_final_attempt, job_id, delay, error)
                    .await
            }
            Err(error) => {
                self.handle_job_error(is_final_attempt, job_id, delay, error)
                    .await
            }
        }
    }

    async fn handle_job_complete(&self, job_id: JobId, result: serde_json::Value) {
        tracing::debug!(%job_id, "Job complete {job_id}");
        let _ = self
            .backend
            .mark_job_complete(job_id, result)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as complete, error: {err:?}",
                )
            });
    }

    async fn handle_job_error(
        &self,
        is_final_attempt: bool,
        job_id: JobId,
        delay: TimeDelta,
        error: impl Into<ExecutionError>,
    ) {
        let error = error.into();
        if is_final_attempt {
            tracing::error!(
                %job_id,
                ?error,
                "Job {job_id} failed permanently: error kind: {:?}, message: {}",
                error.kind,
                error.message
            );
            self.record_failed(job_id, error).await;
        } else {
            tracing::warn!(
                %job_id,
                ?error,
                "Job {job_id} failed and will be retried in {delay}: error kind: {:?}, message: {}",
                error.kind,
                error.message
            );
            let _ = self
                .backend
                .mark_job_retryable(job_id, Utc::now() + delay, error)
                .await
                .inspect_err(|err| {
                    tracing::error!(
                        ?err,
                        %job_id,
                        "Failed to mark job {job_id} as retryable, error: {err:?}",
                    )
                });
        }
    }

    async fn record_failed(&self, job_id: JobId, error: ExecutionError) {
        let _ = self
            .backend
            .mark_job_failed(job_id, error)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as failed, error: {err:?}",
                )
            });
    }
}

impl From<JoinError> for ExecutionError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            kind: ErrorKind::Panic,
            message,
        }
    }
}

impl From<ProcessorError> for ExecutionError {
    fn from(value: ProcessorError) -> Self {
        Self {
            kind: ErrorKind::Other(value.kind().to_owned()),
            message: value.message().to_owned(),
        }
    }
}
