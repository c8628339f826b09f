//! A persistent background job queue for RepoRadar.
//!
//! Long-running work (repository analysis, batch exports, and the like) is
//! submitted as jobs, stored durably in a [`backend::Backend`], and executed
//! by registered [`Processor`]s. Jobs survive process restarts, retry with
//! exponential backoff, report progress while running, and can be cancelled
//! before they start.
//!
//! # Example
//!
//! ```no_run
//! use reporadar_jobs::prelude::*;
//! use reporadar_jobs::backend::memory::InMemoryBackend;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct AnalysisRequest {
//!     repository: String,
//! }
//!
//! struct AnalysisProcessor;
//!
//! #[async_trait::async_trait]
//! impl Processor for AnalysisProcessor {
//!     type Data = AnalysisRequest;
//!     type Output = String;
//!     const NAME: &'static str = "repository_analysis";
//!
//!     async fn process(
//!         &self,
//!         job: Job<Self::Data>,
//!         progress: ProgressHandle,
//!     ) -> Result<Self::Output, ProcessorError> {
//!         progress.update(50).await.map_err(ProcessorError::from_queue)?;
//!         Ok(format!("analysed {}", job.data.repository))
//!     }
//! }
//!
//! # async fn example() -> Result<(), reporadar_jobs::QueueError> {
//! let mut queue = JobQueue::connect(InMemoryBackend::new(), QueueConfig::default())
//!     .await?
//!     .with_processor(AnalysisProcessor);
//! queue.start();
//!
//! let job_id = queue
//!     .enqueue::<AnalysisProcessor>(
//!         AnalysisRequest { repository: "rust-lang/rust".to_owned() },
//!         JobOptions::new(),
//!     )
//!     .await?;
//!
//! let status = queue.job_status(job_id).await?;
//! println!("job {job_id} is {status:?}");
//!
//! queue.close().await?;
//! # Ok(())
//! # }
//! ```

use std::{collections::HashMap, sync::Arc};

pub mod backend;
pub mod backoff;
pub mod config;
pub mod job;
pub mod maintenance;
pub mod prelude;
pub mod processor;

use backend::{Backend, BackendError, EnqueuableJob, QueueStats};
use chrono::TimeDelta;
use config::QueueConfig;
use futures::StreamExt;
use job::{runner::JobRunner, JobId, JobStatus};
use maintenance::MaintenanceRunner;
use processor::{ErasedProcessor, Processor, Registered};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The handle through which jobs are enqueued, inspected, and executed.
///
/// A queue is bound to one backend. Registering processors and starting the
/// dispatcher are optional: an instance that only registers handlers it
/// needs for [`JobQueue::enqueue`] and never calls [`JobQueue::start`] acts
/// as a pure producer, while a worker instance registers the same handlers
/// and starts the dispatcher. Multiple instances can share one backend;
/// atomic claiming guarantees each job executes on exactly one of them.
pub struct JobQueue<B: Backend> {
    backend: B,
    config: QueueConfig,
    processors: HashMap<&'static str, Arc<dyn ErasedProcessor>>,
    cancellation_token: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
}

impl<B> JobQueue<B>
where
    B: Backend + Send + Sync + 'static,
{
    /// Create a queue over the given backend, recovering any claims left
    /// behind by instances that died.
    pub async fn connect(backend: B, config: QueueConfig) -> Result<Self, QueueError> {
        let recovered = backend.recover_stale_jobs(config.stale_claim_after).await?;
        if recovered > 0 {
            tracing::warn!("Recovered {recovered} stale jobs from dead claims");
        }
        Ok(Self {
            backend,
            config,
            processors: Default::default(),
            cancellation_token: CancellationToken::new(),
            dispatcher: None,
        })
    }

    /// Register a processor for its job kind.
    ///
    /// Registering a second processor under the same [`Processor::NAME`]
    /// replaces the first.
    pub fn with_processor<P>(mut self, processor: P) -> Self
    where
        P: Processor + Send + Sync + 'static,
        P::Data: Sync,
    {
        if self
            .processors
            .insert(P::NAME, Arc::new(Registered(processor)))
            .is_some()
        {
            tracing::warn!(
                kind = P::NAME,
                "Replacing previously registered processor for {}",
                P::NAME
            );
        }
        self
    }

    /// Start dispatching ready jobs to registered processors.
    ///
    /// At most [`QueueConfig::with_concurrency`] jobs execute simultaneously;
    /// further ready jobs stay claimed-free in the backend until a slot
    /// opens. Also starts periodic maintenance if configured. Calling this
    /// more than once has no effect.
    pub fn start(&mut self) {
        if self.dispatcher.is_some() {
            return;
        }
        if let Some(maintenance) = self.config.maintenance.clone() {
            MaintenanceRunner::new(
                self.backend.clone(),
                maintenance,
                self.config.stale_claim_after,
            )
            .spawn(self.cancellation_token.child_token());
        }

        let backend = self.backend.clone();
        let runner = JobRunner::new(
            self.backend.clone(),
            Arc::clone(&self.config.retry),
            Arc::new(self.processors.clone()),
        );
        let concurrency = self.config.concurrency;
        let token = self.cancellation_token.clone();

        self.dispatcher = Some(tokio::spawn(async move {
            let stream = backend.subscribe_ready_jobs().await;
            stream
                .take_until(token.cancelled_owned())
                .for_each_concurrent(concurrency, |job| async {
                    match job {
                        Ok(job) => runner.execute_job(job).await,
                        Err(error) => {
                            tracing::error!(?error, "Failed to read job from backend: {error}")
                        }
                    }
                })
                .await;
            tracing::debug!("Job dispatcher shut down");
        }));
    }

    /// Persist a new job for processor `P` and return its id.
    ///
    /// The job kind must have a registered processor; this catches payload
    /// type mismatches at the submission boundary rather than at execution
    /// time.
    pub async fn enqueue<P>(
        &self,
        data: P::Data,
        options: job::options::JobOptions,
    ) -> Result<JobId, QueueError>
    where
        P: Processor,
        P::Data: Serialize,
    {
        if !self.processors.contains_key(P::NAME) {
            return Err(QueueError::UnknownJobType(P::NAME.to_owned()));
        }
        let job = self
            .backend
            .enqueue(EnqueuableJob {
                kind: P::NAME.to_owned(),
                data: serde_json::to_value(data)?,
                max_attempts: options.max_attempts_or(P::MAX_ATTEMPTS),
                priority: options.priority(),
                scheduled_at: options.scheduled_at_or_now(),
            })
            .await?;
        tracing::debug!(job_id = %job.id, kind = P::NAME, "Enqueued job {}", job.id);
        Ok(job.id)
    }

    /// Read a job's current durable snapshot, including progress, result,
    /// and error history.
    pub async fn job(&self, id: JobId) -> Result<Option<backend::Job>, QueueError> {
        Ok(self.backend.job(id).await?)
    }

    /// Read a job's current status.
    pub async fn job_status(&self, id: JobId) -> Result<JobStatus, QueueError> {
        self.backend
            .job(id)
            .await?
            .map(|job| job.status)
            .ok_or(QueueError::JobNotFound(id))
    }

    /// Cancel a job unless it has already finished.
    ///
    /// Idempotent: cancelling a terminal or nonexistent job is a no-op, not
    /// an error. Cancelling a `processing` job prevents its completion from
    /// being recorded but does not interrupt the running processor.
    pub async fn cancel_job(&self, id: JobId) -> Result<(), QueueError> {
        match self.backend.mark_job_cancelled(id).await {
            Ok(cancelled) => {
                if cancelled {
                    tracing::debug!(job_id = %id, "Cancelled job {id}");
                }
                Ok(())
            }
            Err(BackendError::JobNotFound(id)) => {
                tracing::debug!(job_id = %id, "Cancellation of unknown job {id} ignored");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Aggregate counts over the backend's current state.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.backend.stats().await?)
    }

    /// Immediately remove terminal jobs older than `older_than`, returning
    /// how many were removed.
    ///
    /// Usually this runs on the maintenance schedule instead, see
    /// [`QueueConfig::with_maintenance`].
    pub async fn cleanup(&self, older_than: TimeDelta) -> Result<usize, QueueError> {
        Ok(self.backend.prune_jobs(older_than).await?)
    }

    /// Stop claiming new jobs and wait for in-flight jobs to finish.
    ///
    /// Jobs still queued remain in the backend for the next instance. Fails
    /// with [`QueueError::GracefulShutdownFailed`] if in-flight jobs do not
    /// finish within [`QueueConfig::with_shutdown_timeout`].
    pub async fn close(mut self) -> Result<(), QueueError> {
        tracing::debug!("Shutting down job queue");
        self.cancellation_token.cancel();
        if let Some(dispatcher) = self.dispatcher.take() {
            tokio::time::timeout(self.config.shutdown_timeout, dispatcher)
                .await
                .map_err(|_| QueueError::GracefulShutdownFailed)?
                .map_err(|_| QueueError::GracefulShutdownFailed)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no processor registered for job kind: {0}")]
    UnknownJobType(String),
    #[error("invalid progress value {0}, must be between 0 and 100")]
    InvalidProgress(u8),
    #[error("no job found with id {0}")]
    JobNotFound(JobId),
    #[error("error communicating with the backend")]
    Backend(#[from] BackendError),
    #[error("error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
    #[error("failed to gracefully shut down")]
    GracefulShutdownFailed,
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        backend::memory::InMemoryBackend,
        job::options::JobOptions,
        processor::test::{ScriptedProcessor, SimpleProcessor},
    };

    #[tokio::test]
    async fn enqueue_requires_a_registered_processor() {
        let queue = JobQueue::connect(InMemoryBackend::new(), QueueConfig::default())
            .await
            .unwrap()
            .with_processor(SimpleProcessor);

        let error = queue
            .enqueue::<ScriptedProcessor>(
                crate::processor::test::Behaviour::Succeed,
                JobOptions::new(),
            )
            .await
            .unwrap_err();

        assert_matches!(error, QueueError::UnknownJobType(kind) => {
            assert_eq!(kind, ScriptedProcessor::NAME);
        });
    }

    #[tokio::test]
    async fn enqueued_jobs_are_readable_before_the_queue_starts() {
        let queue = JobQueue::connect(InMemoryBackend::new(), QueueConfig::default())
            .await
            .unwrap()
            .with_processor(SimpleProcessor);

        let job_id = queue
            .enqueue::<SimpleProcessor>("hello".to_owned(), JobOptions::new())
            .await
            .unwrap();

        assert_eq!(queue.job_status(job_id).await.unwrap(), JobStatus::Queued);
        let job = queue.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.kind, SimpleProcessor::NAME);
        assert_eq!(job.max_attempts, SimpleProcessor::MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn reading_a_missing_job_status_is_not_found() {
        let queue = JobQueue::connect(InMemoryBackend::new(), QueueConfig::default())
            .await
            .unwrap();

        let error = queue.job_status(JobId::from(42)).await.unwrap_err();

        assert_matches!(error, QueueError::JobNotFound(id) => assert_eq!(id, JobId::from(42)));
    }

    #[tokio::test]
    async fn close_without_start_succeeds() {
        let queue = JobQueue::connect(InMemoryBackend::new(), QueueConfig::default())
            .await
            .unwrap();

        assert!(queue.close().await.is_ok());
    }
}

#[cfg(test)]
mod lifecycle_test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        backend::memory::InMemoryBackend,
        backoff::BackoffStrategy,
        job::{options::JobOptions, ErrorKind, Job},
        processor::{
            test::{Behaviour, ScriptedProcessor},
            ProcessorError, ProgressHandle,
        },
    };

    fn fast_config() -> QueueConfig {
        QueueConfig::default()
            .with_retry_strategy(BackoffStrategy::constant(TimeDelta::milliseconds(10)))
    }

    async fn scripted_queue() -> (JobQueue<InMemoryBackend>, Arc<ScriptedProcessor>) {
        let processor = Arc::new(ScriptedProcessor::default());
        let mut queue = JobQueue::connect(InMemoryBackend::new(), fast_config())
            .await
            .unwrap()
            .with_processor(Arc::clone(&processor));
        queue.start();
        (queue, processor)
    }

    async fn wait_for_terminal(queue: &JobQueue<InMemoryBackend>, id: JobId) -> backend::Job {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let job = queue.job(id).await.unwrap().unwrap();
                if job.is_terminal() {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not reach a terminal status in time")
    }

    #[tokio::test]
    async fn flaky_jobs_succeed_on_a_later_attempt() {
        let (queue, processor) = scripted_queue().await;

        let job_id = queue
            .enqueue::<ScriptedProcessor>(Behaviour::SucceedAfter { failures: 2 }, JobOptions::new())
            .await
            .unwrap();

        let job = wait_for_terminal(&queue, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempt, 3);
        assert_eq!(job.result, Some(serde_json::json!("done")));
        assert_eq!(job.progress, 100);
        assert_eq!(job.errors.len(), 2);
        assert!(job.error().is_none());
        assert!(job.completed_at.is_some());
        assert_eq!(processor.executions.load(Ordering::SeqCst), 3);
        assert_eq!(*processor.completions.lock().unwrap(), vec![job_id]);

        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_job() {
        let (queue, processor) = scripted_queue().await;

        let job_id = queue
            .enqueue::<ScriptedProcessor>(
                Behaviour::Fail {
                    message: "repository unavailable".to_owned(),
                },
                JobOptions::new().with_max_attempts(2),
            )
            .await
            .unwrap();

        let job = wait_for_terminal(&queue, job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt, 2);
        assert_eq!(job.errors.len(), 2);
        let error = job.error().unwrap();
        assert_eq!(error.attempt, 2);
        assert_eq!(error.message, "repository unavailable");
        assert_eq!(processor.executions.load(Ordering::SeqCst), 2);
        assert_eq!(processor.errors.lock().unwrap().len(), 2);

        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn panics_are_caught_and_recorded() {
        let (queue, _processor) = scripted_queue().await;

        let job_id = queue
            .enqueue::<ScriptedProcessor>(
                Behaviour::Panic,
                JobOptions::new().with_max_attempts(1),
            )
            .await
            .unwrap();

        let job = wait_for_terminal(&queue, job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error().unwrap();
        assert_eq!(error.kind, ErrorKind::Panic);
        assert_eq!(error.message, "job panicked");

        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn delayed_jobs_wait_for_their_schedule() {
        let (queue, processor) = scripted_queue().await;

        let job_id = queue
            .enqueue::<ScriptedProcessor>(
                Behaviour::Succeed,
                JobOptions::new().schedule_in(TimeDelta::milliseconds(300)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.job_status(job_id).await.unwrap(), JobStatus::Queued);
        assert_eq!(processor.executions.load(Ordering::SeqCst), 0);
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.waiting, 0);

        let job = wait_for_terminal(&queue, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.started_at.unwrap() >= job.inserted_at + TimeDelta::milliseconds(250));

        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_jobs_never_execute() {
        let (queue, processor) = scripted_queue().await;

        let job_id = queue
            .enqueue::<ScriptedProcessor>(
                Behaviour::Succeed,
                JobOptions::new().schedule_in(TimeDelta::milliseconds(100)),
            )
            .await
            .unwrap();

        queue.cancel_job(job_id).await.unwrap();
        assert_eq!(queue.job_status(job_id).await.unwrap(), JobStatus::Cancelled);

        // A second cancellation is a no-op, not an error.
        queue.cancel_job(job_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(queue.job_status(job_id).await.unwrap(), JobStatus::Cancelled);
        assert_eq!(processor.executions.load(Ordering::SeqCst), 0);

        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancelling_a_missing_job_is_a_no_op() {
        let (queue, _processor) = scripted_queue().await;

        assert!(queue.cancel_job(JobId::from(99)).await.is_ok());

        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn progress_reports_are_persisted_while_running() {
        let (queue, _processor) = scripted_queue().await;

        let job_id = queue
            .enqueue::<ScriptedProcessor>(
                Behaviour::ReportProgress {
                    values: vec![25, 50, 75],
                },
                JobOptions::new(),
            )
            .await
            .unwrap();

        let job = wait_for_terminal(&queue, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.errors.is_empty());

        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn decreasing_progress_reports_are_rejected() {
        let (queue, _processor) = scripted_queue().await;

        let job_id = queue
            .enqueue::<ScriptedProcessor>(
                Behaviour::ReportProgress {
                    values: vec![50, 25],
                },
                JobOptions::new().with_max_attempts(1),
            )
            .await
            .unwrap();

        let job = wait_for_terminal(&queue, job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.progress, 50);
        let error = job.error().unwrap();
        // Backend-side validation surfaces under the same error as the
        // local range check.
        assert_eq!(
            error.message,
            "invalid progress value 25, must be between 0 and 100"
        );

        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn jobs_of_unregistered_kinds_are_released_for_retry() {
        let backend = InMemoryBackend::new();
        let mut queue = JobQueue::connect(backend.clone(), fast_config())
            .await
            .unwrap()
            .with_processor(Arc::new(ScriptedProcessor::default()));
        queue.start();

        // Enqueued by an instance whose processor set this worker does not
        // share.
        let job_id = backend
            .enqueue(EnqueuableJob {
                kind: "report_export".to_owned(),
                data: serde_json::Value::Null,
                max_attempts: 2,
                priority: 0,
                scheduled_at: chrono::Utc::now(),
            })
            .await
            .unwrap()
            .id;

        let job = wait_for_terminal(&queue, job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt, 2);
        assert_eq!(job.errors.len(), 2);
        assert_eq!(job.errors[0].kind, ErrorKind::Other("unknown_kind".to_owned()));

        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn completed_jobs_can_be_cleaned_up() {
        let (queue, _processor) = scripted_queue().await;

        let job_id = queue
            .enqueue::<ScriptedProcessor>(Behaviour::Succeed, JobOptions::new())
            .await
            .unwrap();
        wait_for_terminal(&queue, job_id).await;

        let removed = queue.cleanup(TimeDelta::zero()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(queue.job(job_id).await.unwrap().is_none());

        queue.close().await.unwrap();
    }

    #[derive(Default)]
    struct GaugeProcessor {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Processor for GaugeProcessor {
        type Data = ();
        type Output = ();
        const NAME: &'static str = "gauge_processor";

        async fn process(
            &self,
            _job: Job<Self::Data>,
            _progress: ProgressHandle,
        ) -> Result<Self::Output, ProcessorError> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrency_is_bounded() {
        let processor = Arc::new(GaugeProcessor::default());
        let mut queue = JobQueue::connect(
            InMemoryBackend::new(),
            fast_config().with_concurrency(3),
        )
        .await
        .unwrap()
        .with_processor(Arc::clone(&processor));
        queue.start();

        let mut ids = Vec::new();
        for _ in 0..9 {
            ids.push(
                queue
                    .enqueue::<GaugeProcessor>((), JobOptions::new())
                    .await
                    .unwrap(),
            );
        }
        for id in ids {
            let job = wait_for_terminal(&queue, id).await;
            assert_eq!(job.status, JobStatus::Completed);
        }

        let peak = processor.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "ran {peak} jobs at once");
        assert!(peak > 1, "jobs never overlapped");

        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_waits_for_in_flight_jobs() {
        let backend = InMemoryBackend::new();
        let processor = Arc::new(GaugeProcessor::default());
        let mut queue = JobQueue::connect(backend.clone(), fast_config())
            .await
            .unwrap()
            .with_processor(Arc::clone(&processor));
        queue.start();

        let job_id = queue
            .enqueue::<GaugeProcessor>((), JobOptions::new())
            .await
            .unwrap();

        // Give the dispatcher time to claim the job before shutting down.
        tokio::time::timeout(Duration::from_secs(1), async {
            while backend.job(job_id).await.unwrap().unwrap().status == JobStatus::Queued {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        queue.close().await.unwrap();

        let job = backend.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn connect_recovers_jobs_abandoned_by_a_dead_instance() {
        let backend = InMemoryBackend::new().paused();
        let processor = Arc::new(ScriptedProcessor::default());

        // Simulate an instance that claimed a job and then died.
        let job_id = {
            let mut stream = backend.subscribe_ready_jobs().await;
            let job_id = backend
                .enqueue(EnqueuableJob {
                    kind: ScriptedProcessor::NAME.to_owned(),
                    data: serde_json::to_value(Behaviour::Succeed).unwrap(),
                    max_attempts: 3,
                    priority: 0,
                    scheduled_at: chrono::Utc::now(),
                })
                .await
                .unwrap()
                .id;
            backend.notify_all().unwrap();
            use futures::StreamExt;
            let claimed = stream.next().await.unwrap().unwrap();
            assert_eq!(claimed.id, job_id);
            job_id
        };

        let mut queue = JobQueue::connect(
            backend.clone(),
            fast_config().with_stale_claim_after(TimeDelta::zero()),
        )
        .await
        .unwrap()
        .with_processor(Arc::clone(&processor));
        queue.start();
        backend.notify_all().unwrap();

        let job = wait_for_terminal(&queue, job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempt, 2);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors[0].kind, ErrorKind::StaleClaim);

        queue.close().await.unwrap();
    }
}
