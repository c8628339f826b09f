//! Provides an in memory implementation of [`Backend`].
//!
//! The store is process-local, so it is suitable for tests and for
//! single-instance deployments that can tolerate losing jobs on restart.
//! It is designed to be a correct reference implementation of the backend
//! contract rather than an optimized one.

use std::{
    ops::Sub,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, RwLock,
    },
};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use tokio::sync::mpsc;

use super::{Backend, BackendError, EnqueuableJob, ExecutionError, Job, QueueStats};
use crate::job::{ErrorKind, JobId, JobStatus};

struct ReadyJobStream {
    backend: InMemoryBackend,
    receiver: mpsc::UnboundedReceiver<DateTime<Utc>>,
}

impl ReadyJobStream {
    const DEFAULT_DELAY: std::time::Duration = std::time::Duration::from_secs(30);
    const DELTA: std::time::Duration = std::time::Duration::from_millis(15);

    async fn next(&mut self) -> Result<Job, BackendError> {
        loop {
            let delay = match self.backend.next_scheduled_at()? {
                Some(timestamp) => timestamp
                    .sub(Utc::now())
                    .to_std()
                    .unwrap_or(Self::DELTA)
                    .min(Self::DEFAULT_DELAY),
                None => Self::DEFAULT_DELAY,
            };
            if delay <= Self::DELTA {
                if let Some(job) = self.backend.claim_next_job()? {
                    return Ok(job);
                }
            }
            tokio::select! {
                _ = self.receiver.recv() => {},
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }
}

type Subscriber = mpsc::UnboundedSender<DateTime<Utc>>;

/// An in memory implementation of [`Backend`].
///
/// Cloning shares the underlying store, so multiple queue instances in one
/// process can operate against the same jobs.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    jobs: Arc<RwLock<Vec<Job>>>,
    id_counter: Arc<AtomicI32>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    paused: Arc<AtomicBool>,
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the backend in paused mode where ready-job streams will not be
    /// woken when jobs are inserted or become retryable.
    ///
    /// To then run jobs later in a test, call
    /// [`InMemoryBackend::notify_all`].
    pub fn paused(self) -> Self {
        self.paused.store(true, Ordering::Relaxed);
        self
    }

    /// Wake up all ready-job stream subscribers.
    ///
    /// Particularly helpful when running the backend in paused mode.
    pub fn notify_all(&self) -> Result<(), BackendError> {
        let now = Utc::now();
        self.subscribers
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .for_each(|sender| {
                let _ = sender.send(now);
            });
        Ok(())
    }

    fn next_scheduled_at(&self) -> Result<Option<DateTime<Utc>>, BackendError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|job| job.status == JobStatus::Queued)
            .map(|job| job.scheduled_at)
            .min())
    }

    fn claim_next_job(&self) -> Result<Option<Job>, BackendError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let mut due = jobs.iter_mut().filter(|job| job.is_due(now)).collect::<Vec<_>>();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.inserted_at.cmp(&b.inserted_at))
                .then(i32::from(a.id).cmp(&i32::from(b.id)))
        });
        Ok(due.first_mut().map(|job| {
            job.mark_job_claimed(now);
            job.to_owned()
        }))
    }

    fn notify_subscribers(&self, scheduled_at: DateTime<Utc>) -> Result<(), BackendError> {
        if !self.paused.load(Ordering::Relaxed) {
            self.subscribers
                .read()
                .map_err(|_| BackendError::BadState)?
                .iter()
                .for_each(|sender| {
                    let _ = sender.send(scheduled_at);
                });
        }
        Ok(())
    }

    fn with_job<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Err(BackendError::JobNotFound(id)),
            Some(job) => f(job),
        }
    }
}

impl Job {
    fn mark_job_claimed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.attempt += 1;
        self.attempted_at = Some(now);
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    fn mark_job_complete(&mut self, result: serde_json::Value) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    fn mark_job_retryable(&mut self, next_attempt_at: DateTime<Utc>, error: ExecutionError) {
        self.errors.push(error.into_job_error(self.attempt));
        self.status = JobStatus::Queued;
        self.scheduled_at = next_attempt_at;
    }

    fn mark_job_failed(&mut self, error: ExecutionError) {
        self.errors.push(error.into_job_error(self.attempt));
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    fn mark_job_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.attempted_at.map(|at| at < cutoff).unwrap_or(false)
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn subscribe_ready_jobs(
        &self,
    ) -> Pin<Box<dyn Stream<Item = Result<Job, BackendError>> + Send>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.push(sender);
        }

        let mut stream = ReadyJobStream {
            backend: self.clone(),
            receiver,
        };
        Box::pin(stream! {
            loop {
                yield stream.next().await;
            }
        })
    }

    async fn enqueue(&self, job: EnqueuableJob) -> Result<Job, BackendError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let job = job.into_job(id.into());
        let scheduled_at = job.scheduled_at;

        self.jobs
            .write()
            .map_err(|_| BackendError::BadState)?
            .push(job.clone());

        self.notify_subscribers(scheduled_at)?;
        Ok(job)
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .find(|job| job.id == id)
            .cloned())
    }

    async fn mark_job_complete(
        &self,
        id: JobId,
        result: serde_json::Value,
    ) -> Result<(), BackendError> {
        self.with_job(id, |job| {
            if job.status == JobStatus::Processing {
                job.mark_job_complete(result);
            }
            Ok(())
        })
    }

    async fn mark_job_retryable(
        &self,
        id: JobId,
        next_attempt_at: DateTime<Utc>,
        error: ExecutionError,
    ) -> Result<(), BackendError> {
        self.with_job(id, |job| {
            if job.status == JobStatus::Processing {
                job.mark_job_retryable(next_attempt_at, error);
            }
            Ok(())
        })?;
        self.notify_subscribers(next_attempt_at)
    }

    async fn mark_job_failed(&self, id: JobId, error: ExecutionError) -> Result<(), BackendError> {
        self.with_job(id, |job| {
            if job.status == JobStatus::Processing {
                job.mark_job_failed(error);
            }
            Ok(())
        })
    }

    async fn mark_job_cancelled(&self, id: JobId) -> Result<bool, BackendError> {
        self.with_job(id, |job| {
            if job.is_terminal() {
                Ok(false)
            } else {
                job.mark_job_cancelled();
                Ok(true)
            }
        })
    }

    async fn update_progress(&self, id: JobId, progress: u8) -> Result<(), BackendError> {
        self.with_job(id, |job| {
            if progress > 100 {
                return Err(BackendError::InvalidProgress {
                    id,
                    detail: format!("value {progress} is outside 0..=100"),
                });
            }
            if job.status != JobStatus::Processing {
                return Err(BackendError::InvalidProgress {
                    id,
                    detail: format!("job is {}, not processing", job.status),
                });
            }
            if progress < job.progress {
                return Err(BackendError::InvalidProgress {
                    id,
                    detail: format!("progress may not decrease ({} -> {progress})", job.progress),
                });
            }
            job.progress = progress;
            Ok(())
        })
    }

    async fn stats(&self) -> Result<QueueStats, BackendError> {
        let now = Utc::now();
        let jobs = self.jobs.read().map_err(|_| BackendError::BadState)?;
        let mut stats = QueueStats::default();
        for job in jobs.iter() {
            match job.status {
                JobStatus::Queued if job.scheduled_at <= now => stats.waiting += 1,
                JobStatus::Queued => stats.delayed += 1,
                JobStatus::Processing => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => {}
            }
        }
        Ok(stats)
    }

    async fn prune_jobs(&self, older_than: TimeDelta) -> Result<usize, BackendError> {
        let cutoff = Utc::now() - older_than;
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let before = jobs.len();
        jobs.retain(|job| {
            !(job.is_terminal() && job.completed_at.map(|at| at < cutoff).unwrap_or(false))
        });
        Ok(before - jobs.len())
    }

    async fn recover_stale_jobs(&self, stale_after: TimeDelta) -> Result<usize, BackendError> {
        let now = Utc::now();
        let cutoff = now - stale_after;
        let mut recovered = 0;
        {
            let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
            for job in jobs.iter_mut().filter(|job| job.is_stale(cutoff)) {
                let error = ExecutionError {
                    kind: ErrorKind::StaleClaim,
                    message: format!("claim became stale after {stale_after}"),
                };
                if job.attempt < job.max_attempts {
                    job.mark_job_retryable(now, error);
                } else {
                    job.mark_job_failed(error);
                }
                recovered += 1;
            }
        }
        if recovered > 0 {
            self.notify_subscribers(now)?;
        }
        Ok(recovered)
    }
}
