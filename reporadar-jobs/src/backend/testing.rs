//! Test suite for ensuring a correct implementation of a backend.
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;

use super::{Backend, BackendError, EnqueuableJob, ExecutionError, Job, QueueStats};
use crate::job::{ErrorKind, JobStatus};

const DEFAULT_KIND: &str = "analysis";

impl EnqueuableJob {
    pub(crate) fn mock_job() -> Self {
        Self {
            kind: DEFAULT_KIND.to_owned(),
            data: serde_json::Value::String("data".to_owned()),
            max_attempts: 3,
            priority: 0,
            scheduled_at: Utc::now(),
        }
    }

    pub(crate) fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub(crate) fn with_priority(self, priority: u16) -> Self {
        Self { priority, ..self }
    }

    pub(crate) fn with_scheduled_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at,
            ..self
        }
    }
}

async fn claim_one<B: Backend>(backend: &B) -> Job {
    let mut stream = backend.subscribe_ready_jobs().await;
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for a ready job")
        .expect("ready job stream ended")
        .expect("ready job stream errored")
}

fn execution_error(message: &str) -> ExecutionError {
    ExecutionError {
        kind: ErrorKind::Other("test".to_owned()),
        message: message.to_owned(),
    }
}

pub async fn enqueue_persists_a_queued_job<B: Backend>(backend: B) {
    let job = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.progress, 0);

    let stored = backend.job(job.id).await.unwrap().unwrap();
    assert_eq!(stored, job);
}

pub async fn enqueue_assigns_distinct_ids<B: Backend>(backend: B) {
    let first = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let second = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    assert_ne!(first.id, second.id);
}

pub async fn missing_job_reads_as_none<B: Backend>(backend: B) {
    assert!(backend.job(12345.into()).await.unwrap().is_none());
}

pub async fn ready_jobs_are_claimed_atomically<B: Backend>(backend: B) {
    let job = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let claimed = claim_one(&backend).await;
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.status, JobStatus::Processing);
    assert_eq!(claimed.attempt, 1);
    assert!(claimed.started_at.is_some());
    assert!(claimed.attempted_at.is_some());

    let stored = backend.job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Processing);
}

pub async fn enqueuing_wakes_subscriber<B: Backend + Send + Sync + 'static>(backend: B) {
    let mut stream = backend.subscribe_ready_jobs().await;
    let handle = tokio::spawn(async move {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("didn't get woken by enqueue of new job")
            .unwrap()
            .unwrap()
    });
    tokio::task::yield_now().await;
    let job = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    assert_eq!(handle.await.unwrap().id, job.id);
}

pub async fn higher_priority_jobs_are_claimed_first<B: Backend>(backend: B) {
    let low = backend
        .enqueue(EnqueuableJob::mock_job().with_priority(0))
        .await
        .unwrap();
    let high = backend
        .enqueue(EnqueuableJob::mock_job().with_priority(10))
        .await
        .unwrap();

    assert_eq!(claim_one(&backend).await.id, high.id);
    assert_eq!(claim_one(&backend).await.id, low.id);
}

pub async fn equal_priority_jobs_are_claimed_fifo<B: Backend>(backend: B) {
    let first = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let second = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert_eq!(claim_one(&backend).await.id, first.id);
    assert_eq!(claim_one(&backend).await.id, second.id);
}

pub async fn delayed_jobs_are_not_claimed_early<B: Backend>(backend: B) {
    backend
        .enqueue(
            EnqueuableJob::mock_job().with_scheduled_at(Utc::now() + TimeDelta::milliseconds(400)),
        )
        .await
        .unwrap();

    let mut stream = backend.subscribe_ready_jobs().await;
    assert!(
        tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .is_err(),
        "job was dispatched before its delay elapsed"
    );

    let claimed = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("job was never dispatched")
        .unwrap()
        .unwrap();
    assert!(Utc::now() >= claimed.scheduled_at);
}

pub async fn only_one_stream_receives_a_job<B: Backend + Send + Sync + 'static>(backend: B) {
    let mut first = backend.subscribe_ready_jobs().await;
    let mut second = backend.subscribe_ready_jobs().await;

    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let winner = tokio::select! {
        job = first.next() => job,
        job = second.next() => job,
    };
    assert!(winner.unwrap().is_ok());

    // The other stream must not also yield the same job.
    let second_claim = tokio::select! {
        job = first.next() => job,
        job = second.next() => job,
        _ = tokio::time::sleep(Duration::from_millis(100)) => None,
    };
    assert!(second_claim.is_none());
}

pub async fn mark_job_complete_records_result<B: Backend>(backend: B) {
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = claim_one(&backend).await;

    backend
        .mark_job_complete(job.id, serde_json::json!({"score": 7}))
        .await
        .unwrap();

    let stored = backend.job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.progress, 100);
    assert_eq!(stored.result, Some(serde_json::json!({"score": 7})));
    assert!(stored.error().is_none());
    assert!(stored.completed_at.is_some());
}

pub async fn completing_a_cancelled_job_is_a_no_op<B: Backend>(backend: B) {
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = claim_one(&backend).await;

    assert!(backend.mark_job_cancelled(job.id).await.unwrap());
    backend
        .mark_job_complete(job.id, serde_json::Value::Null)
        .await
        .unwrap();

    let stored = backend.job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert!(stored.result.is_none());
}

pub async fn mark_job_retryable_requeues_with_error<B: Backend>(backend: B) {
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = claim_one(&backend).await;
    let next_attempt_at = Utc::now() + TimeDelta::minutes(10);

    backend
        .mark_job_retryable(job.id, next_attempt_at, execution_error("flaky"))
        .await
        .unwrap();

    let stored = backend.job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
    assert_eq!(stored.attempt, 1);
    assert_eq!(stored.errors.len(), 1);
    assert_eq!(stored.errors[0].attempt, 1);
    assert_eq!(stored.errors[0].message, "flaky");
    // Not failed, so the public error field stays empty.
    assert!(stored.error().is_none());
    assert!((stored.scheduled_at - next_attempt_at).abs() < TimeDelta::seconds(1));
}

pub async fn mark_job_failed_records_error<B: Backend>(backend: B) {
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = claim_one(&backend).await;

    backend
        .mark_job_failed(job.id, execution_error("fatal"))
        .await
        .unwrap();

    let stored = backend.job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.result.is_none());
    assert_eq!(stored.error().unwrap().message, "fatal");
    assert!(stored.completed_at.is_some());
}

pub async fn cancellation_is_idempotent<B: Backend>(backend: B) {
    let job = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert!(backend.mark_job_cancelled(job.id).await.unwrap());
    assert!(!backend.mark_job_cancelled(job.id).await.unwrap());

    let stored = backend.job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
}

pub async fn cancelling_a_missing_job_is_not_found<B: Backend>(backend: B) {
    assert!(matches!(
        backend.mark_job_cancelled(12345.into()).await,
        Err(BackendError::JobNotFound(_))
    ));
}

pub async fn progress_updates_are_validated<B: Backend>(backend: B) {
    let queued = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    assert!(matches!(
        backend.update_progress(queued.id, 10).await,
        Err(BackendError::InvalidProgress { .. })
    ));

    let job = claim_one(&backend).await;
    backend.update_progress(job.id, 30).await.unwrap();
    backend.update_progress(job.id, 30).await.unwrap();
    backend.update_progress(job.id, 80).await.unwrap();

    assert!(matches!(
        backend.update_progress(job.id, 20).await,
        Err(BackendError::InvalidProgress { .. })
    ));
    assert!(matches!(
        backend.update_progress(job.id, 101).await,
        Err(BackendError::InvalidProgress { .. })
    ));

    let stored = backend.job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.progress, 80);
}

pub async fn stats_reflect_current_state<B: Backend>(backend: B) {
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(Utc::now() + TimeDelta::hours(1)))
        .await
        .unwrap();
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    // One extra job stays queued and due, to show up as waiting.
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let active = claim_one(&backend).await;
    let completed = claim_one(&backend).await;
    backend
        .mark_job_complete(completed.id, serde_json::Value::Null)
        .await
        .unwrap();
    let failed = claim_one(&backend).await;
    backend
        .mark_job_failed(failed.id, execution_error("fatal"))
        .await
        .unwrap();
    // Keep `active` in flight.
    let _ = active;

    let stats = backend.stats().await.unwrap();
    assert_eq!(
        stats,
        QueueStats {
            waiting: 1,
            active: 1,
            completed: 1,
            failed: 1,
            delayed: 1,
        }
    );
}

pub async fn prune_jobs_respects_retention<B: Backend>(backend: B) {
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let done = claim_one(&backend).await;
    backend
        .mark_job_complete(done.id, serde_json::Value::Null)
        .await
        .unwrap();
    let queued = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    // Still within the one-day retention window.
    assert_eq!(backend.prune_jobs(TimeDelta::days(1)).await.unwrap(), 0);

    assert_eq!(backend.prune_jobs(TimeDelta::zero()).await.unwrap(), 1);
    assert!(backend.job(done.id).await.unwrap().is_none());
    // Non-terminal jobs are never pruned.
    assert!(backend.job(queued.id).await.unwrap().is_some());
}

pub async fn recover_stale_jobs_requeues_abandoned_work<B: Backend>(backend: B) {
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = claim_one(&backend).await;

    // A fresh claim is left alone.
    assert_eq!(
        backend
            .recover_stale_jobs(TimeDelta::minutes(5))
            .await
            .unwrap(),
        0
    );

    assert_eq!(
        backend.recover_stale_jobs(TimeDelta::zero()).await.unwrap(),
        1
    );
    let stored = backend.job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
    assert_eq!(stored.attempt, 1);
    assert_eq!(stored.errors.last().unwrap().kind, ErrorKind::StaleClaim);
}

pub async fn recover_stale_jobs_fails_exhausted_work<B: Backend>(backend: B) {
    backend
        .enqueue(EnqueuableJob::mock_job().with_max_attempts(1))
        .await
        .unwrap();
    let job = claim_one(&backend).await;

    assert_eq!(
        backend.recover_stale_jobs(TimeDelta::zero()).await.unwrap(),
        1
    );
    let stored = backend.job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error().unwrap().kind, ErrorKind::StaleClaim);
}

/// Create the conformance test suite for a backend implementation.
///
/// Backend implementors should include this as part of their test suites.
///
/// # Example
///
/// ```
/// # use reporadar_jobs::prelude::*;
/// use reporadar_jobs::test_suite;
/// use reporadar_jobs::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// If you are using a different async test attribute you can configure the
/// macro to use that instead:
///
/// ```ignore
/// test_suite!(
///     attr: my_test_macro::test,
///     args: (),
///     backend: MyBackend::connect().await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        #[$attr]
        async fn enqueue_persists_a_queued_job $args {
            $crate::backend::testing::enqueue_persists_a_queued_job($backend).await;
        }
        #[$attr]
        async fn enqueue_assigns_distinct_ids $args {
            $crate::backend::testing::enqueue_assigns_distinct_ids($backend).await;
        }
        #[$attr]
        async fn missing_job_reads_as_none $args {
            $crate::backend::testing::missing_job_reads_as_none($backend).await;
        }
        #[$attr]
        async fn ready_jobs_are_claimed_atomically $args {
            $crate::backend::testing::ready_jobs_are_claimed_atomically($backend).await;
        }
        #[$attr]
        async fn enqueuing_wakes_subscriber $args {
            $crate::backend::testing::enqueuing_wakes_subscriber($backend).await;
        }
        #[$attr]
        async fn higher_priority_jobs_are_claimed_first $args {
            $crate::backend::testing::higher_priority_jobs_are_claimed_first($backend).await;
        }
        #[$attr]
        async fn equal_priority_jobs_are_claimed_fifo $args {
            $crate::backend::testing::equal_priority_jobs_are_claimed_fifo($backend).await;
        }
        #[$attr]
        async fn delayed_jobs_are_not_claimed_early $args {
            $crate::backend::testing::delayed_jobs_are_not_claimed_early($backend).await;
        }
        #[$attr]
        async fn only_one_stream_receives_a_job $args {
            $crate::backend::testing::only_one_stream_receives_a_job($backend).await;
        }
        #[$attr]
        async fn mark_job_complete_records_result $args {
            $crate::backend::testing::mark_job_complete_records_result($backend).await;
        }
        #[$attr]
        async fn completing_a_cancelled_job_is_a_no_op $args {
            $crate::backend::testing::completing_a_cancelled_job_is_a_no_op($backend).await;
        }
        #[$attr]
        async fn mark_job_retryable_requeues_with_error $args {
            $crate::backend::testing::mark_job_retryable_requeues_with_error($backend).await;
        }
        #[$attr]
        async fn mark_job_failed_records_error $args {
            $crate::backend::testing::mark_job_failed_records_error($backend).await;
        }
        #[$attr]
        async fn cancellation_is_idempotent $args {
            $crate::backend::testing::cancellation_is_idempotent($backend).await;
        }
        #[$attr]
        async fn cancelling_a_missing_job_is_not_found $args {
            $crate::backend::testing::cancelling_a_missing_job_is_not_found($backend).await;
        }
        #[$attr]
        async fn progress_updates_are_validated $args {
            $crate::backend::testing::progress_updates_are_validated($backend).await;
        }
        #[$attr]
        async fn stats_reflect_current_state $args {
            $crate::backend::testing::stats_reflect_current_state($backend).await;
        }
        #[$attr]
        async fn prune_jobs_respects_retention $args {
            $crate::backend::testing::prune_jobs_respects_retention($backend).await;
        }
        #[$attr]
        async fn recover_stale_jobs_requeues_abandoned_work $args {
            $crate::backend::testing::recover_stale_jobs_requeues_abandoned_work($backend).await;
        }
        #[$attr]
        async fn recover_stale_jobs_fails_exhausted_work $args {
            $crate::backend::testing::recover_stale_jobs_fails_exhausted_work($backend).await;
        }
    };
}
