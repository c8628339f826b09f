//! Tuning knobs for a [`crate::JobQueue`].

use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;

use crate::{
    backoff::{BackoffStrategy, Strategy},
    maintenance::MaintenanceConfig,
};

const DEFAULT_CONCURRENCY: usize = 5;
const DEFAULT_STALE_CLAIM_AFTER: TimeDelta = TimeDelta::minutes(5);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration governing how a queue dispatches, retries, and shuts down.
///
/// The defaults give at most five concurrently executing jobs, retries
/// backing off exponentially from one second up to thirty seconds, claims
/// considered stale after five minutes, and a thirty second grace period for
/// in-flight jobs on shutdown.
///
/// # Example
///
/// ```
/// # use reporadar_jobs::prelude::*;
/// # use chrono::TimeDelta;
/// let config = QueueConfig::default()
///     .with_concurrency(10)
///     .with_retry_strategy(
///         BackoffStrategy::exponential(TimeDelta::milliseconds(100))
///             .with_max(TimeDelta::seconds(5)),
///     );
/// ```
#[derive(Clone)]
pub struct QueueConfig {
    pub(crate) concurrency: usize,
    pub(crate) retry: Arc<dyn Strategy + Send + Sync>,
    pub(crate) stale_claim_after: TimeDelta,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) maintenance: Option<MaintenanceConfig>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: Arc::new(
                BackoffStrategy::exponential(TimeDelta::seconds(1))
                    .with_max(TimeDelta::seconds(30)),
            ),
            stale_claim_after: DEFAULT_STALE_CLAIM_AFTER,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            maintenance: None,
        }
    }
}

impl QueueConfig {
    /// Set the maximum number of jobs executing simultaneously.
    ///
    /// Values below one are treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Override the delay between a failed attempt and its retry.
    pub fn with_retry_strategy(mut self, strategy: impl Strategy + Send + Sync + 'static) -> Self {
        self.retry = Arc::new(strategy);
        self
    }

    /// Set how long a claimed job may go without finishing before it is
    /// considered abandoned by a dead instance.
    ///
    /// This should comfortably exceed the longest expected job duration;
    /// recovery of a job that is in fact still running would execute it
    /// twice.
    pub fn with_stale_claim_after(mut self, stale_claim_after: TimeDelta) -> Self {
        self.stale_claim_after = stale_claim_after;
        self
    }

    /// Set how long [`crate::JobQueue::close`] waits for in-flight jobs
    /// before giving up.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enable periodic cleanup and stale-claim recovery.
    pub fn with_maintenance(mut self, maintenance: MaintenanceConfig) -> Self {
        self.maintenance = Some(maintenance);
        self
    }
}
