//! The API for configuring background queue maintenance.
//!
//! Maintenance covers two housekeeping duties that keep a long-running
//! backend healthy:
//!
//! - removing terminal jobs (completed, failed, or cancelled) once they are
//!   older than the configured retention period, and
//! - recovering jobs that were claimed by an instance which died mid-flight,
//!   returning them to the queue or failing them if their attempts are
//!   exhausted.
//!
//! When constructing [`MaintenanceConfig`] a [`cron::Schedule`] is provided
//! to specify when maintenance should run. Depending on the load/throughput
//! of the system this can be anywhere from once a day through to multiple
//! times per hour.
//!
//! # Example
//!
//! To run maintenance hourly keeping two days of finished jobs:
//!
//! ```
//! # use reporadar_jobs::prelude::*;
//! # use std::str::FromStr;
//! # use chrono::TimeDelta;
//! let config = MaintenanceConfig::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
//!     .with_retention(TimeDelta::days(2));
//! ```

use std::{ops::Sub, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;

const DEFAULT_RETENTION: TimeDelta = TimeDelta::days(7);

/// Configuration for periodic cleanup and stale-claim recovery.
///
/// Once constructed, it should be passed to
/// [`crate::JobQueue::with_maintenance`].
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub(crate) schedule: cron::Schedule,
    pub(crate) retention: TimeDelta,
}

impl MaintenanceConfig {
    /// Construct a new instance of [`MaintenanceConfig`] scheduled to run on
    /// the provided cron schedule.
    ///
    /// The retention period defaults to seven days.
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            retention: DEFAULT_RETENTION,
        }
    }

    /// Specify how long terminal jobs are kept before being removed.
    pub fn with_retention(mut self, retention: TimeDelta) -> Self {
        self.retention = retention;
        self
    }
}

pub(crate) struct MaintenanceRunner<B: Backend> {
    backend: B,
    config: MaintenanceConfig,
    stale_claim_after: TimeDelta,
}

impl<B> MaintenanceRunner<B>
where
    B: Backend + Send + Sync + 'static,
{
    pub(crate) fn new(backend: B, config: MaintenanceConfig, stale_claim_after: TimeDelta) -> Self {
        Self {
            backend,
            config,
            stale_claim_after,
        }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) {
        tokio::spawn({
            async move {
                loop {
                    let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                        tracing::warn!("No future scheduled time for maintenance");
                        break;
                    };
                    let delay = next
                        .sub(Utc::now())
                        .sub(TimeDelta::milliseconds(10))
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            self.run_once().await;
                            let delay = next - Utc::now();
                            if delay > TimeDelta::zero() {
                                tokio::time::sleep(delay.to_std().unwrap_or(Duration::ZERO)).await;
                            }
                        }
                        _ = cancellation_token.cancelled() => {
                            tracing::debug!("Shutting down queue maintenance");
                            break;
                        },
                    }
                }
            }
        });
    }

    async fn run_once(&self) {
        match self.backend.recover_stale_jobs(self.stale_claim_after).await {
            Ok(recovered) if recovered > 0 => {
                tracing::warn!("Recovered {recovered} stale jobs from dead claims")
            }
            Ok(_) => {}
            Err(err) => tracing::error!(?err, "Failed to recover stale jobs with error {err}"),
        }
        match self.backend.prune_jobs(self.config.retention).await {
            Ok(pruned) if pruned > 0 => tracing::debug!("Cleaned up {pruned} finished jobs"),
            Ok(_) => {}
            Err(err) => tracing::error!(?err, "Failed to clean up jobs with error {err}"),
        }
    }
}
