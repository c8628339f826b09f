//! Per-job overrides applied at enqueue time.

use chrono::{DateTime, TimeDelta, Utc};

/// Options controlling how a single job is scheduled and retried.
///
/// All fields have defaults: jobs run as soon as possible, at priority 0,
/// with the processor's configured maximum attempts.
///
/// # Example
///
/// ```
/// # use reporadar_jobs::job::options::JobOptions;
/// # use chrono::TimeDelta;
/// let options = JobOptions::default()
///     .with_priority(2)
///     .with_max_attempts(5)
///     .schedule_in(TimeDelta::seconds(30));
/// ```
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    max_attempts: Option<u16>,
    priority: u16,
    scheduled_at: Option<DateTime<Utc>>,
}

impl JobOptions {
    pub fn new() -> Self {
        Default::default()
    }

    /// Override the processor's maximum number of execution attempts.
    ///
    /// Values below 1 are treated as 1.
    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            ..self
        }
    }

    /// Higher priority jobs are dispatched first.
    pub fn with_priority(self, priority: u16) -> Self {
        Self { priority, ..self }
    }

    /// Delay the first eligible execution until the given instant.
    pub fn schedule_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            ..self
        }
    }

    /// Delay the first eligible execution by the given duration.
    pub fn schedule_in(self, delay: TimeDelta) -> Self {
        self.schedule_at(Utc::now() + delay)
    }

    pub(crate) fn max_attempts_or(&self, default: u16) -> u16 {
        self.max_attempts.unwrap_or(default.max(1))
    }

    pub(crate) fn priority(&self) -> u16 {
        self.priority
    }

    pub(crate) fn scheduled_at_or_now(&self) -> DateTime<Utc> {
        self.scheduled_at.unwrap_or_else(Utc::now)
    }
}
