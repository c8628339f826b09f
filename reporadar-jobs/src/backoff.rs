//! Backoff strategies controlling the delay between retry attempts.
//!
//! The queue's default is an exponential strategy starting at one second and
//! capped at thirty seconds; see [`crate::config::QueueConfig`]. Strategies
//! are pure functions of the attempt number, so they can be tested without a
//! running queue, and can optionally be modified by applying jitter.
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use reporadar_jobs::backoff::{BackoffStrategy, Strategy};
//! # use chrono::TimeDelta;
//! let strategy =
//!     BackoffStrategy::exponential(TimeDelta::seconds(1)).with_max(TimeDelta::seconds(30));
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(1));
//! assert_eq!(strategy.backoff(2), TimeDelta::seconds(2));
//! assert_eq!(strategy.backoff(3), TimeDelta::seconds(4));
//! assert_eq!(strategy.backoff(6), TimeDelta::seconds(30));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the number of attempts made so far, returns the [`TimeDelta`]
    /// to wait before the job should be retried.
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// Constant backoff strategy.
///
/// Always returns the same value no matter what the attempt is.
///
/// __Note:__ This type cannot be constructed directly, instead
/// [`BackoffStrategy::constant`] should be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u16) -> TimeDelta {
        self.delay
    }
}

/// Exponential backoff strategy: the initial delay doubles with each failed
/// attempt (`initial * 2^(attempt - 1)`).
///
/// It is advisable to set a maximum via [`BackoffStrategy::with_max`] to
/// avoid unbounded delay growth.
///
/// __Note:__ This type cannot be constructed directly, instead
/// [`BackoffStrategy::exponential`] should be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    initial: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let exponent = u32::from(attempt.saturating_sub(1)).min(31);
        let millis = self
            .initial
            .num_milliseconds()
            .checked_mul(1i64 << exponent)
            .unwrap_or(i64::MAX);
        let mut backoff = TimeDelta::milliseconds(millis);
        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }
        backoff
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter added to the backoff in the range
    /// `-delta <= jitter <= delta`.
    Absolute(TimeDelta),
    /// A random jitter added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        };
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter)
    }
}

/// A backoff strategy together with optional jitter and a minimum delay.
///
/// # Example
///
/// ```
/// # use reporadar_jobs::backoff::{BackoffStrategy, Jitter, Strategy};
/// # use chrono::TimeDelta;
/// let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2))
///     .with_max(TimeDelta::seconds(60))
///     .with_jitter(Jitter::Absolute(TimeDelta::seconds(1)))
///     .with_min(TimeDelta::seconds(1));
///
/// assert!(strategy.backoff(1) >= TimeDelta::seconds(1));
/// assert!(strategy.backoff(1) <= TimeDelta::seconds(3));
/// assert!(strategy.backoff(2) >= TimeDelta::seconds(3));
/// assert!(strategy.backoff(2) <= TimeDelta::seconds(5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Constant> {
    /// Creates a [`BackoffStrategy`] with a constant backoff strategy.
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] with an exponential backoff strategy
    /// doubling from the given initial delay.
    pub const fn exponential(initial: TimeDelta) -> Self {
        Self::new(Exponential { initial, max: None })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to
    /// `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Creates a [`BackoffStrategy`] with the given backoff strategy.
    ///
    /// Generally only used with a custom [`Strategy`] implementation; more
    /// commonly [`BackoffStrategy::constant`] or
    /// [`BackoffStrategy::exponential`] are used.
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Add a jitter to the backoff strategy, see [`Jitter`] for how this
    /// affects the strategy.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Add a minimum value. Useful with a large jitter to avoid a delay
    /// close to (or below) zero.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut backoff = self.strategy.backoff(attempt);

        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }

        backoff.max(self.min)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constant_backoff() {
        let delay = TimeDelta::minutes(1);
        let strategy = BackoffStrategy::constant(delay);

        for i in 1..100 {
            assert_eq!(strategy.backoff(i), delay);
        }
    }

    #[test]
    fn exponential_backoff_doubles_from_initial() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1));

        assert_eq!(strategy.backoff(1), TimeDelta::seconds(1));
        assert_eq!(strategy.backoff(2), TimeDelta::seconds(2));
        assert_eq!(strategy.backoff(3), TimeDelta::seconds(4));
        assert_eq!(strategy.backoff(4), TimeDelta::seconds(8));
    }

    #[test]
    fn exponential_backoff_strictly_increases_until_the_cap() {
        let max = TimeDelta::seconds(30);
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1)).with_max(max);

        let mut previous = TimeDelta::zero();
        for i in 1..=5 {
            let backoff = strategy.backoff(i);
            assert!(backoff > previous);
            previous = backoff;
        }
        for i in 6..100 {
            assert_eq!(strategy.backoff(i), max);
        }
    }

    #[test]
    fn exponential_backoff_treats_attempt_zero_as_one() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1));
        assert_eq!(strategy.backoff(0), strategy.backoff(1));
    }

    #[test]
    fn exponential_backoff_does_not_overflow() {
        let strategy = BackoffStrategy::exponential(TimeDelta::days(100));
        let backoff = strategy.backoff(u16::MAX);
        assert!(backoff > TimeDelta::zero());
    }

    #[test]
    fn constant_backoff_with_absolute_jitter() {
        let delay = TimeDelta::minutes(1);
        let jitter = TimeDelta::seconds(10);
        let strategy = BackoffStrategy::constant(delay).with_jitter(Jitter::Absolute(jitter));

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= delay - jitter);
            assert!(backoff <= delay + jitter);
        }
    }

    #[test]
    fn constant_backoff_with_relative_jitter() {
        let delay = TimeDelta::minutes(1);
        let strategy = BackoffStrategy::constant(delay).with_jitter(Jitter::Relative(0.1));

        for i in 1..100 {
            let jitter = TimeDelta::seconds(6);
            let backoff = strategy.backoff(i);
            assert!(backoff >= delay - jitter);
            assert!(backoff <= delay + jitter);
        }
    }

    #[test]
    fn backoff_with_jitter_respects_min() {
        let delay = TimeDelta::seconds(20);
        let jitter = TimeDelta::seconds(20);
        let min = TimeDelta::seconds(5);
        let strategy = BackoffStrategy::constant(delay)
            .with_jitter(Jitter::Absolute(jitter))
            .with_min(min);

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= min);
            assert!(backoff <= delay + jitter);
        }
    }
}
