//! Retry Timer: Exponential backoff with jitter
//!
//! A retrying caller consumes attempts one at a time. Attempt `0` fires
//! immediately; every later attempt first waits `unit * 2^k` (capped at
//! `cap`) minus a random jitter fraction, where `k` is the number of failed
//! attempts so far. The wait observes a [`CancellationToken`] so a cancelled
//! caller wakes up at once instead of sleeping out the delay.
//!
//! # Example
//!
//! ```
//! use ferry_core_resilience::retry_timer::{backoff, BackoffConfig};
//! use std::time::Duration;
//!
//! let config = BackoffConfig {
//!     unit: Duration::from_millis(100),
//!     cap: Duration::from_secs(1),
//!     jitter: 0.0,
//! };
//!
//! let delays: Vec<Duration> = backoff(config).take(5).collect();
//! assert_eq!(delays[0], Duration::from_millis(100));
//! assert_eq!(delays[3], Duration::from_millis(800));
//! assert_eq!(delays[4], Duration::from_secs(1)); // capped
//! ```

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Highest exponent used when computing `2^k`; later attempts stay at `cap`
pub const MAX_ATTEMPT_INDEX: u32 = 30;

/// Default base delay
pub const DEFAULT_UNIT: Duration = Duration::from_millis(200);

/// Default ceiling on a single delay
pub const DEFAULT_CAP: Duration = Duration::from_secs(1);

/// Default jitter fraction
pub const DEFAULT_JITTER: f64 = 0.5;

/// Shape of a backoff sequence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Base delay multiplied by `2^k`
    pub unit: Duration,

    /// Maximum delay for any single attempt
    pub cap: Duration,

    /// Fraction (0.0 - 1.0) of the nominal delay that may be randomly removed
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            unit: DEFAULT_UNIT,
            cap: DEFAULT_CAP,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry `attempt` without jitter
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_ATTEMPT_INDEX);
        self.unit
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Delay before retry `attempt`, with `sample` in `[0, 1)` standing in for
    /// the random draw.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let sample = sample.clamp(0.0, 1.0);
        nominal.saturating_sub(nominal.mul_f64(jitter * sample))
    }

    /// Delay before retry `attempt` with a fresh random jitter draw
    pub fn delay(&self, attempt: u32) -> Duration {
        let sample = if self.jitter > 0.0 {
            rand::rng().random_range(0.0..1.0)
        } else {
            0.0
        };
        self.delay_with_sample(attempt, sample)
    }
}

/// Create an infinite, lazily computed sequence of backoff delays
pub fn backoff(config: BackoffConfig) -> BackoffDelays {
    BackoffDelays { config, attempt: 0 }
}

/// Iterator over backoff delays, see [`backoff`]
#[derive(Debug, Clone)]
pub struct BackoffDelays {
    config: BackoffConfig,
    attempt: u32,
}

impl Iterator for BackoffDelays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.config.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }
}

/// Cancellable attempt generator built on [`BackoffDelays`].
///
/// ```no_run
/// use ferry_core_resilience::retry_timer::{BackoffConfig, RetryTimer};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() {
/// let cancel = CancellationToken::new();
/// let mut timer = RetryTimer::new(BackoffConfig::default(), cancel).with_max_attempts(5);
///
/// while let Some(attempt) = timer.next().await {
///     // try the operation; break on success
/// #   let _ = attempt;
/// #   break;
/// }
/// # }
/// ```
#[derive(Debug)]
pub struct RetryTimer {
    delays: BackoffDelays,
    attempt: u32,
    max_attempts: Option<u32>,
    cancel: CancellationToken,
}

impl RetryTimer {
    /// Create an unbounded timer
    pub fn new(config: BackoffConfig, cancel: CancellationToken) -> Self {
        Self {
            delays: backoff(config),
            attempt: 0,
            max_attempts: None,
            cancel,
        }
    }

    /// Stop yielding after `max` attempts in total (first try included)
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Number of attempts handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Wait for the next attempt.
    ///
    /// Returns the attempt number, or `None` when the token was cancelled or
    /// the attempt budget is spent.
    pub async fn next(&mut self) -> Option<u32> {
        if self.cancel.is_cancelled() {
            return None;
        }
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }

        let attempt = self.attempt;
        if attempt > 0 {
            let delay = self.delays.next()?;
            trace!(attempt, delay_ms = delay.as_millis() as u64, "Backing off");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.attempt = self.attempt.saturating_add(1);
        Some(attempt)
    }
}
