// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Retry policy and backoff delay generation for failed fetches.
//!
//! Whether a failed attempt is retried is decided by a [`RetryPolicy`]; how long to wait
//! before the next attempt is decided by a [`RetryDelay`]. Both are plain configuration
//! values and can be set client-wide or per query.

use std::{cmp::min, fmt, sync::Arc, time::Duration};

use crate::error::FetchError;

/// The factor used to determine the range of jitter applied to delays.
const JITTER_FACTOR: f64 = 0.5;

/// The default base delay of the exponential schedule.
pub(crate) const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// The default upper bound of any single delay.
pub(crate) const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// The default number of retries after the first failed attempt.
pub(crate) const DEFAULT_RETRIES: u32 = 3;

type RetryFn = Arc<dyn Fn(u32, &FetchError) -> bool + Send + Sync>;
type DelayFn = Arc<dyn Fn(u32, &FetchError) -> Duration + Send + Sync>;

/// Decides whether a failed fetch attempt is retried.
///
/// The failure count passed to custom policies is 1-based: it is `1` after the first
/// failed attempt.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Never retry; the first failure settles the entry as an error.
    Never,

    /// Retry up to the given number of times, for `n + 1` attempts in total.
    Retries(u32),

    /// Retry until the fetch succeeds or is cancelled.
    Forever,

    /// Retry while the closure returns `true` for `(failure_count, error)`.
    Custom(RetryFn),
}

impl RetryPolicy {
    /// Creates a policy from a predicate over `(failure_count, error)`.
    pub fn custom(f: impl Fn(u32, &FetchError) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Returns `true` if another attempt should follow the given failure.
    #[must_use]
    pub fn should_retry(&self, failure_count: u32, error: &FetchError) -> bool {
        match self {
            Self::Never => false,
            Self::Retries(n) => failure_count <= *n,
            Self::Forever => true,
            Self::Custom(f) => f(failure_count, error),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Retries(DEFAULT_RETRIES)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "Never"),
            Self::Retries(n) => f.debug_tuple("Retries").field(n).finish(),
            Self::Forever => write!(f, "Forever"),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Defines how delays grow between consecutive retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backoff {
    /// Every delay equals the base delay.
    ///
    /// **Example with `1s` base delay:** `1s, 1s, 1s, ...`
    Constant,

    /// Delays grow proportionally with the failure count.
    ///
    /// **Example with `1s` base delay:** `1s, 2s, 3s, ...`
    Linear,

    /// Delays double with each failure.
    ///
    /// **Example with `1s` base delay:** `1s, 2s, 4s, 8s, ...`
    Exponential,
}

/// Computes the delay before a retry.
///
/// The default is exponential backoff starting at one second, capped at thirty
/// seconds, with symmetric jitter of ±25% around each delay.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use refetch::{Backoff, RetryDelay};
///
/// let delay = RetryDelay::backoff(Backoff::Linear, Duration::from_millis(100))
///     .max_delay(Duration::from_millis(250))
///     .jitter(false);
///
/// let delays: Vec<_> = (1..=4).map(|n| delay.delay_for(n, &refetch::FetchError::msg("x"))).collect();
/// assert_eq!(
///     delays,
///     [100, 200, 250, 250].map(Duration::from_millis)
/// );
/// ```
#[derive(Clone)]
pub enum RetryDelay {
    /// A delay schedule derived from a [`Backoff`] strategy.
    Backoff(BackoffOptions),

    /// A delay computed by the closure from `(failure_count, error)`.
    Custom(DelayFn),
}

/// Parameters of a [`RetryDelay::Backoff`] schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffOptions {
    /// How delays grow between attempts.
    pub backoff: Backoff,
    /// The delay before the first retry.
    pub base_delay: Duration,
    /// The upper bound of any delay, if any.
    pub max_delay: Option<Duration>,
    /// Whether to randomize each delay around its nominal value.
    pub use_jitter: bool,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            backoff: Backoff::Exponential,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: Some(DEFAULT_MAX_DELAY),
            use_jitter: true,
        }
    }
}

impl RetryDelay {
    /// Creates a schedule with the given strategy and base delay, without a cap, with jitter.
    #[must_use]
    pub fn backoff(backoff: Backoff, base_delay: Duration) -> Self {
        Self::Backoff(BackoffOptions {
            backoff,
            base_delay,
            max_delay: None,
            use_jitter: true,
        })
    }

    /// Creates a schedule that always waits `delay`, without jitter.
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self::Backoff(BackoffOptions {
            backoff: Backoff::Constant,
            base_delay: delay,
            max_delay: None,
            use_jitter: false,
        })
    }

    /// Creates a delay computed by a closure over `(failure_count, error)`.
    pub fn custom(f: impl Fn(u32, &FetchError) -> Duration + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Caps every delay at `max`. Has no effect on custom delays.
    #[must_use]
    pub fn max_delay(mut self, max: Duration) -> Self {
        if let Self::Backoff(options) = &mut self {
            options.max_delay = Some(max);
        }
        self
    }

    /// Enables or disables jitter. Has no effect on custom delays.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        if let Self::Backoff(options) = &mut self {
            options.use_jitter = enabled;
        }
        self
    }

    /// Returns the delay to wait after the given (1-based) failure.
    #[must_use]
    pub fn delay_for(&self, failure_count: u32, error: &FetchError) -> Duration {
        match self {
            Self::Backoff(options) => options.delay_for(failure_count, &Rnd::Real),
            Self::Custom(f) => f(failure_count, error),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Backoff(BackoffOptions::default())
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backoff(options) => f.debug_tuple("Backoff").field(options).finish(),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl BackoffOptions {
    fn delay_for(&self, failure_count: u32, rnd: &Rnd) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = failure_count.saturating_sub(1);
        let nominal = match self.backoff {
            Backoff::Constant => self.base_delay,
            Backoff::Linear => self.base_delay.saturating_mul(failure_count.max(1)),
            Backoff::Exponential => duration_mul_pow2(self.base_delay, exponent),
        };

        let delay = if self.use_jitter { apply_jitter(nominal, rnd) } else { nominal };
        clamp_to_max(delay, self.max_delay)
    }
}

fn clamp_to_max(d: Duration, max: Option<Duration>) -> Duration {
    max.map_or(d, |m| min(d, m))
}

fn duration_mul_pow2(base: Duration, exponent: u32) -> Duration {
    let factor = 2.0_f64.powi(i32::try_from(exponent).unwrap_or(i32::MAX));
    secs_to_duration_saturating(base.as_secs_f64() * factor)
}

/// Adds a symmetric, uniform jitter around `delay`.
///
/// With `JITTER_FACTOR = 0.5` the result lies in `[0.75 * delay, 1.25 * delay]`.
fn apply_jitter(delay: Duration, rnd: &Rnd) -> Duration {
    let ms = delay.as_secs_f64() * 1000.0;
    let offset = (ms * JITTER_FACTOR) / 2.0;
    let random_delay = (ms * JITTER_FACTOR).mul_add(rnd.next_f64(), -offset);

    secs_to_duration_saturating((ms + random_delay) / 1000.0)
}

fn secs_to_duration_saturating(secs: f64) -> Duration {
    if secs <= 0.0 {
        return Duration::ZERO;
    }

    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Non-cryptographic randomness for jitter.
#[derive(Clone, Default)]
enum Rnd {
    #[default]
    Real,

    #[cfg(test)]
    Fixed(f64),
}

impl Rnd {
    fn next_f64(&self) -> f64 {
        match self {
            Self::Real => fastrand::f64(),
            #[cfg(test)]
            Self::Fixed(value) => *value,
        }
    }
}
