use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Smallest delay any strategy will hand out
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(1);

/// Trait for defining reconnection strategies
///
/// The client counts consecutive failed or dropped connections. After the
/// `n`-th failure it asks `should_reconnect(n)`; if allowed it waits
/// `next_delay(n - 1)` before the next attempt. The counter is reset only
/// after a connection actually opens.
pub trait ReconnectionStrategy: Send + Sync {
    /// Delay before retry number `attempt` (0-indexed)
    ///
    /// Never returns a zero delay.
    fn next_delay(&self, attempt: u32) -> Duration;

    /// Check whether another attempt is allowed after `failures`
    /// consecutive failures
    fn should_reconnect(&self, failures: u32) -> bool;

    /// Maximum number of consecutive failures tolerated (None = unlimited)
    fn max_attempts(&self) -> Option<u32>;

    /// Reset internal state (called after a successful open)
    fn reset(&self) {}
}

/// Exponential backoff reconnection strategy
///
/// `delay = min(initial_delay * multiplier^attempt, max_delay)`, then shifted
/// by a random offset of at most `jitter * delay` in either direction. The
/// jittered delay never exceeds `max_delay` and never falls below the
/// highest delay the previous attempt could have drawn, so the sequence is
/// non-decreasing and settles on exactly `max_delay` once capped.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
    max_attempts: Option<u32>,
    rng: Mutex<StdRng>,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff strategy (multiplier 2, no jitter)
    ///
    /// # Arguments
    /// * `initial_delay` - The delay before the first retry
    /// * `max_delay` - The maximum delay between retries
    /// * `max_attempts` - Consecutive failures before giving up (None = unlimited)
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial_delay: initial_delay.max(MIN_RECONNECT_DELAY),
            max_delay: max_delay.max(MIN_RECONNECT_DELAY),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Growth factor between consecutive retries (values below 1 are raised to 1)
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };
        self
    }

    /// Fraction of the delay used as the jitter bound, clamped to `[0, 1]`
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        self
    }

    /// Seed the jitter source so the delay sequence is reproducible
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Delay for `attempt` before jitter, already capped
    pub fn unjittered_delay(&self, attempt: u32) -> Duration {
        secs_to_duration(self.capped_secs(attempt)).max(MIN_RECONNECT_DELAY)
    }

    fn capped_secs(&self, attempt: u32) -> f64 {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // powi overflows to +inf, which min() folds into the cap
        raw.min(self.max_delay.as_secs_f64())
    }

    /// Largest delay `attempt` can produce after jitter
    fn upper_secs(&self, attempt: u32) -> f64 {
        (self.capped_secs(attempt) * (1.0 + self.jitter)).min(self.max_delay.as_secs_f64())
    }

    /// Range the jittered delay for `attempt` is drawn from
    ///
    /// The lower bound is lifted to the previous attempt's upper bound.
    pub fn jitter_window(&self, attempt: u32) -> (Duration, Duration) {
        let (low, high) = self.window_secs(attempt);
        (secs_to_duration(low), secs_to_duration(high))
    }

    fn window_secs(&self, attempt: u32) -> (f64, f64) {
        let capped = self.capped_secs(attempt);
        let high = self.upper_secs(attempt);
        let previous = match attempt {
            0 => 0.0,
            n => self.upper_secs(n - 1),
        };
        let low = (capped * (1.0 - self.jitter)).max(previous).min(high);
        (low, high)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), Some(10)).with_jitter(0.2)
    }
}

impl ReconnectionStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let (low, high) = if self.jitter > 0.0 {
            self.window_secs(attempt)
        } else {
            let capped = self.capped_secs(attempt);
            (capped, capped)
        };

        let secs = if high > low {
            self.rng.lock().gen_range(low..=high)
        } else {
            high
        };
        secs_to_duration(secs).max(MIN_RECONNECT_DELAY)
    }

    fn should_reconnect(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }

    fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

/// Round to the nearest nanosecond so `0.1 * 2^n` style products land on
/// whole milliseconds
fn secs_to_duration(secs: f64) -> Duration {
    Duration::from_nanos((secs * 1e9).round() as u64)
}

/// Fixed delay reconnection strategy
///
/// Always waits the same amount of time between reconnection attempts
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: Option<u32>,
}

impl FixedDelay {
    /// Create a new fixed delay strategy
    ///
    /// # Arguments
    /// * `delay` - The fixed delay between reconnects
    /// * `max_attempts` - Consecutive failures before giving up (None = unlimited)
    pub fn new(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            delay: delay.max(MIN_RECONNECT_DELAY),
            max_attempts,
        }
    }
}

impl ReconnectionStrategy for FixedDelay {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }

    fn should_reconnect(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }

    fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

/// Never reconnect strategy
///
/// The first failure is terminal.
#[derive(Debug, Clone)]
pub struct NeverReconnect;

impl ReconnectionStrategy for NeverReconnect {
    fn next_delay(&self, _attempt: u32) -> Duration {
        MIN_RECONNECT_DELAY
    }

    fn should_reconnect(&self, _failures: u32) -> bool {
        false
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(1)
    }
}
