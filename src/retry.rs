//! Capped exponential backoff shared by connection retry and boot polling.

use std::time::Duration;

use rand::Rng;

const DEFAULT_MULTIPLIER: u32 = 2;

/// Delay schedule for successive attempts.
///
/// The delay after attempt `n` (zero based) is `base * multiplier^n`, capped
/// at `max`. With jitter enabled the delay is scaled by a random factor in
/// `[0.5, 1.5]` and capped again, so no delay ever exceeds `max`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    multiplier: u32,
    jitter: bool,
}

impl Backoff {
    /// Creates a schedule without jitter.
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: false,
        }
    }

    /// Creates a schedule that always waits `interval`.
    #[must_use]
    pub const fn fixed(interval: Duration) -> Self {
        Self {
            base: interval,
            max: interval,
            multiplier: 1,
            jitter: false,
        }
    }

    /// Enables or disables random jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Overrides the growth factor between attempts.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Largest delay the schedule will produce.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        self.max
    }

    /// Delay to apply after the zero-based `attempt` failed.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.checked_pow(attempt).unwrap_or(u32::MAX);
        let raw = self.base.saturating_mul(factor).min(self.max);
        if !self.jitter {
            return raw;
        }
        let percent: u32 = rand::thread_rng().gen_range(50..=150);
        (raw.saturating_mul(percent) / 100).min(self.max)
    }
}
