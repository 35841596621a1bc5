//! Exponential backoff with jitter for connection retries.
//!
//! ```text
//! delay[n] = clamp(base * 2^(n-1), min_delay, max_delay) + random % (max_jitter + 1)
//! ```
//!
//! With the defaults (base 500 ms, min 1 s, max 100 s, jitter up to 5 s):
//! - Attempts 1 and 2: 1 s
//! - Attempt 3: 2 s
//! - Attempt 4: 4 s
//! - ...
//! - Attempt 9+: 100 s (capped)

use embassy_time::Duration;

use crate::error::Error;

/// Retry timing and limits for [`ConnectionPolicy`](super::ConnectionPolicy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOptions {
    pub base_delay: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random delay added to every retry.
    pub max_jitter: Duration,
    /// Retries before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Credential switches after security failures before giving up.
    pub max_credential_rotations: u32,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(100),
            max_jitter: Duration::from_secs(5),
            max_attempts: Some(10),
            max_credential_rotations: 4,
        }
    }
}

impl RetryOptions {
    pub fn with_delays(mut self, base: Duration, min: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.min_delay = min;
        self.max_delay = max;
        self
    }

    pub fn with_max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_max_credential_rotations(mut self, rotations: u32) -> Self {
        self.max_credential_rotations = rotations;
        self
    }
}

/// Exponential backoff controller.
///
/// Each call to [`next_delay`](Self::next_delay) counts one failed attempt. The
/// counter is cleared with [`reset`](Self::reset) once a connection succeeds.
#[derive(Debug, Clone)]
pub struct Backoff {
    options: RetryOptions,
    attempt: u32,
}

impl Backoff {
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options,
            attempt: 0,
        }
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failed attempts counted since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Counts a failed attempt and returns how long to wait before the next one.
    ///
    /// Fails with [`Error::RetriesExhausted`] once more than `max_attempts` retries
    /// were requested.
    pub fn next_delay(&mut self, random: u32) -> Result<Duration, Error> {
        self.attempt = self.attempt.saturating_add(1);
        if let Some(max) = self.options.max_attempts
            && self.attempt > max
        {
            return Err(Error::RetriesExhausted);
        }
        Ok(self.delay_for(self.attempt, random))
    }

    /// The delay before retry number `attempt` (1-based) with the given random value.
    pub fn delay_for(&self, attempt: u32, random: u32) -> Duration {
        let options = &self.options;
        let exponent = attempt.saturating_sub(1);
        let exponential = if exponent < 63 {
            options.base_delay.as_millis().saturating_mul(1 << exponent)
        } else {
            u64::MAX
        };
        let clamped = exponential
            .min(options.max_delay.as_millis())
            .max(options.min_delay.as_millis());
        let jitter = u64::from(random) % options.max_jitter.as_millis().saturating_add(1);
        Duration::from_millis(clamped.saturating_add(jitter))
    }
}
