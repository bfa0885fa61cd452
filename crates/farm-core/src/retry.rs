//! # Retry Policy
//!
//! Exponential backoff with symmetric jitter. The delay for attempt `n`
//! (1-indexed) is `min(base · 2^(n-1), max)` scaled by a uniform factor in
//! `[1 - jitter, 1 + jitter]`, which keeps many devices that failed together
//! from retrying in lockstep.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::device::DeviceId;
use crate::error::HandshakeError;

/// Backoff and attempt budget for failed handshakes.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per device, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fractional jitter, e.g. 0.2 for ±20%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after failed attempt `attempt`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1) - 1;
        // 2^31 seconds is already far past any sane cap.
        let factor = 1u32.checked_shl(exp.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jittered delay after failed attempt `attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let unit = rand::rng().random_range(-1.0..=1.0_f64);
        self.backoff_delay_with(attempt, unit)
    }

    /// Delay with an explicit jitter sample `unit` in `[-1, 1]`.
    pub fn backoff_delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let scale = 1.0 + self.jitter * unit.clamp(-1.0, 1.0);
        self.nominal_delay(attempt).mul_f64(scale.max(0.0))
    }

    /// Whether a device that has failed `attempt_count` times gets another go.
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// Inclusive bounds the jittered delay for `attempt` falls within.
    pub fn delay_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let nominal = self.nominal_delay(attempt);
        (
            nominal.mul_f64(1.0 - self.jitter),
            nominal.mul_f64(1.0 + self.jitter),
        )
    }
}

/// Failure bookkeeping for a device awaiting its next attempt.
#[derive(Debug, Clone)]
pub struct RetryRecord {
    pub id: DeviceId,
    pub attempt_count: u32,
    pub next_attempt_at: Instant,
    pub last_error: HandshakeError,
}
