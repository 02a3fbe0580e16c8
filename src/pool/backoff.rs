//! Jittered exponential backoff between connection reset attempts.

use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::StdRng};

const MIN_DELAY_MS: u64 = 10;

/// Bounds of the reset schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResetPolicy {
    /// Delay before the first reset attempt.
    pub base: Duration,
    /// Upper bound reached by repeated doubling.
    pub cap: Duration,
}

impl ResetPolicy {
    /// First reset after one health-check interval, doubling up to the
    /// connection reset interval.
    pub fn new(health_check_interval: Duration, connection_reset_interval: Duration) -> Self {
        Self {
            base: health_check_interval.min(connection_reset_interval),
            cap: connection_reset_interval,
        }
    }
}

/// Produces the delay before the next reset of an unhealthy connection.
pub struct ResetBackoff {
    policy: ResetPolicy,
    current: Duration,
    attempts: u32,
    rng: StdRng,
}

impl ResetBackoff {
    pub fn new(policy: ResetPolicy) -> Self {
        Self {
            current: policy.base,
            attempts: 0,
            rng: StdRng::from_entropy(),
            policy,
        }
    }

    /// Forget earlier failures once a reset has succeeded.
    pub fn record_success(&mut self) {
        self.current = self.policy.base;
        self.attempts = 0;
    }

    /// Delay before the next attempt. The upper half of the window is
    /// randomised so that connections failing together do not reconnect in
    /// lockstep.
    pub fn next_delay(&mut self) -> Duration {
        if self.attempts > 0 {
            self.current = self.current.saturating_mul(2).min(self.policy.cap);
        }
        self.attempts = self.attempts.saturating_add(1);

        let max_ms = self.current.as_millis().min(u128::from(u64::MAX)) as u64;
        let delay_ms = match max_ms {
            0 => MIN_DELAY_MS,
            1..=MIN_DELAY_MS => max_ms,
            _ => self.rng.gen_range((max_ms / 2).max(MIN_DELAY_MS)..=max_ms),
        };
        Duration::from_millis(delay_ms)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
