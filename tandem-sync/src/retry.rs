//! Capped exponential backoff.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest exponent applied to the multiplier.
const MAX_SHIFT: u32 = 16;

/// Backoff schedule shared by mutation retries, outbox flushes and channel
/// reconnects.
///
/// The wait before retry `n` (1-based) is `base * multiplier^(n-1)`, capped at
/// `max_delay_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::mutations()
    }
}

impl RetryPolicy {
    /// 250 ms doubling up to 8 s.
    pub const fn mutations() -> Self {
        Self {
            base_delay_ms: 250,
            multiplier: 2,
            max_delay_ms: 8_000,
        }
    }

    /// 500 ms doubling up to 30 s.
    pub const fn reconnect() -> Self {
        Self {
            base_delay_ms: 500,
            multiplier: 2,
            max_delay_ms: 30_000,
        }
    }

    /// Wait before retry number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.base_delay_ms.min(self.max_delay_ms));
        }
        let shift = (attempt - 1).min(MAX_SHIFT);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(shift);
        let millis = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(millis.min(self.max_delay_ms))
    }

    /// Like [`delay`](Self::delay), but never shorter than `floor`.
    pub fn delay_at_least(&self, attempt: u32, floor: Option<Duration>) -> Duration {
        let delay = self.delay(attempt);
        match floor {
            Some(floor) => delay.max(floor),
            None => delay,
        }
    }
}
