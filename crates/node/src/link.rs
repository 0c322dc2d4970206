//! Broker link status and reconnect backoff.
//!
//! The node starts `Disconnected` and keeps irrigating regardless of the
//! link. Each failed attempt doubles the wait before the next one, capped at
//! the configured maximum; a successful ConnAck resets the ladder.

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkStatus {
    #[default]
    Disconnected,
    Connecting {
        attempt: u32,
    },
    Connected,
}

impl LinkStatus {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying:
    /// min, 2·min, 4·min, … up to max.
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.failures.min(16);
        self.failures = self.failures.saturating_add(1);
        self.min.saturating_mul(1u32 << shift).min(self.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// The status to report while waiting out the current delay.
    pub fn status(&self) -> LinkStatus {
        LinkStatus::Connecting {
            attempt: self.failures + 1,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
