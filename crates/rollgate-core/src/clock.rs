//! Rollout clock.
//!
//! Timestamps on signals, decisions and transitions are wall-clock
//! milliseconds, but they advance with tokio's monotonic clock from a
//! fixed origin. Samples are therefore strictly ordered even if the
//! system clock jumps, and tests running on a paused runtime get
//! deterministic timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy)]
pub struct RolloutClock {
    origin_ms: u64,
    origin: Instant,
}

impl RolloutClock {
    /// Start a clock anchored at the current wall-clock time.
    pub fn start() -> Self {
        Self::anchored_at(epoch_millis())
    }

    /// Start a clock whose first reading is `origin_ms`.
    pub fn anchored_at(origin_ms: u64) -> Self {
        Self {
            origin_ms,
            origin: Instant::now(),
        }
    }

    /// Current timestamp in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.origin_ms + self.origin.elapsed().as_millis() as u64
    }

    pub fn origin_ms(&self) -> u64 {
        self.origin_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn clock_advances_with_tokio_time() {
        let clock = RolloutClock::anchored_at(1_000);
        assert_eq!(clock.now_ms(), 1_000);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(clock.now_ms(), 31_000);
    }
}
