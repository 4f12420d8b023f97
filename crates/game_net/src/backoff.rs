//! Exponential backoff used by the accept loop.

use crate::config::BackoffConfig;
use std::time::Duration;

/// Smallest delay the backoff ever sleeps for once it has been raised.
pub const MIN_DELAY: Duration = Duration::from_millis(1);

/// Stateful exponential delay.
///
/// Each server owns its own instance; nothing is shared between servers in the
/// same process.
#[derive(Debug, Clone)]
pub struct BackoffDelay {
    floor: Duration,
    ceiling: Duration,
    multiplier: u32,
    current: Duration,
}

impl BackoffDelay {
    pub fn new(floor: Duration, ceiling: Duration, multiplier: u32) -> Self {
        Self {
            floor,
            ceiling,
            multiplier,
            current: floor,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.floor(), config.ceiling(), config.multiplier)
    }

    /// Current delay.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Multiplies the current delay, clamped to the ceiling.
    ///
    /// A zero delay is lifted to [`MIN_DELAY`] so a raised backoff always
    /// sleeps.
    pub fn up(&mut self) {
        self.current = self
            .current
            .saturating_mul(self.multiplier)
            .min(self.ceiling)
            .max(MIN_DELAY);
    }

    /// Grows the delay, then sleeps for it.
    pub async fn delay(&mut self) {
        self.up();
        tokio::time::sleep(self.current).await;
    }

    /// Restores the floor.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

impl Default for BackoffDelay {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}
