//! Backoff between failed agent starts

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backoff applied by the pool after an agent fails to start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    #[serde(with = "crate::config::duration_millis")]
    pub initial_backoff: Duration,
    /// Upper bound on the delay
    #[serde(with = "crate::config::duration_millis")]
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Consecutive failures tolerated before the pool gives up (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "reconnect multiplier must be a finite number of at least 1.0 (got {})",
                self.multiplier
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(format!(
                "initial_backoff ({:?}) exceeds max_backoff ({:?})",
                self.initial_backoff, self.max_backoff
            ));
        }
        Ok(())
    }

    /// Delay following `current`, capped at `max_backoff`
    fn next_backoff(&self, current: Duration) -> Duration {
        let secs = current.as_secs_f64() * self.multiplier.max(1.0);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Tracks consecutive failures and the next delay
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Sleeps for the current backoff unless `cancel` fires first
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if matches!(self.config.max_attempts, Some(max) if self.attempt > max) {
            return Err(ReconnectError::MaxAttemptsReached);
        }

        debug!(
            attempt = self.attempt,
            backoff_ms = self.current_backoff.as_millis() as u64,
            "Backing off before next agent"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
            _ = tokio::time::sleep(self.current_backoff) => {}
        }

        self.current_backoff = self.config.next_backoff(self.current_backoff);

        Ok(())
    }

    /// Call after an agent connects
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!(attempts = self.attempt, "Resetting agent backoff");
        }
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
