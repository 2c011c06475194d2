//! Connect retries with exponential backoff.

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::{debug, warn};

use super::config::ConnectConfig;
use crate::error::{McpError, McpResult};

/// Retries connection attempts to one endpoint with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectionManager {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectionManager {
    fn default() -> Self {
        Self::from_config(&ConnectConfig::default())
    }
}

impl ReconnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ConnectConfig) -> Self {
        Self {
            max_attempts: config.attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// delay = min(base_delay * 2^(attempt-1), max_delay)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 2u64.saturating_pow(exponent);
        let delay = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as u64))
    }

    fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run `connect_fn` until it succeeds or attempts are exhausted.
    /// Configuration errors are permanent and returned immediately.
    pub async fn retry<F, Fut, T>(&self, endpoint: &str, mut connect_fn: F) -> McpResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = McpResult<T>>,
    {
        let max_attempts = self.max_attempts;
        let attempts = AtomicU32::new(0);

        backoff::future::retry_notify(
            self.policy(),
            || {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                let connecting = connect_fn();
                async move {
                    match connecting.await {
                        Ok(val) => {
                            if attempt > 1 {
                                debug!(endpoint, attempt, "Connected after retry");
                            }
                            Ok(val)
                        }
                        Err(e) if matches!(e, McpError::Config(_)) || attempt >= max_attempts => {
                            Err(backoff::Error::permanent(e))
                        }
                        Err(e) => Err(backoff::Error::transient(e)),
                    }
                }
            },
            |e: McpError, delay: Duration| {
                warn!(
                    endpoint,
                    attempt = attempts.load(Ordering::Relaxed),
                    error = %e,
                    "Connect attempt failed, retrying in {:?}",
                    delay
                );
            },
        )
        .await
    }
}
