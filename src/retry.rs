//! Retry classification and backoff
//!
//! Shared by the proxy engine (forwarding retries) and the liveness
//! controller (probe and re-registration retries). Stateless; cheap to
//! clone into every task that needs it.

use crate::config::RetryConfig;
use crate::error::GatewayError;
use rand::Rng;
use std::time::Duration;

/// Jitter ceiling. Deliberately small: it de-synchronizes concurrent
/// retriers rather than smoothing load.
const JITTER_CEILING_MS: u64 = 10;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Whether the given failed attempt should be retried.
    ///
    /// `attempt` is 1-indexed: the first issued request that fails is
    /// attempt 1. Only transport timeouts and backend statuses in the
    /// retryable set qualify; everything else fails fast.
    pub fn should_retry(&self, err: &GatewayError, attempt: u32) -> bool {
        if attempt >= self.config.max_retries {
            return false;
        }
        if err.is_transport_timeout() {
            return true;
        }
        match err.backend_status() {
            Some(status) => self.config.retryable_statuses.contains(&status.as_u16()),
            None => false,
        }
    }

    /// Backoff delay for an attempt, without jitter:
    /// `min(max_delay, base_delay * 2^attempt)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .config
            .base_delay()
            .saturating_mul(2u32.saturating_pow(attempt));
        exponential.min(self.config.max_delay())
    }

    /// Sleep for the attempt's backoff delay plus uniform jitter in
    /// `[0, 10) ms`
    pub async fn delay(&self, attempt: u32) {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..JITTER_CEILING_MS));
        tokio::time::sleep(self.backoff_delay(attempt) + jitter).await;
    }
}
