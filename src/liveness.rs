//! Registry health check loop and gateway lifecycle FSM
//!
//! Runs as a background task independent of the request path. Probes the
//! registry on an interval and drives the shared gateway status: recovery
//! back to ACTIVE, re-registration on credential revocation, or orderly
//! shutdown when the failure budget runs out.

use crate::config::{GatewayConfig, HealthCheckFailStrategy};
use crate::gateway::{transition, GatewayStatus};
use crate::registry::{RegistryClient, RegistryError, RegistryHealth};
use crate::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// In-place probe retries after a failed health check, before the fail
/// strategy applies
const PROBE_RETRY_LIMIT: u32 = 3;

pub struct LivenessController {
    registry: Arc<RegistryClient>,
    retry: RetryPolicy,
    status_tx: Arc<watch::Sender<GatewayStatus>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    interval: Duration,
    fail_strategy: HealthCheckFailStrategy,
    register_port: u16,
    max_register_retries: u32,
}

impl LivenessController {
    pub fn new(
        config: &GatewayConfig,
        registry: Arc<RegistryClient>,
        status_tx: Arc<watch::Sender<GatewayStatus>>,
        shutdown_tx: Arc<watch::Sender<bool>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            retry: RetryPolicy::new(config.retry.clone()),
            status_tx,
            shutdown_tx,
            shutdown_rx,
            interval: config.health_check_interval(),
            fail_strategy: config.health_check_fail_strategy,
            register_port: config.port,
            max_register_retries: config.retry.max_retries,
        }
    }

    /// Run the probe loop until shutdown. Only one probe is in flight at a
    /// time; the pending timer is dropped (cancelled) the moment the
    /// shutdown flag flips.
    pub async fn run(mut self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            strategy = ?self.fail_strategy,
            "Registry health check loop started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if !self.probe_cycle().await {
                        break;
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Health check loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One scheduled probe plus whatever recovery it requires.
    /// Returns false when the gateway should terminate.
    async fn probe_cycle(&self) -> bool {
        match self.registry.health().await {
            Ok(RegistryHealth::Up) => {
                self.set_status(GatewayStatus::Active);
                true
            }
            Err(RegistryError::Unauthorized) => self.reregister().await,
            Ok(RegistryHealth::Down) => {
                warn!("Registry reports DOWN");
                self.probe_retries().await
            }
            // probe timeouts land here too
            Err(e) => {
                warn!(error = %e, "Registry health probe failed");
                self.probe_retries().await
            }
        }
    }

    /// Retry a failed probe in place before applying the fail strategy
    async fn probe_retries(&self) -> bool {
        self.set_status(GatewayStatus::HealthCheckFail);

        for attempt in 1..=PROBE_RETRY_LIMIT {
            self.retry.delay(attempt).await;
            match self.registry.health().await {
                Ok(RegistryHealth::Up) => {
                    info!(attempt, "Registry health recovered");
                    self.set_status(GatewayStatus::Active);
                    return true;
                }
                Err(RegistryError::Unauthorized) => return self.reregister().await,
                Ok(RegistryHealth::Down) => {
                    debug!(attempt, "Registry still DOWN");
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Probe retry failed");
                }
            }
        }

        match self.fail_strategy {
            HealthCheckFailStrategy::Shutdown => {
                error!(
                    retries = PROBE_RETRY_LIMIT,
                    "Registry health check budget exhausted, shutting down"
                );
                self.terminate();
                false
            }
            HealthCheckFailStrategy::TryAgain => {
                warn!(
                    retries = PROBE_RETRY_LIMIT,
                    "Registry health check still failing, probing again after the interval"
                );
                true
            }
        }
    }

    /// The registry revoked our credential: re-register, bounded by the
    /// retry budget with exponential backoff between attempts
    async fn reregister(&self) -> bool {
        warn!("Registry credential revoked, re-registering");
        self.set_status(GatewayStatus::Reregistering);

        for attempt in 1..=self.max_register_retries {
            match self.registry.register(self.register_port).await {
                Ok(credential) => {
                    info!(service_id = %credential.service_id, "Re-registered with registry");
                    self.set_status(GatewayStatus::Active);
                    return true;
                }
                Err(RegistryError::MissingRegistrationKey) => {
                    error!("Cannot re-register without a registration key");
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Re-registration attempt failed");
                    if attempt < self.max_register_retries {
                        self.retry.delay(attempt).await;
                    }
                }
            }
        }

        error!(
            attempts = self.max_register_retries,
            "Re-registration failed, shutting down"
        );
        self.terminate();
        false
    }

    fn set_status(&self, status: GatewayStatus) {
        transition(&self.status_tx, status);
    }

    /// SHUTTING_DOWN is latched before the termination signal goes out
    fn terminate(&self) {
        self.set_status(GatewayStatus::ShuttingDown);
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn controller() -> (LivenessController, watch::Receiver<GatewayStatus>, watch::Receiver<bool>) {
        let config = GatewayConfig::default();
        let registry = Arc::new(
            RegistryClient::new(
                "http://127.0.0.1:9",
                "/health",
                Some("key".to_string()),
                Duration::from_millis(100),
            )
            .unwrap(),
        );
        let (status_tx, status_rx) = watch::channel(GatewayStatus::Active);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = LivenessController::new(
            &config,
            registry,
            Arc::new(status_tx),
            Arc::new(shutdown_tx),
            shutdown_rx.clone(),
        );
        (controller, status_rx, shutdown_rx)
    }

    #[test]
    fn test_terminate_latches_before_signal() {
        let (controller, status_rx, shutdown_rx) = controller();

        controller.terminate();
        assert_eq!(*status_rx.borrow(), GatewayStatus::ShuttingDown);
        assert!(*shutdown_rx.borrow());

        // terminal: no transition leaves SHUTTING_DOWN
        controller.set_status(GatewayStatus::Active);
        assert_eq!(*status_rx.borrow(), GatewayStatus::ShuttingDown);
    }

    #[test]
    fn test_status_transitions() {
        let (controller, status_rx, _shutdown_rx) = controller();

        controller.set_status(GatewayStatus::HealthCheckFail);
        assert_eq!(*status_rx.borrow(), GatewayStatus::HealthCheckFail);

        controller.set_status(GatewayStatus::Reregistering);
        assert_eq!(*status_rx.borrow(), GatewayStatus::Reregistering);

        controller.set_status(GatewayStatus::Active);
        assert_eq!(*status_rx.borrow(), GatewayStatus::Active);
    }
}
