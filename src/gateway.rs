//! The gateway itself: component ownership and lifecycle
//!
//! `ApiGateway` owns the registry client, proxy engine, liveness
//! controller, and the shared status cell, and hands out the ingress
//! server and background tasks that `main` (or a test harness) drives.

use crate::config::GatewayConfig;
use crate::liveness::LivenessController;
use crate::proxy::{ProxyEngine, ProxyServer};
use crate::registry::{Credential, RegistryClient, RegistryError};
use crate::retry::RetryPolicy;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Gateway lifecycle state. Requests are proxied only while `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Starting,
    Active,
    HealthCheckFail,
    Reregistering,
    ShuttingDown,
}

impl GatewayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayStatus::Starting => "STARTING",
            GatewayStatus::Active => "ACTIVE",
            GatewayStatus::HealthCheckFail => "HEALTH_CHECK_FAIL",
            GatewayStatus::Reregistering => "REREGISTERING",
            GatewayStatus::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Error code for requests rejected while in this state
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayStatus::Starting => "GATEWAY_STARTING",
            GatewayStatus::Active => "ACTIVE",
            GatewayStatus::HealthCheckFail => "REGISTRY_HEALTH_CHECK_FAIL",
            GatewayStatus::Reregistering => "ATTEMPTING_REREGISTRATION",
            GatewayStatus::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Human message for requests rejected while in this state
    pub fn reject_message(&self) -> &'static str {
        match self {
            GatewayStatus::Starting => "Gateway is starting. Please try again shortly",
            GatewayStatus::Active => "Gateway is active",
            GatewayStatus::HealthCheckFail => {
                "Gateway failed its registry health check. Please try again shortly"
            }
            GatewayStatus::Reregistering => {
                "Gateway is re-registering with the service registry. Please try again shortly"
            }
            GatewayStatus::ShuttingDown => "Gateway is shutting down",
        }
    }
}

impl std::fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advance the shared status cell. `SHUTTING_DOWN` is terminal: once
/// latched, no further transition applies.
pub(crate) fn transition(tx: &watch::Sender<GatewayStatus>, next: GatewayStatus) {
    tx.send_if_modified(|current| {
        if *current == next || *current == GatewayStatus::ShuttingDown {
            return false;
        }
        info!(from = %*current, to = %next, "Gateway status transition");
        *current = next;
        true
    });
}

pub struct ApiGateway {
    config: GatewayConfig,
    registry: Arc<RegistryClient>,
    engine: Arc<ProxyEngine>,
    status_tx: Arc<watch::Sender<GatewayStatus>>,
    status_rx: watch::Receiver<GatewayStatus>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiGateway {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Arc<Self>> {
        let (status_tx, status_rx) = watch::channel(GatewayStatus::Starting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registry = Arc::new(RegistryClient::new(
            config.registry_url.clone(),
            config.health_endpoint.clone(),
            config.registration_key.clone(),
            config.request_timeout(),
        )?);
        let engine = Arc::new(ProxyEngine::new(
            &config,
            Arc::clone(&registry),
            status_rx.clone(),
        )?);

        Ok(Arc::new(Self {
            config,
            registry,
            engine,
            status_tx: Arc::new(status_tx),
            status_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn status(&self) -> GatewayStatus {
        *self.status_rx.borrow()
    }

    /// Receiver for the termination signal (flips to true once)
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Latch SHUTTING_DOWN and raise the termination signal
    pub fn trigger_shutdown(&self) {
        transition(&self.status_tx, GatewayStatus::ShuttingDown);
        let _ = self.shutdown_tx.send(true);
    }

    /// Register with the registry once; on success the gateway goes ACTIVE
    pub async fn register(&self) -> Result<Credential, RegistryError> {
        let credential = self.registry.register(self.config.port).await?;
        transition(&self.status_tx, GatewayStatus::Active);
        info!(service_id = %credential.service_id, "Gateway registered and active");
        Ok(credential)
    }

    /// Keep registering until it succeeds. Only a missing registration key
    /// is fatal; transport failures back off and retry while the gateway
    /// keeps answering 503.
    pub async fn register_until_ready(&self) -> anyhow::Result<()> {
        let retry = RetryPolicy::new(self.config.retry.clone());
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut attempt: u32 = 0;

        loop {
            match self.register().await {
                Ok(_) => return Ok(()),
                Err(e @ RegistryError::MissingRegistrationKey) => {
                    return Err(e.into());
                }
                Err(e) => {
                    // cap the exponent so the backoff stays at max_delay
                    attempt = (attempt + 1).min(16);
                    warn!(attempt, error = %e, "Registration failed, retrying");
                    tokio::select! {
                        _ = retry.delay(attempt) => {}
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                anyhow::bail!("shutdown requested before registration completed");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Bind the ingress server on the configured address
    pub async fn bind(&self) -> anyhow::Result<ProxyServer> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind, self.config.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;
        self.bind_addr(addr).await
    }

    /// Bind the ingress server on an explicit address (test harnesses use
    /// port 0 and read back `local_addr`)
    pub async fn bind_addr(&self, addr: SocketAddr) -> anyhow::Result<ProxyServer> {
        ProxyServer::bind(addr, Arc::clone(&self.engine), self.shutdown_rx.clone()).await
    }

    /// Start the registry health check loop, unless disabled by config
    pub fn spawn_liveness(&self) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.health_checks {
            return None;
        }
        let controller = LivenessController::new(
            &self.config,
            Arc::clone(&self.registry),
            Arc::clone(&self.status_tx),
            Arc::clone(&self.shutdown_tx),
            self.shutdown_rx.clone(),
        );
        Some(tokio::spawn(controller.run()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_and_messages() {
        assert_eq!(GatewayStatus::Starting.error_code(), "GATEWAY_STARTING");
        assert_eq!(
            GatewayStatus::Starting.reject_message(),
            "Gateway is starting. Please try again shortly"
        );
        assert_eq!(
            GatewayStatus::HealthCheckFail.error_code(),
            "REGISTRY_HEALTH_CHECK_FAIL"
        );
        assert_eq!(
            GatewayStatus::Reregistering.error_code(),
            "ATTEMPTING_REREGISTRATION"
        );
        assert_eq!(GatewayStatus::ShuttingDown.error_code(), "SHUTTING_DOWN");
        assert_eq!(GatewayStatus::Active.as_str(), "ACTIVE");
    }

    #[test]
    fn test_transition_latch() {
        let (tx, rx) = watch::channel(GatewayStatus::Starting);

        transition(&tx, GatewayStatus::Active);
        assert_eq!(*rx.borrow(), GatewayStatus::Active);

        transition(&tx, GatewayStatus::ShuttingDown);
        transition(&tx, GatewayStatus::Active);
        assert_eq!(*rx.borrow(), GatewayStatus::ShuttingDown);
    }

    #[tokio::test]
    async fn test_fresh_gateway_is_starting() {
        let gateway = ApiGateway::new(GatewayConfig::default()).unwrap();
        assert_eq!(gateway.status(), GatewayStatus::Starting);
        assert!(!*gateway.shutdown_signal().borrow());
    }

    #[tokio::test]
    async fn test_register_without_key_is_fatal() {
        let config = GatewayConfig {
            registration_key: None,
            ..GatewayConfig::default()
        };
        let gateway = ApiGateway::new(config).unwrap();
        let err = gateway.register().await.unwrap_err();
        assert!(matches!(err, RegistryError::MissingRegistrationKey));
        assert_eq!(gateway.status(), GatewayStatus::Starting);
    }

    #[tokio::test]
    async fn test_trigger_shutdown() {
        let gateway = ApiGateway::new(GatewayConfig::default()).unwrap();
        gateway.trigger_shutdown();
        assert_eq!(gateway.status(), GatewayStatus::ShuttingDown);
        assert!(*gateway.shutdown_signal().borrow());
    }
}
