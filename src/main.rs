use apigate::config::GatewayConfig;
use apigate::gateway::ApiGateway;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// How long in-flight work gets to finish after shutdown starts
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = GatewayConfig::from_env();
    print_startup_banner(&config);

    let gateway = ApiGateway::new(config)?;

    // Serve immediately; requests answer 503 until registration lands
    let server = gateway.bind().await?;
    let server_handle = tokio::spawn(server.run());

    // Register, then hand the lifecycle to the health check loop
    let lifecycle_handle = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            if let Err(e) = gateway.register_until_ready().await {
                error!(error = %e, "Registration failed fatally");
                gateway.trigger_shutdown();
                return Err(e);
            }
            if let Some(liveness) = gateway.spawn_liveness() {
                let _ = liveness.await;
            }
            Ok(())
        })
    };

    wait_for_shutdown(&gateway).await;

    // Signal shutdown and drain
    gateway.trigger_shutdown();
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
        let _ = server_handle.await;
    })
    .await;

    // Surface a fatal registration failure as a non-zero exit
    if lifecycle_handle.is_finished() {
        if let Ok(Err(e)) = lifecycle_handle.await {
            return Err(e);
        }
    } else {
        lifecycle_handle.abort();
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing() {
    // LOG_LEVEL takes precedence, then RUST_LOG, then a sane default
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| {
            EnvFilter::from_default_env()
                .add_directive("apigate=info".parse().expect("valid log directive"))
        });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wait for SIGINT, SIGTERM, or the liveness controller's termination
/// signal
async fn wait_for_shutdown(gateway: &Arc<ApiGateway>) {
    let mut shutdown_rx = gateway.shutdown_signal();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Termination signal raised internally, shutting down...");
                        break;
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                    break;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Termination signal raised internally, shutting down...");
                        break;
                    }
                }
            }
        }
    }
}

fn print_startup_banner(config: &GatewayConfig) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting API gateway"
    );
    info!(
        bind = %config.bind,
        port = config.port,
        registry_url = %config.registry_url,
        strategy = ?config.load_balancer_strategy,
        backend_scheme = config.backend_scheme.as_str(),
        "Gateway configuration"
    );
    info!(
        request_timeout_ms = config.request_timeout_ms,
        total_request_timeout_ms = config.total_request_timeout_ms,
        max_retries = config.retry.max_retries,
        base_delay_ms = config.retry.base_delay_ms,
        max_delay_ms = config.retry.max_delay_ms,
        "Forwarding settings"
    );
    info!(
        health_checks = config.health_checks,
        health_check_interval_ms = config.health_check_interval_ms,
        fail_strategy = ?config.health_check_fail_strategy,
        health_endpoint = %config.health_endpoint,
        "Health check settings"
    );
}
