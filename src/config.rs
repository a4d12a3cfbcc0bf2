//! Gateway configuration
//!
//! Every knob resolves with the same precedence: explicit option, then
//! environment variable, then built-in default.

use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

/// Environment variable holding the registration key presented to the
/// registry when the gateway registers itself. Required at registration
/// time; there is no default.
pub const REGISTRATION_KEY_VAR: &str = "SERVICE_REGISTRATION_KEY";

/// Load balancing strategy for picking a backend instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancerStrategy {
    /// Uniform random pick
    #[default]
    Random,
    /// Per-service rotating cursor
    RoundRobin,
}

impl std::str::FromStr for LoadBalancerStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "random" => Ok(LoadBalancerStrategy::Random),
            "round-robin" | "roundrobin" => Ok(LoadBalancerStrategy::RoundRobin),
            _ => anyhow::bail!("Unknown load balancer strategy: {}", s),
        }
    }
}

/// What to do when the registry health check keeps failing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthCheckFailStrategy {
    /// Stay up and probe again after the regular interval
    #[default]
    TryAgain,
    /// Emit the termination signal and shut the gateway down
    Shutdown,
}

impl std::str::FromStr for HealthCheckFailStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "try-again" | "tryagain" => Ok(HealthCheckFailStrategy::TryAgain),
            "shutdown" => Ok(HealthCheckFailStrategy::Shutdown),
            _ => anyhow::bail!("Unknown health check fail strategy: {}", s),
        }
    }
}

/// URL scheme used when forwarding to backend instances.
///
/// Production traffic goes over HTTPS; plain HTTP is selectable so test
/// harnesses can stand up unencrypted backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendScheme {
    #[default]
    Https,
    Http,
}

impl BackendScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendScheme::Https => "https",
            BackendScheme::Http => "http",
        }
    }
}

/// Retry behavior for forwarded requests
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts for a single proxied request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff, in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// HTTP status codes that are worth retrying
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: HashSet<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Connection pool settings for the backend HTTP client
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Maximum idle connections per backend host
    #[serde(default = "default_pool_max_idle_per_host")]
    pub max_idle_per_host: usize,
    /// Idle connection timeout in seconds
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_pool_max_idle_per_host(),
            idle_timeout_secs: default_pool_idle_timeout_secs(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the service registry
    #[serde(default = "default_registry_url")]
    pub registry_url: String,

    /// Port the gateway listens on (and registers with the registry)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Instance selection strategy
    #[serde(default)]
    pub load_balancer_strategy: LoadBalancerStrategy,

    /// Per-attempt timeout for a single outbound call, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Wall-clock budget for the whole retry sequence, in milliseconds
    #[serde(default = "default_total_request_timeout_ms")]
    pub total_request_timeout_ms: u64,

    /// Whether the background registry health check loop runs at all
    #[serde(default = "default_health_checks")]
    pub health_checks: bool,

    /// Interval between registry health probes, in milliseconds
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Behavior after the probe retry budget is exhausted
    #[serde(default)]
    pub health_check_fail_strategy: HealthCheckFailStrategy,

    /// Path of the registry health endpoint. The registry contract has been
    /// seen both as `/health` and `/service`; `/health` is canonical.
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,

    /// Scheme for backend forwarding (https in production)
    #[serde(default)]
    pub backend_scheme: BackendScheme,

    /// Registration key presented to the registry
    #[serde(default)]
    pub registration_key: Option<String>,

    /// Retry behavior for forwarded requests
    #[serde(default)]
    pub retry: RetryConfig,

    /// Backend connection pool settings
    #[serde(default)]
    pub pool: PoolConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            registry_url: default_registry_url(),
            port: default_listen_port(),
            bind: default_bind_address(),
            load_balancer_strategy: LoadBalancerStrategy::default(),
            request_timeout_ms: default_request_timeout_ms(),
            total_request_timeout_ms: default_total_request_timeout_ms(),
            health_checks: default_health_checks(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_check_fail_strategy: HealthCheckFailStrategy::default(),
            health_endpoint: default_health_endpoint(),
            backend_scheme: BackendScheme::default(),
            registration_key: None,
            retry: RetryConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Build a configuration from the process environment.
    ///
    /// Recognized variables: `REGISTRY_URL`, `PORT`,
    /// `SERVICE_REGISTRATION_KEY`, `LOAD_BALANCER_STRATEGY`. `LOG_LEVEL` is
    /// consumed by the tracing setup in `main`, `DOMAIN` by external CORS
    /// middleware.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REGISTRY_URL") {
            if !url.is_empty() {
                config.registry_url = url;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(key) = std::env::var(REGISTRATION_KEY_VAR) {
            if !key.is_empty() {
                config.registration_key = Some(key);
            }
        }
        if let Ok(strategy) = std::env::var("LOAD_BALANCER_STRATEGY") {
            if let Ok(strategy) = strategy.parse() {
                config.load_balancer_strategy = strategy;
            }
        }

        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn total_request_timeout(&self) -> Duration {
        Duration::from_millis(self.total_request_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

fn default_registry_url() -> String {
    "http://localhost:3002".to_string()
}

fn default_listen_port() -> u16 {
    3001
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_total_request_timeout_ms() -> u64 {
    10000
}

fn default_health_checks() -> bool {
    true
}

fn default_health_check_interval_ms() -> u64 {
    10000
}

fn default_health_endpoint() -> String {
    "/health".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_retryable_statuses() -> HashSet<u16> {
    [500, 502, 503, 504].into_iter().collect()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout_secs() -> u64 {
    90
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.registry_url, "http://localhost:3002");
        assert_eq!(config.port, 3001);
        assert_eq!(config.load_balancer_strategy, LoadBalancerStrategy::Random);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.total_request_timeout(), Duration::from_secs(10));
        assert!(config.health_checks);
        assert_eq!(config.health_check_interval(), Duration::from_secs(10));
        assert_eq!(
            config.health_check_fail_strategy,
            HealthCheckFailStrategy::TryAgain
        );
        assert_eq!(config.health_endpoint, "/health");
        assert_eq!(config.backend_scheme, BackendScheme::Https);
    }

    #[test]
    fn test_retry_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.base_delay(), Duration::from_secs(1));
        assert_eq!(retry.max_delay(), Duration::from_secs(5));
        for status in [500, 502, 503, 504] {
            assert!(retry.retryable_statuses.contains(&status));
        }
        assert!(!retry.retryable_statuses.contains(&404));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "round-robin".parse::<LoadBalancerStrategy>().unwrap(),
            LoadBalancerStrategy::RoundRobin
        );
        assert_eq!(
            "random".parse::<LoadBalancerStrategy>().unwrap(),
            LoadBalancerStrategy::Random
        );
        assert!("weighted".parse::<LoadBalancerStrategy>().is_err());

        assert_eq!(
            "try-again".parse::<HealthCheckFailStrategy>().unwrap(),
            HealthCheckFailStrategy::TryAgain
        );
        assert_eq!(
            "shutdown".parse::<HealthCheckFailStrategy>().unwrap(),
            HealthCheckFailStrategy::Shutdown
        );
    }

    #[test]
    fn test_scheme_strings() {
        assert_eq!(BackendScheme::Https.as_str(), "https");
        assert_eq!(BackendScheme::Http.as_str(), "http");
    }
}
