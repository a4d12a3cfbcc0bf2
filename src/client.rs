//! Pooled HTTP client for backend forwarding
//!
//! Connections to backend instances are reused across requests. Bodies are
//! fully buffered (`Full<Bytes>`) so a failed attempt can be re-sent by the
//! retry loop.

use crate::config::PoolConfig;
use crate::error::{GatewayError, TransportKind};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use std::time::Duration;
use tracing::debug;

/// A fully-buffered backend response
#[derive(Debug)]
pub struct BackendReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Connection-pooled client for backend instances (HTTPS, with plain HTTP
/// allowed for test backends)
pub struct BackendPool {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl BackendPool {
    pub fn new(config: &PoolConfig) -> anyhow::Result<Self> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);

        let tls = TlsConnector::new()
            .map_err(|e| anyhow::anyhow!("Failed to build TLS connector: {}", e))?;
        let https = HttpsConnector::from((http, tls.into()));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout())
            .build(https);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout().as_secs(),
            "Backend connection pool initialized"
        );

        Ok(Self { client })
    }

    /// Issue one outbound attempt, bounded by `timeout`.
    ///
    /// Any HTTP response, error status included, comes back as `Ok`; the
    /// caller classifies statuses. `Err` means the attempt produced no
    /// usable response.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
        timeout: Duration,
    ) -> Result<BackendReply, GatewayError> {
        let mut builder = Request::builder().method(method).uri(url);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| GatewayError::RequestBuild(e.to_string()))?;

        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| {
                let kind = if e.is_connect() {
                    TransportKind::Connect
                } else {
                    TransportKind::Io
                };
                GatewayError::Transport {
                    kind,
                    message: e.to_string(),
                }
            })?;

            let (parts, body) = response.into_parts();
            let bytes = body
                .collect()
                .await
                .map_err(|e| GatewayError::Transport {
                    kind: TransportKind::Io,
                    message: e.to_string(),
                })?
                .to_bytes();

            Ok(BackendReply {
                status: parts.status,
                headers: parts.headers,
                body: bytes,
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::timeout(format!(
                "no response from {} within {}ms",
                url,
                timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation() {
        let pool = BackendPool::new(&PoolConfig::default());
        assert!(pool.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_url_is_request_build_error() {
        let pool = BackendPool::new(&PoolConfig::default()).unwrap();
        let err = pool
            .send(
                Method::GET,
                "https://exa mple.com/",
                &HeaderMap::new(),
                Bytes::new(),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RequestBuild(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let pool = BackendPool::new(&PoolConfig::default()).unwrap();
        // a port nothing listens on
        let err = pool
            .send(
                Method::GET,
                "http://127.0.0.1:9/none",
                &HeaderMap::new(),
                Bytes::new(),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        match err {
            GatewayError::Transport { kind, .. } => {
                assert_ne!(kind, TransportKind::Timeout);
            }
            other => panic!("expected transport error, got {:?}", other),
        }
    }
}
