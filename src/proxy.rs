//! Ingress server and per-request proxy pipeline
//!
//! Every inbound request runs: gate on gateway status, resolve the service
//! through the registry, pick an instance, forward with retry under the
//! per-attempt and total budgets, then shape the response into the
//! standard envelope.

use crate::client::{BackendPool, BackendReply};
use crate::config::{BackendScheme, GatewayConfig};
use crate::envelope::{envelope_response, error_response, ApiResponse};
use crate::error::{codes, GatewayError};
use crate::gateway::GatewayStatus;
use crate::headers::{filter_request, filter_response};
use crate::loadbalancer::LoadBalancer;
use crate::registry::{RegistryClient, RegistryError};
use crate::retry::RetryPolicy;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Service names the gateway fronts. Compile-time constant; adding a
/// service requires a rebuild.
pub const KNOWN_SERVICES: [&str; 4] = ["products", "orders", "cart", "users"];

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Per-request proxy pipeline
pub struct ProxyEngine {
    registry: Arc<RegistryClient>,
    balancer: LoadBalancer,
    retry: RetryPolicy,
    pool: BackendPool,
    status_rx: watch::Receiver<GatewayStatus>,
    scheme: BackendScheme,
    request_timeout: Duration,
    total_request_timeout: Duration,
}

impl ProxyEngine {
    pub fn new(
        config: &GatewayConfig,
        registry: Arc<RegistryClient>,
        status_rx: watch::Receiver<GatewayStatus>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            registry,
            balancer: LoadBalancer::new(config.load_balancer_strategy),
            retry: RetryPolicy::new(config.retry.clone()),
            pool: BackendPool::new(&config.pool)?,
            status_rx,
            scheme: config.backend_scheme,
            request_timeout: config.request_timeout(),
            total_request_timeout: config.total_request_timeout(),
        })
    }

    /// Proxy one request to an instance of `service`, with `tail` as the
    /// path remainder (used verbatim, no re-encoding).
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        service: &str,
        tail: &str,
        client_addr: SocketAddr,
        request_id: &str,
    ) -> ProxyResponse {
        // Requests are proxied only while the gateway is ACTIVE
        let status = *self.status_rx.borrow();
        if status != GatewayStatus::Active {
            debug!(service, %status, request_id, "Rejecting request, gateway not active");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                status.error_code(),
                status.reject_message(),
            );
        }

        let (parts, body) = req.into_parts();
        let original_host = parts.headers.get(hyper::header::HOST).cloned();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(service, request_id, error = %e, "Failed to read request body");
                return self.shape_error(
                    GatewayError::Unknown(format!("failed to read request body: {}", e)),
                    request_id,
                );
            }
        };

        // Header hygiene, then proxy metadata.
        // X-Forwarded-* values overwrite anything client-provided: this
        // gateway is assumed to be the first trusted hop.
        let mut headers = filter_request(&parts.headers);
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

        // Resolve the service to live instances via the registry
        let instances = match self.registry.get_services(service).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(service, request_id, error = %e, "Registry lookup failed");
                return self.shape_error(registry_lookup_error(e), request_id);
            }
        };

        let Some(target) = self.balancer.select(service, &instances) else {
            return self.shape_error(
                GatewayError::local(
                    StatusCode::BAD_GATEWAY,
                    codes::GATEWAY_ERROR,
                    format!("No live instances registered for service '{}'", service),
                ),
                request_id,
            );
        };

        let url = format!(
            "{}://{}:{}/{}",
            self.scheme.as_str(),
            target.host,
            target.port,
            tail
        );
        debug!(service, url = %url, method = %parts.method, request_id, "Forwarding request");

        // Forward with retry. The budget is bounded by both attempt count
        // and wall-clock time; whichever trips first wins.
        let start = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            let outcome = self
                .pool
                .send(
                    parts.method.clone(),
                    &url,
                    &headers,
                    body.clone(),
                    self.request_timeout,
                )
                .await;

            let err = match outcome {
                Ok(reply) if reply.status.as_u16() < 400 => {
                    return self.success_response(reply);
                }
                Ok(reply) => GatewayError::BackendResponse {
                    status: reply.status,
                    headers: reply.headers,
                    body: reply.body,
                },
                Err(e) => e,
            };

            attempt += 1;
            if !self.retry.should_retry(&err, attempt) {
                return self.shape_error(err, request_id);
            }
            if start.elapsed() >= self.total_request_timeout {
                warn!(service, url = %url, request_id, "Total retry budget exhausted");
                return self.shape_error(
                    GatewayError::local(
                        StatusCode::GATEWAY_TIMEOUT,
                        codes::GATEWAY_TIMEOUT,
                        "Request could not be completed within the total timeout",
                    ),
                    request_id,
                );
            }
            debug!(service, url = %url, attempt, request_id, error = %err, "Retrying request");
            self.retry.delay(attempt).await;
        }
    }

    /// Rewrap a backend success: the backend's `data` field moves into a
    /// fresh gateway envelope, its own timestamp is discarded, and its
    /// headers are forwarded after filtering.
    fn success_response(&self, reply: BackendReply) -> ProxyResponse {
        let envelope = ApiResponse::success(extract_data(&reply.body));
        envelope_response(reply.status, Some(filter_response(&reply.headers)), &envelope)
    }

    /// Classify an error into `{status, code, message, data?}` and emit
    /// the envelope
    fn shape_error(&self, err: GatewayError, request_id: &str) -> ProxyResponse {
        match err {
            GatewayError::BackendResponse {
                status,
                headers,
                body,
            } => {
                let (code, message) = backend_error_parts(&body);
                debug!(request_id, %status, code = %code, "Backend error passed through");
                envelope_response(
                    status,
                    Some(filter_response(&headers)),
                    &ApiResponse::failure(code, Some(message)),
                )
            }
            // request went out, nothing usable came back
            GatewayError::Transport { message, .. } => {
                error_response(StatusCode::BAD_GATEWAY, codes::GATEWAY_ERROR, message)
            }
            // request never left the gateway
            GatewayError::RequestBuild(message) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::GATEWAY_ERROR,
                message,
            ),
            GatewayError::Local {
                status,
                code,
                message,
                data,
            } => envelope_response(
                status,
                None,
                &ApiResponse::failure_with_data(code, Some(message), data),
            ),
            GatewayError::Unknown(message) => {
                error!(request_id, error = %message, "Unclassified proxy error");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    codes::UNKNOWN_ERROR,
                    message,
                )
            }
        }
    }
}

/// A registry failure during resolution surfaces as a 502-class gateway
/// error; the registry is upstream of the backend from the client's view.
fn registry_lookup_error(err: RegistryError) -> GatewayError {
    GatewayError::local(StatusCode::BAD_GATEWAY, codes::GATEWAY_ERROR, err.to_string())
}

/// Pull the `data` field out of a backend envelope body. Non-JSON bodies
/// and envelopes without `data` yield nothing.
fn extract_data(body: &Bytes) -> Option<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("data").cloned()
}

/// Backend error code and message per the shaping rules: envelope
/// `error.code` else SERVICE_ERROR; envelope `error.message`, else the
/// `error` string itself, else a fixed fallback.
fn backend_error_parts(body: &Bytes) -> (String, String) {
    let value: Option<serde_json::Value> = serde_json::from_slice(body).ok();
    let error = value.as_ref().and_then(|v| v.get("error"));

    let code = error
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
        .unwrap_or(codes::SERVICE_ERROR)
        .to_string();
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .or_else(|| error.and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| "Unknown error occured".to_string());

    (code, message)
}

/// Split `/{service}/<rest>` into the service name and the tail (path
/// remainder plus query, used verbatim when building the target URL)
fn split_route(path_and_query: &str) -> Option<(&str, &str)> {
    let trimmed = path_and_query.strip_prefix('/')?;
    let end = trimmed.find(['/', '?']).unwrap_or(trimmed.len());
    let (service, rest) = trimmed.split_at(end);
    if service.is_empty() {
        return None;
    }
    Some((service, rest.strip_prefix('/').unwrap_or(rest)))
}

/// Route dispatch: known service prefixes reach the engine, everything
/// else is SERVICE_NO_EXIST
async fn dispatch(
    req: Request<Incoming>,
    engine: Arc<ProxyEngine>,
    client_addr: SocketAddr,
) -> Result<ProxyResponse, hyper::Error> {
    // Generate or propagate the request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    debug!(path = %path_and_query, method = %req.method(), request_id, "Incoming request");

    match split_route(&path_and_query) {
        Some((service, tail)) if KNOWN_SERVICES.contains(&service) => {
            Ok(engine.handle(req, service, tail, client_addr, &request_id).await)
        }
        _ => Ok(error_response(
            StatusCode::NOT_FOUND,
            codes::SERVICE_NO_EXIST,
            "Requested service does not exist",
        )),
    }
}

/// The ingress HTTP server
pub struct ProxyServer {
    listener: TcpListener,
    engine: Arc<ProxyEngine>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub async fn bind(
        addr: SocketAddr,
        engine: Arc<ProxyEngine>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            engine,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let engine = Arc::clone(&self.engine);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, engine).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<ProxyEngine>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let engine = Arc::clone(&engine);
        async move { dispatch(req, engine, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_route() {
        assert_eq!(split_route("/products/all"), Some(("products", "all")));
        assert_eq!(
            split_route("/orders/42/items?expand=1"),
            Some(("orders", "42/items?expand=1"))
        );
        assert_eq!(split_route("/cart"), Some(("cart", "")));
        assert_eq!(split_route("/users?limit=5"), Some(("users", "?limit=5")));
        assert_eq!(split_route("/"), None);
        assert_eq!(split_route(""), None);
    }

    #[test]
    fn test_known_services() {
        for service in ["products", "orders", "cart", "users"] {
            assert!(KNOWN_SERVICES.contains(&service));
        }
        assert!(!KNOWN_SERVICES.contains(&"nothing"));
        assert!(!KNOWN_SERVICES.contains(&"Products"));
    }

    #[test]
    fn test_extract_data() {
        let body = Bytes::from(r#"{"success":true,"timestamp":1,"data":{"message":"ok"}}"#);
        assert_eq!(
            extract_data(&body).unwrap()["message"],
            serde_json::Value::from("ok")
        );

        assert!(extract_data(&Bytes::from(r#"{"success":true}"#)).is_none());
        assert!(extract_data(&Bytes::from("not json")).is_none());
        assert!(extract_data(&Bytes::new()).is_none());
    }

    #[test]
    fn test_backend_error_parts_envelope() {
        let body = Bytes::from(
            r#"{"success":false,"error":{"code":"VALIDATION_ERROR","message":"Invalid input"}}"#,
        );
        let (code, message) = backend_error_parts(&body);
        assert_eq!(code, "VALIDATION_ERROR");
        assert_eq!(message, "Invalid input");
    }

    #[test]
    fn test_backend_error_parts_string_error() {
        let body = Bytes::from(r#"{"success":false,"error":"things broke"}"#);
        let (code, message) = backend_error_parts(&body);
        assert_eq!(code, "SERVICE_ERROR");
        assert_eq!(message, "things broke");
    }

    #[test]
    fn test_backend_error_parts_fallbacks() {
        let (code, message) = backend_error_parts(&Bytes::from("<html>oops</html>"));
        assert_eq!(code, "SERVICE_ERROR");
        assert_eq!(message, "Unknown error occured");

        let (code, _) = backend_error_parts(&Bytes::from(r#"{"error":{"code":"RATE_LIMITED"}}"#));
        assert_eq!(code, "RATE_LIMITED");
    }
}
