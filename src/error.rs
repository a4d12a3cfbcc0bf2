//! Typed errors for the proxy pipeline
//!
//! Everything that can go wrong between accepting a request and emitting a
//! response collapses into [`GatewayError`]; the proxy engine pattern-matches
//! on it to shape the client-facing envelope.

use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// Error codes emitted to clients
pub mod codes {
    pub const SERVICE_NO_EXIST: &str = "SERVICE_NO_EXIST";
    pub const GATEWAY_TIMEOUT: &str = "GATEWAY_TIMEOUT";
    pub const GATEWAY_ERROR: &str = "GATEWAY_ERROR";
    pub const SERVICE_ERROR: &str = "SERVICE_ERROR";
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
}

/// How an outbound attempt failed at the transport level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// The per-attempt timeout elapsed before a response arrived
    Timeout,
    /// The connection could not be established
    Connect,
    /// The connection was established but the exchange failed midway
    Io,
}

/// Error for a single proxied request
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The backend answered with an HTTP error status. Headers and body are
    /// kept so the shaper can forward debugging headers and extract the
    /// backend's own error envelope.
    #[error("backend responded with status {status}")]
    BackendResponse {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },

    /// The request went out but no usable response came back
    #[error("transport failure: {message}")]
    Transport {
        kind: TransportKind,
        message: String,
    },

    /// The request could never be issued (bad target URL, invalid header)
    #[error("request could not be issued: {0}")]
    RequestBuild(String),

    /// Gateway-originated condition carrying its own status and code
    #[error("{code}: {message}")]
    Local {
        status: StatusCode,
        code: &'static str,
        message: String,
        data: Option<Value>,
    },

    /// Anything that escaped classification
    #[error("unexpected failure: {0}")]
    Unknown(String),
}

impl GatewayError {
    pub fn local(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        GatewayError::Local {
            status,
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        GatewayError::Transport {
            kind: TransportKind::Timeout,
            message: message.into(),
        }
    }

    /// True for transport timeouts, the one transport shape worth retrying
    pub fn is_transport_timeout(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport {
                kind: TransportKind::Timeout,
                ..
            }
        )
    }

    /// Backend status code, when the error carries a backend response
    pub fn backend_status(&self) -> Option<StatusCode> {
        match self {
            GatewayError::BackendResponse { status, .. } => Some(*status),
            _ => None,
        }
    }
}
