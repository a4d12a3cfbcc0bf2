//! HTTP client for the external service registry
//!
//! The gateway registers itself here, resolves service names to live
//! instances per request, and probes registry health from the liveness
//! loop. All calls speak the standard JSON envelope.

use crate::envelope::ApiResponse;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Service type the gateway registers itself under
pub const GATEWAY_SERVICE_TYPE: &str = "api-gateway";

/// Credential headers attached to registry calls after registration
const SERVICE_ID_HEADER: &str = "x-service-id";
const SERVICE_TOKEN_HEADER: &str = "x-service-token";

/// A registered backend instance as reported by the registry.
/// Never mutated in-gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub service_type: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub healthy: bool,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub last_updated: Option<i64>,
}

/// Identity issued by the registry at registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub service_id: String,
    pub token: String,
}

/// Registry health probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryHealth {
    Up,
    Down,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Fatal: registration was attempted without a key in the environment
    #[error("MISSING_REGISTRATION_KEY: SERVICE_REGISTRATION_KEY is not set")]
    MissingRegistrationKey,

    /// Recoverable transport failure reaching the registry
    #[error("REGISTRY_UNREACHABLE: {0}")]
    Unreachable(String),

    /// The registry rejected the gateway's credential (HTTP 401). The
    /// caller is expected to drive re-registration, not retry in place.
    #[error("registry rejected gateway credential")]
    Unauthorized,

    /// Any other HTTP error from the registry
    #[error("registry returned {status}: {message}")]
    Failed { status: u16, message: String },

    /// The registry answered but the body was not a usable envelope
    #[error("malformed registry response: {0}")]
    Malformed(String),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    port: u16,
    service_type: &'a str,
}

#[derive(Deserialize)]
struct HealthPayload {
    status: String,
}

pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    health_endpoint: String,
    registration_key: Option<String>,
    credential: RwLock<Option<Credential>>,
}

impl RegistryClient {
    pub fn new(
        base_url: impl Into<String>,
        health_endpoint: impl Into<String>,
        registration_key: Option<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        Ok(Self {
            http,
            base_url,
            health_endpoint: health_endpoint.into(),
            registration_key,
            credential: RwLock::new(None),
        })
    }

    /// The credential issued by the last successful registration
    pub fn credential(&self) -> Option<Credential> {
        self.credential.read().clone()
    }

    /// Register the gateway with the registry.
    ///
    /// On success the returned credential is also stored for subsequent
    /// calls. Fails with `MissingRegistrationKey` when the key is absent
    /// (the caller cannot recover) and `Unreachable` on transport errors
    /// (the caller may retry).
    pub async fn register(&self, port: u16) -> Result<Credential, RegistryError> {
        let key = self
            .registration_key
            .as_deref()
            .ok_or(RegistryError::MissingRegistrationKey)?;

        let url = format!("{}/service", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(key)
            .json(&RegisterRequest {
                port,
                service_type: GATEWAY_SERVICE_TYPE,
            })
            .send()
            .await
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;

        let envelope = self.check_response(response).await?;
        let data = envelope
            .data
            .ok_or_else(|| RegistryError::Malformed("register response has no data".into()))?;
        let credential: Credential = serde_json::from_value(data)
            .map_err(|e| RegistryError::Malformed(e.to_string()))?;

        debug!(service_id = %credential.service_id, "Registered with service registry");
        *self.credential.write() = Some(credential.clone());
        Ok(credential)
    }

    /// Instances currently registered for a service type.
    ///
    /// An empty list is a legitimate success: the service simply has no
    /// registered instances right now.
    pub async fn get_services(&self, service_type: &str) -> Result<Vec<Instance>, RegistryError> {
        let url = format!("{}/services/{}", self.base_url, service_type);
        let response = self
            .with_credential(self.http.get(&url))
            .send()
            .await
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;

        let envelope = self.check_response(response).await?;
        let data = envelope
            .data
            .ok_or_else(|| RegistryError::Malformed("services response has no data".into()))?;
        serde_json::from_value(data).map_err(|e| RegistryError::Malformed(e.to_string()))
    }

    /// Probe registry health
    pub async fn health(&self) -> Result<RegistryHealth, RegistryError> {
        let url = format!("{}{}", self.base_url, self.health_endpoint);
        let response = self
            .with_credential(self.http.get(&url))
            .send()
            .await
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;

        let envelope = self.check_response(response).await?;
        let data = envelope
            .data
            .ok_or_else(|| RegistryError::Malformed("health response has no data".into()))?;
        let payload: HealthPayload =
            serde_json::from_value(data).map_err(|e| RegistryError::Malformed(e.to_string()))?;

        if payload.status.eq_ignore_ascii_case("up") {
            Ok(RegistryHealth::Up)
        } else {
            Ok(RegistryHealth::Down)
        }
    }

    fn with_credential(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.credential.read().as_ref() {
            Some(credential) => builder
                .header(SERVICE_ID_HEADER, credential.service_id.clone())
                .header(SERVICE_TOKEN_HEADER, credential.token.clone()),
            None => builder,
        }
    }

    /// Map an HTTP response to the envelope, turning 401 into the
    /// distinguished revoked-credential signal and dropping the stored
    /// credential when that happens.
    async fn check_response(
        &self,
        response: reqwest::Response,
    ) -> Result<ApiResponse, RegistryError> {
        let status = response.status();

        if status.as_u16() == 401 {
            warn!("Registry rejected credential (401), invalidating");
            *self.credential.write() = None;
            return Err(RegistryError::Unauthorized);
        }

        if !status.is_success() {
            let message = match response.json::<ApiResponse>().await {
                Ok(envelope) => envelope
                    .error
                    .map(|e| e.message.unwrap_or(e.code))
                    .unwrap_or_else(|| "registry call failed".to_string()),
                Err(_) => "registry call failed".to_string(),
            };
            return Err(RegistryError::Failed {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<ApiResponse>()
            .await
            .map_err(|e| RegistryError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> RegistryClient {
        RegistryClient::new(
            base,
            "/health",
            Some("test-key".to_string()),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = client("http://localhost:3002///");
        assert_eq!(client.base_url, "http://localhost:3002");
    }

    #[test]
    fn test_missing_registration_key() {
        let client = RegistryClient::new(
            "http://localhost:3002",
            "/health",
            None,
            Duration::from_secs(1),
        )
        .unwrap();

        let err = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(client.register(3001))
            .unwrap_err();
        assert!(matches!(err, RegistryError::MissingRegistrationKey));
    }

    #[test]
    fn test_instance_deserialization() {
        let instance: Instance = serde_json::from_str(
            r#"{
                "id": "i-1",
                "serviceType": "products",
                "host": "10.0.0.5",
                "port": 4001,
                "healthy": true,
                "created": 1712000000000,
                "lastUpdated": 1712000050000
            }"#,
        )
        .unwrap();
        assert_eq!(instance.service_type, "products");
        assert_eq!(instance.port, 4001);
        assert_eq!(instance.last_updated, Some(1712000050000));
    }

    #[test]
    fn test_credential_deserialization() {
        let credential: Credential =
            serde_json::from_str(r#"{"serviceId": "svc-9", "token": "t0k3n"}"#).unwrap();
        assert_eq!(credential.service_id, "svc-9");
        assert_eq!(credential.token, "t0k3n");
    }
}
