//! The JSON envelope every gateway response conforms to

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current wall-clock time as epoch milliseconds
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Error payload inside a failure envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiError {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Standard response envelope: `{success, timestamp, data?, error?}`.
///
/// Success envelopes never carry `error`; failure envelopes always carry
/// `error.code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ApiResponse {
    /// Success envelope with a fresh timestamp
    pub fn success(data: Option<Value>) -> Self {
        Self {
            success: true,
            timestamp: epoch_millis(),
            data,
            error: None,
        }
    }

    /// Failure envelope with a fresh timestamp
    pub fn failure(code: impl Into<String>, message: Option<String>) -> Self {
        Self {
            success: false,
            timestamp: epoch_millis(),
            data: None,
            error: Some(ApiError {
                code: code.into(),
                message,
            }),
        }
    }

    /// Failure envelope carrying extra data alongside the error
    pub fn failure_with_data(
        code: impl Into<String>,
        message: Option<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            data,
            ..Self::failure(code, message)
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            let code = self
                .error
                .as_ref()
                .map(|e| e.code.clone())
                .unwrap_or_else(|| "UNKNOWN_ERROR".to_string());
            format!(
                r#"{{"success":{},"timestamp":{},"error":{{"code":"{}"}}}}"#,
                self.success, self.timestamp, code
            )
        })
    }
}

/// Build an HTTP response carrying the envelope as a JSON body.
///
/// `extra_headers` are applied first (already filtered by the caller);
/// `content-length` and `content-type` are recomputed since the body is
/// re-serialized here.
pub fn envelope_response(
    status: StatusCode,
    extra_headers: Option<HeaderMap>,
    envelope: &ApiResponse,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = envelope.to_json();

    let mut response = Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode and JSON body");

    if let Some(extra) = extra_headers {
        let headers = response.headers_mut();
        for (name, value) in extra.iter() {
            if name == CONTENT_LENGTH || name == CONTENT_TYPE {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
    }
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    response
}

/// Shorthand for a plain error envelope response with no extra headers
pub fn error_response(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    envelope_response(
        status,
        None,
        &ApiResponse::failure(code, Some(message.into())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_shape() {
        let envelope = ApiResponse::success(Some(serde_json::json!({"message": "ok"})));
        assert!(envelope.success);
        assert!(envelope.timestamp > 0);
        assert!(envelope.error.is_none());

        let json: Value = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(json["success"], Value::Bool(true));
        assert!(json.get("error").is_none());
        assert_eq!(json["data"]["message"], "ok");
    }

    #[test]
    fn test_failure_shape() {
        let envelope = ApiResponse::failure("SERVICE_NO_EXIST", None);
        assert!(!envelope.success);
        assert_eq!(envelope.error.as_ref().unwrap().code, "SERVICE_NO_EXIST");

        let json: Value = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(json["error"]["code"], "SERVICE_NO_EXIST");
        // no message key when the message is absent
        assert!(json["error"].get("message").is_none());
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_envelope_response_headers() {
        let mut extra = HeaderMap::new();
        extra.insert("x-test-key", HeaderValue::from_static("1234"));
        extra.insert(CONTENT_LENGTH, HeaderValue::from_static("9999"));

        let response = envelope_response(
            StatusCode::OK,
            Some(extra),
            &ApiResponse::success(None),
        );

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-test-key").unwrap(), "1234");
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        // the stale backend content-length must not survive
        assert_ne!(
            response.headers().get(CONTENT_LENGTH).map(|v| v.as_bytes()),
            Some("9999".as_bytes())
        );
    }

    #[test]
    fn test_error_response() {
        let response = error_response(
            StatusCode::NOT_FOUND,
            "SERVICE_NO_EXIST",
            "No such service",
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let parsed: ApiResponse = serde_json::from_str(
            r#"{"success":true,"timestamp":1712000000000,"data":{"message":"hi"}}"#,
        )
        .unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.timestamp, 1712000000000);
        assert_eq!(parsed.data.unwrap()["message"], "hi");
    }
}
