//! Error handling and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No backend process or UI port could be found
    DiscoveryFailed,
    /// The RPC backend has not been discovered yet
    BackendNotDiscovered,
    /// No route is configured for the listening port
    NoRoute,
    /// Malformed client request
    BadRequest,
    /// Request timed out waiting for the upstream
    RequestTimeout,
    /// Failed to connect to or read from the upstream
    ConnectionFailed,
    /// Recovery already running
    RecoveryInProgress,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::DiscoveryFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BackendNotDiscovered => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::NoRoute => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RecoveryInProgress => StatusCode::CONFLICT,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::DiscoveryFailed => "DISCOVERY_FAILED",
            ProxyErrorCode::BackendNotDiscovered => "BACKEND_NOT_DISCOVERED",
            ProxyErrorCode::NoRoute => "NO_ROUTE",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RecoveryInProgress => "RECOVERY_IN_PROGRESS",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, BodyError>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Failures while streaming a response body to the client
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("upstream body error: {0}")]
    Upstream(#[from] hyper::Error),
    #[error("upstream sent nothing for {} seconds", .0.as_secs())]
    Stalled(Duration),
}

/// Failures while locating the backend
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no backend process or UI port found")]
    NotFound,
    #[error("failed to inspect system state: {0}")]
    Inspect(#[from] ControlError),
}

/// Failures decoding the embedded client configuration
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("embedded configuration is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("embedded configuration is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("embedded configuration is not a JSON object")]
    NotObject,
}

/// Failures of external collaborator commands
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("no command configured for {0}")]
    NotConfigured(&'static str),
    #[error("failed to run command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("command exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },
    #[error("command timed out after {0} seconds")]
    Timeout(u64),
    #[error("invalid command line: {0}")]
    InvalidCommand(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::DiscoveryFailed.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::BackendNotDiscovered.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::RecoveryInProgress.status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::ConnectionFailed, "connection refused");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"CONNECTION_FAILED\""));
        assert!(json.contains("\"message\":\"connection refused\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::DiscoveryFailed, "no backend");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "DISCOVERY_FAILED"
        );
    }

    #[test]
    fn test_body_error_display() {
        assert_eq!(
            BodyError::Stalled(Duration::from_secs(300)).to_string(),
            "upstream sent nothing for 300 seconds"
        );
    }

    #[test]
    fn test_control_error_display() {
        let err = ControlError::Failed {
            status: 1,
            stderr: "unit not found".to_string(),
        };
        assert_eq!(err.to_string(), "command exited with status 1: unit not found");
        assert_eq!(
            ControlError::NotConfigured("restart").to_string(),
            "no command configured for restart"
        );
    }
}
