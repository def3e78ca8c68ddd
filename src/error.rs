//! Error taxonomy for the control plane and JSON error responses for the front door

use crate::service::{ServiceId, UnknownServiceName};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Failures raised by the registry and the supervisor
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// No free port left in the service's range
    #[error("no free port for {service} in range {start}-{end}")]
    ResourceExhausted { service: ServiceId, start: u16, end: u16 },

    /// Health was never confirmed within the startup bound
    #[error("{service} did not become healthy within {}s", timeout.as_secs())]
    StartupTimeout { service: ServiceId, timeout: Duration },

    /// The process died on its own
    #[error("{service} exited unexpectedly ({status})")]
    UnexpectedExit { service: ServiceId, status: String },

    /// A health probe of a running service failed
    #[error("probe of {service} failed: {reason}")]
    ProbeFailure { service: ServiceId, reason: String },

    /// A hard prerequisite is absent, spawning would be pointless
    #[error("{service} cannot start: {what} is not configured")]
    ConfigurationMissing { service: ServiceId, what: String },

    /// Restart suppressed after too many consecutive failures
    #[error("{service} circuit breaker open after {failures} consecutive failures")]
    CircuitOpen { service: ServiceId, failures: u32 },

    /// The service is disabled in configuration
    #[error("{0} is disabled")]
    ServiceDisabled(ServiceId),

    /// A service name that matches no known service
    #[error("unknown service '{0}'")]
    UnknownService(String),

    /// The gateway is shutting down and refuses new work
    #[error("gateway is shutting down")]
    ShuttingDown,

    /// The OS refused to spawn the process
    #[error("failed to spawn {service}: {source}")]
    Spawn {
        service: ServiceId,
        #[source]
        source: std::io::Error,
    },
}

impl ControlError {
    /// Whether this error should abort the boot sequence when it hits a critical service
    pub fn is_fatal_for_boot(&self) -> bool {
        matches!(
            self,
            ControlError::ResourceExhausted { .. }
                | ControlError::ConfigurationMissing { .. }
                | ControlError::CircuitOpen { .. }
                | ControlError::Spawn { .. }
        )
    }
}

impl From<UnknownServiceName> for ControlError {
    fn from(err: UnknownServiceName) -> Self {
        ControlError::UnknownService(err.0)
    }
}

/// Error codes for front door responses
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// No route matches the request path
    NoRoute,
    /// Unknown service name in a control route
    UnknownService,
    /// Control route called from a non-loopback address
    Forbidden,
    /// Bad query parameters
    BadRequest,
    /// Target service is disabled
    ServiceDisabled,
    /// Target service could not be started
    ServiceStartFailed,
    /// Target service is in circuit-open state
    ServiceFailed,
    /// Request timed out waiting for the service
    RequestTimeout,
    /// Failed to connect to the service
    ConnectionFailed,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::NoRoute => StatusCode::NOT_FOUND,
            GatewayErrorCode::UnknownService => StatusCode::NOT_FOUND,
            GatewayErrorCode::Forbidden => StatusCode::FORBIDDEN,
            GatewayErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            GatewayErrorCode::ServiceDisabled => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::ServiceStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::ServiceFailed => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::NoRoute => "NO_ROUTE",
            GatewayErrorCode::UnknownService => "UNKNOWN_SERVICE",
            GatewayErrorCode::Forbidden => "FORBIDDEN",
            GatewayErrorCode::BadRequest => "BAD_REQUEST",
            GatewayErrorCode::ServiceDisabled => "SERVICE_DISABLED",
            GatewayErrorCode::ServiceStartFailed => "SERVICE_START_FAILED",
            GatewayErrorCode::ServiceFailed => "SERVICE_FAILED",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Map a supervisor failure on the request path to a response code
    pub fn from_control_error(err: &ControlError) -> Self {
        match err {
            ControlError::ServiceDisabled(_) => GatewayErrorCode::ServiceDisabled,
            ControlError::UnknownService(_) => GatewayErrorCode::UnknownService,
            ControlError::CircuitOpen { .. } => GatewayErrorCode::ServiceFailed,
            ControlError::StartupTimeout { .. } => GatewayErrorCode::RequestTimeout,
            _ => GatewayErrorCode::ServiceStartFailed,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

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

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
