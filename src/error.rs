//! Error codes and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every gateway response
pub type GatewayBody = BoxBody<Bytes, BoxError>;

/// Header carrying the stable error code
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Error codes returned to gateway callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Missing, malformed, expired or revoked session
    Unauthenticated,
    /// No service registered for the requested port or name
    NotFound,
    /// Service exists but is not Healthy
    ServiceUnavailable,
    /// Could not connect to the service's port
    ConnectionFailed,
    /// Service accepted the connection and then dropped it
    UpstreamClosed,
    /// Service did not answer before the request deadline
    Timeout,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::UpstreamClosed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::Unauthenticated => "UNAUTHENTICATED",
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            GatewayErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            GatewayErrorCode::UpstreamClosed => "UPSTREAM_CLOSED",
            GatewayErrorCode::Timeout => "TIMEOUT",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
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

/// Create a JSON error response with the X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<GatewayBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    let mut builder = Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header(X_GATEWAY_ERROR, code.as_header_value());

    if code == GatewayErrorCode::Unauthenticated {
        builder = builder.header("WWW-Authenticate", "Bearer");
    }

    builder
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
