//! Error handling and JSON error responses for the proxy

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error type carried by every response body the proxy produces
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body type shared by all action handlers
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Upstream URL has a scheme the proxy cannot speak
    UnknownProtocol,
    /// Upstream target could not be parsed
    InvalidUpstream,
    /// Upgrade requested for a host without a websocket target
    UpgradeNotSupported,
    /// Failed to connect to or talk with the upstream
    UpstreamFailed,
    /// Path escapes the served root
    Forbidden,
    /// File or directory does not exist
    NotFound,
    /// Requested byte range cannot be satisfied
    RangeNotSatisfiable,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownProtocol => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InvalidUpstream => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UpgradeNotSupported => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownProtocol => "UNKNOWN_PROTOCOL",
            ProxyErrorCode::InvalidUpstream => "INVALID_UPSTREAM",
            ProxyErrorCode::UpgradeNotSupported => "UPGRADE_NOT_SUPPORTED",
            ProxyErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            ProxyErrorCode::Forbidden => "FORBIDDEN",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::RangeNotSatisfiable => "RANGE_NOT_SATISFIABLE",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
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
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full(error.to_json()))
        .expect("valid response with StatusCode enum and static headers")
}

/// Plain text response, used for the permissive "unknown host" reply and redirects
pub fn text_response(status: StatusCode, text: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(text))
        .expect("valid response builder")
}

pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
