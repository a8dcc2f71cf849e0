//! Error types and HTTP error responses for the gateway

use crate::output::InterpretError;
use crate::process::SpawnError;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::time::Duration;

/// Response header carrying the gateway error code
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Body type of every response produced by the gateway
pub type GatewayBody = BoxBody<Bytes, std::io::Error>;

/// Error codes for gateway failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// Request used chunked transfer-encoding
    ChunkedRequestBody,
    /// The executable could not be started
    SpawnFailed,
    /// The executable produced output that could not be interpreted
    InvalidOutput,
    /// The request deadline expired before the response head was ready
    Timeout,
    /// Any other internal failure
    InternalError,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::ChunkedRequestBody => StatusCode::BAD_REQUEST,
            GatewayErrorCode::SpawnFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::InvalidOutput => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::ChunkedRequestBody => "CHUNKED_REQUEST_BODY",
            GatewayErrorCode::SpawnFailed => "SPAWN_FAILED",
            GatewayErrorCode::InvalidOutput => "INVALID_OUTPUT",
            GatewayErrorCode::Timeout => "TIMEOUT",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// A failure while serving one request
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("cgi: {0}")]
    Spawn(#[from] SpawnError),

    #[error("cgi: {0}")]
    Interpret(#[from] InterpretError),

    #[error("cgi: copy error: {0}")]
    Copy(std::io::Error),

    #[error("cgi: subprocess exceeded deadline of {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl GatewayError {
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            GatewayError::Spawn(_) => GatewayErrorCode::SpawnFailed,
            GatewayError::Interpret(_) => GatewayErrorCode::InvalidOutput,
            GatewayError::Copy(_) => GatewayErrorCode::InternalError,
            GatewayError::Timeout(_) => GatewayErrorCode::Timeout,
        }
    }
}

/// Destination for gateway error reports.
///
/// Any `Fn(&GatewayError)` closure is an `ErrorLog`, so callers can route
/// errors wherever they like; `|_: &GatewayError| {}` silences them.
pub trait ErrorLog: Send + Sync {
    fn log(&self, error: &GatewayError);
}

impl<F> ErrorLog for F
where
    F: Fn(&GatewayError) + Send + Sync,
{
    fn log(&self, error: &GatewayError) {
        self(error)
    }
}

/// Build an error response. An empty `body` produces an empty-bodied response.
pub fn error_response(code: GatewayErrorCode, body: impl Into<Bytes>) -> Response<GatewayBody> {
    let body: Bytes = body.into();
    let mut builder = Response::builder()
        .status(code.status_code())
        .header(X_GATEWAY_ERROR, code.as_header_value());

    let body = if body.is_empty() {
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
    } else {
        builder = builder.header(hyper::header::CONTENT_TYPE, "text/plain");
        Full::new(body).map_err(|never| match never {}).boxed()
    };

    builder
        .body(body)
        .expect("valid response with StatusCode enum and static headers")
}
