//! Error taxonomy for exchange processing.
//!
//! Every failure that can leave the filter chain is a [`GatewayError`]. The
//! variants keep timeouts, refused breaker calls and other upstream failures
//! apart so that retry and circuit-breaker policies, and finally the HTTP
//! boundary, can treat them differently.
use std::time::Duration;

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::ports::http_client::HttpClientError;

/// Failure classification shared by the resilience filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The upstream call did not complete in time.
    Timeout,
    /// The backend could not be reached.
    Connect,
    /// A circuit breaker refused the call.
    CircuitOpen,
    /// The backend answered with a status configured as a failure.
    Status,
    /// Anything else.
    Other,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Connect => "connect",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::Status => "status",
            FailureKind::Other => "other",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("no route matched {method} {path}")]
    NoRouteMatched { method: Method, path: String },

    #[error("circuit breaker '{name}' does not permit further calls")]
    CircuitOpen { name: String },

    #[error("upstream call timed out after {timeout:?}")]
    UpstreamTimeout { timeout: Duration },

    #[error("upstream responded with failure status {status}")]
    UpstreamStatus { status: StatusCode },

    #[error("upstream request failed: {0}")]
    Upstream(#[source] HttpClientError),

    #[error("filter contract violation: {0}")]
    FilterContractViolation(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for exchange processing.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn kind(&self) -> FailureKind {
        match self {
            GatewayError::UpstreamTimeout { .. } => FailureKind::Timeout,
            GatewayError::CircuitOpen { .. } => FailureKind::CircuitOpen,
            GatewayError::UpstreamStatus { .. } => FailureKind::Status,
            GatewayError::Upstream(HttpClientError::Connect(_)) => FailureKind::Connect,
            _ => FailureKind::Other,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoRouteMatched { .. } => StatusCode::NOT_FOUND,
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamStatus { status } => *status,
            GatewayError::Upstream(HttpClientError::InvalidRequest(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::FilterContractViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::NoRouteMatched { .. } => "NO_ROUTE_MATCHED",
            GatewayError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            GatewayError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            GatewayError::UpstreamStatus { .. } => "UPSTREAM_STATUS",
            GatewayError::Upstream(_) => "UPSTREAM_ERROR",
            GatewayError::FilterContractViolation(_) => "FILTER_CONTRACT_VIOLATION",
            GatewayError::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }
}

impl From<HttpClientError> for GatewayError {
    fn from(err: HttpClientError) -> Self {
        match err {
            HttpClientError::Timeout(timeout) => GatewayError::UpstreamTimeout { timeout },
            other => GatewayError::Upstream(other),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}
