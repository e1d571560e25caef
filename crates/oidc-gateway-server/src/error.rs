//! Caller-visible error taxonomy
//!
//! Every failure carries its precise cause for logging, but the status code a
//! caller sees is deliberately coarse: authentication and authorization
//! failures are indistinguishable from the outside.

use http::{header, Response, StatusCode};
use oidc_gateway_auth::{AuthorizationError, VerifyError};
use thiserror::Error;

use crate::body::{full, GatewayBody};
use crate::tunnel::DialError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No route for {method} {target}")]
    RouteNotFound { method: String, target: String },

    #[error("Missing or unreadable '{header}' header")]
    MissingToken { header: String },

    #[error("Token verification failed: {0}")]
    Authentication(#[from] VerifyError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error("Connection does not support protocol upgrade")]
    TransportUnsupported,

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("CONNECT request has no target authority")]
    MissingTarget,

    #[error("Relay request failed: {0}")]
    Relay(#[source] reqwest::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::MissingToken { .. }
            | GatewayError::Authentication(_)
            | GatewayError::Authorization(_) => StatusCode::UNAUTHORIZED,
            GatewayError::TransportUnsupported => StatusCode::EXPECTATION_FAILED,
            GatewayError::Dial(_) => StatusCode::REQUEST_TIMEOUT,
            GatewayError::MissingTarget => StatusCode::BAD_REQUEST,
            GatewayError::Relay(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plain-text response whose body is the status reason phrase
    pub fn into_response(self) -> Response<GatewayBody> {
        let status = self.status();
        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8");

        // A failed CONNECT leaves nothing useful on the connection
        if matches!(self, GatewayError::Dial(_)) {
            builder = builder.header(header::CONNECTION, "close");
        }

        let reason = status.canonical_reason().unwrap_or_default();
        builder
            .body(full(format!("{}\n", reason)))
            .unwrap_or_else(|_| Response::new(full(reason)))
    }
}
