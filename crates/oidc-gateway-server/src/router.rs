//! Request routing and the authentication pipeline
//!
//! Each request goes through the same fixed sequence:
//!
//! 1. classify the route (unknown routes get 404 before any token handling)
//! 2. verify the identity token from the configured header
//! 3. evaluate the claim policy
//! 4. dispatch to the tunnel establisher or the relay
//!
//! Nothing is dialed or fetched before steps 2 and 3 both pass.

use std::sync::Arc;

use http::header::{HeaderName, InvalidHeaderName, HOST};
use http::{HeaderMap, Method, Request, Response};
use hyper::upgrade::OnUpgrade;
use oidc_gateway_auth::{ClaimPolicy, ClaimSet, TokenVerifier};
use tracing::{debug, info, warn};

use crate::body::GatewayBody;
use crate::config::RELAY_PATH;
use crate::error::GatewayError;
use crate::relay::ApiRelay;
use crate::tunnel::TunnelEstablisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Tunnel,
    Relay,
}

fn classify<B>(req: &Request<B>) -> Result<Route, GatewayError> {
    if req.method() == Method::CONNECT {
        return Ok(Route::Tunnel);
    }
    if req.method() == Method::GET && req.uri() == RELAY_PATH {
        return Ok(Route::Relay);
    }
    Err(GatewayError::RouteNotFound {
        method: req.method().to_string(),
        target: req.uri().to_string(),
    })
}

/// `host:port` a CONNECT request asks for
fn connect_target<B>(req: &Request<B>) -> Result<String, GatewayError> {
    if let Some(authority) = req.uri().authority() {
        return Ok(authority.as_str().to_string());
    }
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(GatewayError::MissingTarget)
}

/// The gateway's request handler
#[derive(Clone)]
pub struct Gateway {
    verifier: TokenVerifier,
    policy: Arc<ClaimPolicy>,
    tunnels: TunnelEstablisher,
    relay: ApiRelay,
    token_header: HeaderName,
}

impl Gateway {
    pub fn new(
        verifier: TokenVerifier,
        policy: ClaimPolicy,
        tunnels: TunnelEstablisher,
        relay: ApiRelay,
    ) -> Self {
        Self {
            verifier,
            policy: Arc::new(policy),
            tunnels,
            relay,
            token_header: HeaderName::from_static("gateway-authorization"),
        }
    }

    pub fn with_token_header(mut self, header: &str) -> Result<Self, InvalidHeaderName> {
        self.token_header = HeaderName::from_bytes(header.as_bytes())?;
        Ok(self)
    }

    pub fn token_header(&self) -> &HeaderName {
        &self.token_header
    }

    /// Produce the response for one request; never fails
    pub async fn route<B>(&self, mut req: Request<B>) -> Response<GatewayBody> {
        match self.handle(&mut req).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    GatewayError::RouteNotFound { .. } => debug!("{}", e),
                    GatewayError::Relay(_) => warn!("{}", e),
                    _ => info!(method = %req.method(), "Request rejected: {}", e),
                }
                e.into_response()
            }
        }
    }

    async fn handle<B>(&self, req: &mut Request<B>) -> Result<Response<GatewayBody>, GatewayError> {
        let route = classify(req)?;

        let claims = self.authenticate(req.headers())?;
        self.policy.authorize(&claims)?;
        debug!(
            subject = claims.subject().unwrap_or("<none>"),
            "Request authorized"
        );

        match route {
            Route::Tunnel => {
                let target = connect_target(req)?;
                let upgrade = req.extensions_mut().remove::<OnUpgrade>();
                self.tunnels.establish(&target, upgrade).await
            }
            Route::Relay => self.relay.forward().await,
        }
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<ClaimSet, GatewayError> {
        let token = headers
            .get(&self.token_header)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::MissingToken {
                header: self.token_header.to_string(),
            })?;

        Ok(self.verifier.verify(token)?)
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("token_header", &self.token_header)
            .field("policy", &self.policy.names())
            .field("relay_upstream", &self.relay.upstream())
            .finish()
    }
}
