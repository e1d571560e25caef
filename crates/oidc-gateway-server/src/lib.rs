//! HTTP front of the OIDC gateway
//!
//! Accepts `CONNECT host:port` and `GET /apiExample` from callers presenting
//! an identity token, checks the token with `oidc-gateway-auth`, then either
//! splices a raw TCP tunnel or relays a fixed upstream response.

pub mod body;
pub mod config;
pub mod error;
pub mod relay;
pub mod router;
pub mod server;
pub mod tunnel;

pub use body::GatewayBody;
pub use config::{GatewayConfig, ServerTimeouts, TlsConfig};
pub use error::GatewayError;
pub use relay::ApiRelay;
pub use router::Gateway;
pub use server::{GatewayServer, ServerError};
pub use tunnel::{splice, DialError, Dialer, TcpDialer, TunnelEstablisher, TunnelHandles};
