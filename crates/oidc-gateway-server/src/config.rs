//! Listener configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Header carrying the caller's identity token
pub const DEFAULT_TOKEN_HEADER: &str = "Gateway-Authorization";
/// Upstream fetched by the relay route
pub const DEFAULT_RELAY_UPSTREAM: &str = "https://www.bing.com";
/// Path served by the relay route
pub const RELAY_PATH: &str = "/apiExample";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerTimeouts {
    /// Bound on receiving request headers
    pub read: Duration,
    /// Bound on the relay's outbound exchange
    pub write: Duration,
    /// Bound on connecting to a tunnel target
    pub dial: Duration,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(60),
            write: Duration::from_secs(60),
            dial: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub token_header: String,
    pub relay_upstream: String,
    pub timeouts: ServerTimeouts,
    /// Serve HTTPS instead of plain HTTP when set
    pub tls: Option<TlsConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            token_header: DEFAULT_TOKEN_HEADER.to_string(),
            relay_upstream: DEFAULT_RELAY_UPSTREAM.to_string(),
            timeouts: ServerTimeouts::default(),
            tls: None,
        }
    }
}

impl GatewayConfig {
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_token_header(mut self, header: impl Into<String>) -> Self {
        self.token_header = header.into();
        self
    }

    pub fn with_relay_upstream(mut self, url: impl Into<String>) -> Self {
        self.relay_upstream = url.into();
        self
    }

    pub fn with_timeouts(mut self, timeouts: ServerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}
