//! Listener and per-connection HTTP handling
use std::convert::Infallible;
use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use oidc_gateway_auth::{ClaimPolicy, TokenVerifier};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{GatewayConfig, TlsConfig};
use crate::relay::ApiRelay;
use crate::router::Gateway;
use crate::tunnel::{TcpDialer, TunnelEstablisher};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

pub struct GatewayServer {
    config: GatewayConfig,
    gateway: Arc<Gateway>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, gateway: Gateway) -> Self {
        Self {
            config,
            gateway: Arc::new(gateway),
        }
    }

    /// Wire a TCP dialer and relay client from `config` around the given
    /// verifier and policy
    pub fn from_config(
        config: GatewayConfig,
        verifier: TokenVerifier,
        policy: ClaimPolicy,
    ) -> Result<Self, ServerError> {
        let tunnels = TunnelEstablisher::new(Arc::new(TcpDialer::new(config.timeouts.dial)));
        let relay = ApiRelay::new(config.relay_upstream.clone(), config.timeouts.write)
            .map_err(|e| ServerError::ConfigError(format!("Failed to build relay client: {}", e)))?;

        let gateway = Gateway::new(verifier, policy, tunnels, relay)
            .with_token_header(&config.token_header)
            .map_err(|e| {
                ServerError::ConfigError(format!(
                    "Invalid token header '{}': {}",
                    config.token_header, e
                ))
            })?;

        Ok(Self::new(config, gateway))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Load TLS certificates from PEM files
    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
        let file = File::open(path)
            .map_err(|e| ServerError::TlsError(format!("Failed to open cert file: {}", e)))?;
        let mut reader = BufReader::new(file);

        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::TlsError(format!("Failed to parse certs: {}", e)))
    }

    /// Load private key from PEM file
    fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
        let file = File::open(path)
            .map_err(|e| ServerError::TlsError(format!("Failed to open key file: {}", e)))?;
        let mut reader = BufReader::new(file);

        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| ServerError::TlsError(format!("Failed to parse key: {}", e)))?
            .ok_or_else(|| ServerError::TlsError("No private key found".to_string()))
    }

    fn tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
        info!("Loading TLS certificate from: {}", tls.cert_path.display());
        let certs = Self::load_certs(&tls.cert_path)?;

        info!("Loading TLS private key from: {}", tls.key_path.display());
        let key = Self::load_private_key(&tls.key_path)?;

        let tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::TlsError(format!("Invalid cert/key: {}", e)))?;

        Ok(TlsAcceptor::from(Arc::new(tls_config)))
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.bind_addr;
        TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    ///
    /// Stops accepting once `shutdown` resolves. Connections and tunnels
    /// already running are left to finish on their own.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        let acceptor = match &self.config.tls {
            Some(tls) => Some(Self::tls_acceptor(tls)?),
            None => None,
        };

        let local_addr = listener.local_addr()?;
        info!(
            "Gateway listening on {} ({})",
            local_addr,
            if acceptor.is_some() { "https" } else { "http" }
        );

        let read_timeout = self.config.timeouts.read;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);

                    let gateway = self.gateway.clone();
                    let acceptor = acceptor.clone();

                    tokio::spawn(
                        async move {
                            debug!("New connection");
                            match acceptor {
                                Some(acceptor) => {
                                    match tokio::time::timeout(read_timeout, acceptor.accept(stream)).await {
                                        Ok(Ok(tls_stream)) => {
                                            serve_connection(tls_stream, gateway, read_timeout).await
                                        }
                                        Ok(Err(e)) => warn!("TLS handshake failed: {}", e),
                                        Err(_) => warn!("TLS handshake timed out"),
                                    }
                                }
                                None => serve_connection(stream, gateway, read_timeout).await,
                            }
                        }
                        .instrument(info_span!("conn", peer = %peer_addr)),
                    );
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<I>(io: I, gateway: Arc<Gateway>, read_timeout: Duration)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = gateway.clone();
        async move { Ok::<_, Infallible>(gateway.route(req).await) }
    });

    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout);

    if let Err(e) = builder
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
    {
        debug!("Connection closed with error: {}", e);
    } else {
        debug!("Connection closed");
    }
}
