//! CONNECT tunnels
//!
//! A tunnel is established in three steps: dial the target, answer the
//! CONNECT with 200, then detach the client connection from HTTP framing and
//! splice it to the target. Each copy direction runs as its own task; the
//! first one to finish closes the tunnel for both.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::Response;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::body::{empty, GatewayBody};
use crate::error::GatewayError;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

const COPY_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("Timed out connecting to {target} after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },
}

/// Opens outbound connections to tunnel targets
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &str) -> Result<TcpStream, DialError>;
}

/// Plain TCP connect bounded by a timeout
#[derive(Debug, Clone)]
pub struct TcpDialer {
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(DEFAULT_DIAL_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, target: &str) -> Result<TcpStream, DialError> {
        let stream = connect_within(target, self.timeout, TcpStream::connect(target)).await?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

async fn connect_within<F>(target: &str, timeout: Duration, connect: F) -> Result<TcpStream, DialError>
where
    F: Future<Output = io::Result<TcpStream>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(DialError::Connect {
            target: target.to_string(),
            source,
        }),
        Err(_) => Err(DialError::Timeout {
            target: target.to_string(),
            timeout,
        }),
    }
}

/// Join handles of the two copy tasks of one tunnel
///
/// Each task resolves to the number of bytes it moved.
pub struct TunnelHandles {
    pub client_to_target: JoinHandle<u64>,
    pub target_to_client: JoinHandle<u64>,
}

/// Copy bytes in both directions between `client` and `target`
///
/// Returns immediately. When either direction ends, the other stops reading
/// and both connections are closed.
pub fn splice<C, T>(client: C, target: T) -> TunnelHandles
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (target_read, target_write) = tokio::io::split(target);
    let closed = CancellationToken::new();

    TunnelHandles {
        client_to_target: tokio::spawn(transfer(
            client_read,
            target_write,
            closed.clone(),
            "client->target",
        )),
        target_to_client: tokio::spawn(transfer(
            target_read,
            client_write,
            closed,
            "target->client",
        )),
    }
}

async fn transfer<R, W>(
    mut source: R,
    mut destination: W,
    closed: CancellationToken,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = tokio::select! {
            _ = closed.cancelled() => break,
            read = source.read(&mut buffer) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(direction, error = %e, "Tunnel read failed");
                    break;
                }
            },
        };

        // Bytes already read are delivered even if the other side is closing
        if let Err(e) = destination.write_all(&buffer[..n]).await {
            debug!(direction, error = %e, "Tunnel write failed");
            break;
        }
        copied += n as u64;
    }

    // Stop the opposite direction; once both tasks drop their halves the
    // connections are closed
    closed.cancel();
    let _ = destination.shutdown().await;
    drop(destination);
    drop(source);

    debug!(direction, bytes = copied, "Tunnel direction closed");
    copied
}

/// Turns authorized CONNECT requests into spliced tunnels
#[derive(Clone)]
pub struct TunnelEstablisher {
    dialer: Arc<dyn Dialer>,
}

impl TunnelEstablisher {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self { dialer }
    }

    /// Dial `target` and, on success, answer 200 and splice once the
    /// connection is upgraded
    ///
    /// `upgrade` is the inbound connection's upgrade handle; without it the
    /// request cannot be detached and no dial is attempted.
    pub async fn establish(
        &self,
        target: &str,
        upgrade: Option<OnUpgrade>,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        let upgrade = upgrade.ok_or(GatewayError::TransportUnsupported)?;
        let target_stream = self.dialer.dial(target).await?;

        let target_name = target.to_string();
        tokio::spawn(async move {
            match upgrade.await {
                Ok(upgraded) => {
                    info!(target = %target_name, "Tunnel established");
                    splice(TokioIo::new(upgraded), target_stream);
                }
                Err(e) => {
                    warn!(target = %target_name, error = %e, "Connection upgrade failed after CONNECT was accepted");
                }
            }
        });

        Ok(Response::new(empty()))
    }
}
