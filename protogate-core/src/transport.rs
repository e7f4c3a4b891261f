//! # Transport Provisioner
//!
//! Opens the connection a route uses to reach its upstream. The connection is a
//! `tonic::transport::Channel`: a single HTTP/2 connection multiplexing every in-flight call,
//! cheap to clone and safe to use concurrently.
//!
//! ## Trust modes
//!
//! The mode is chosen when the gateway is deployed, never per request:
//!
//! * [`TrustMode::System`]: TLS, validating the upstream certificate against the CA roots
//!   installed on the host. The production setting.
//! * [`TrustMode::TrustAll`]: TLS, accepting any certificate the upstream presents. Traffic
//!   is still encrypted but the upstream is not authenticated; development and staging only.
//! * [`TrustMode::Plaintext`]: no TLS at all, for local development against a plaintext server.
//!
//! ## Connecting
//!
//! Connections go through a custom connector (TCP connect followed by the rustls handshake)
//! so that a refused connection and a failed handshake can be told apart:
//! [`TransportError::Unreachable`] vs [`TransportError::HandshakeFailed`].
mod tls;
pub mod upstream;

pub use upstream::{Fixed, RouteChannel, Upstream};

use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::error::Error as StdError;
use std::time::Duration;
use tokio::net::TcpStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Default bound on establishing the TCP connection and TLS session.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid upstream host '{host}': {reason}")]
    InvalidHost { host: String, reason: String },
    #[error("Failed to build the TLS configuration: {0}")]
    TlsConfig(#[source] rustls::Error),
    #[error("No trusted root certificates could be loaded from the system store")]
    NoTrustRoots,
    #[error("Failed to connect to '{addr}': {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("TLS handshake with '{addr}' failed: {source}")]
    HandshakeFailed {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },
}

/// Which upstream certificates a channel accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustMode {
    #[default]
    System,
    TrustAll,
    Plaintext,
}

/// Where and how a route reaches its upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub trust: TrustMode,
    pub connect_timeout: Duration,
}

impl UpstreamTarget {
    pub fn new(host: impl Into<String>, port: u16, trust: TrustMode) -> Self {
        Self {
            host: host.into(),
            port,
            trust,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Failure raised by the connector; kept apart so the two phases can be classified.
#[derive(Debug, thiserror::Error)]
enum ConnectError {
    #[error("TCP connect to '{addr}' failed: {source}")]
    Tcp {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
}

/// Opens a channel to `target` and waits for the connection to be established.
///
/// # Returns
///
/// * `Ok(Channel)` - A connected channel; share it by cloning.
/// * `Err(TransportError)` - If the host is invalid, the upstream can't be reached within the
///   connect timeout, or the TLS negotiation fails.
pub async fn open(target: &UpstreamTarget) -> Result<Channel, TransportError> {
    let addr = target.authority();
    let scheme = match target.trust {
        TrustMode::Plaintext => "http",
        TrustMode::System | TrustMode::TrustAll => "https",
    };

    let endpoint = Endpoint::from_shared(format!("{scheme}://{addr}"))
        .map_err(|e| TransportError::InvalidHost {
            host: target.host.clone(),
            reason: e.to_string(),
        })?
        .connect_timeout(target.connect_timeout);

    let connected = match target.trust {
        TrustMode::Plaintext => {
            let addr = addr.clone();
            let connector = service_fn(move |_: Uri| {
                let addr = addr.clone();
                async move { connect_tcp(addr).await.map(TokioIo::new) }
            });
            endpoint.connect_with_connector(connector).await
        }
        mode => {
            let tls = tls::connector(mode)?;
            let server_name = tls::server_name(&target.host)?;
            let addr = addr.clone();
            let connector = service_fn(move |_: Uri| {
                let (tls, server_name, addr) = (tls.clone(), server_name.clone(), addr.clone());
                async move {
                    let stream = connect_tcp(addr).await?;
                    let stream = tls
                        .connect(server_name, stream)
                        .await
                        .map_err(ConnectError::Handshake)?;
                    Ok::<_, ConnectError>(TokioIo::new(stream))
                }
            });
            endpoint.connect_with_connector(connector).await
        }
    };

    match connected {
        Ok(channel) => {
            tracing::info!(upstream = %addr, trust = ?target.trust, "opened upstream channel");
            Ok(channel)
        }
        Err(source) if is_handshake_failure(&source) => {
            Err(TransportError::HandshakeFailed { addr, source })
        }
        Err(source) => Err(TransportError::Unreachable { addr, source }),
    }
}

async fn connect_tcp(addr: String) -> Result<TcpStream, ConnectError> {
    match TcpStream::connect(addr.as_str()).await {
        Ok(stream) => {
            stream.set_nodelay(true).ok();
            Ok(stream)
        }
        Err(source) => Err(ConnectError::Tcp { addr, source }),
    }
}

fn is_handshake_failure(error: &tonic::transport::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = source {
        if let Some(ConnectError::Handshake(_)) = err.downcast_ref::<ConnectError>() {
            return true;
        }
        source = err.source();
    }
    false
}
