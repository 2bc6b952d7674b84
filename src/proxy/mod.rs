//! Proxy protocol engines
//!
//! Provides:
//! - SOCKS5 proxy server (RFC 1928)
//! - HTTP proxy server (plain forwarding and CONNECT tunneling, with an
//!   optional TLS-wrapped listener)

pub mod addr;
pub mod http;
pub mod socks5;

pub use http::HttpProxy;
pub use socks5::Socks5Proxy;

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::relay::RelayError;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("address error: {0}")]
    Addr(#[from] addr::AddrError),

    #[error("unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    #[error("client offered no authentication methods")]
    NoMethodsOffered,

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("unsupported command: 0x{0:02x}")]
    UnsupportedCommand(u8),

    #[error("dial {target} failed: {source}")]
    Dial { target: String, source: io::Error },

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("invalid target address: {0}")]
    InvalidTarget(String),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("unrecognised proto: {0}")]
    UnknownProtocol(String),
}

/// Proxy protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
    Socks5,
}

impl FromStr for Protocol {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "socks5" => Ok(Protocol::Socks5),
            _ => Err(ProxyError::UnknownProtocol(s.to_string())),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Socks5 => "socks5",
        };
        write!(f, "{}", s)
    }
}

/// How a proxy server behaves.
#[async_trait]
pub trait Proxy: Send + Sync {
    /// String representation of the protocol being spoken.
    fn protocol(&self) -> &'static str;

    /// Accept and handle connections on a pre-bound listener until the
    /// token is cancelled or the listener fails.
    async fn serve(&self, listener: TcpListener, token: CancellationToken) -> crate::Result<()>;

    /// Bind `0.0.0.0:port` and serve. A bind failure is fatal.
    async fn listen_and_serve(&self, token: CancellationToken, port: u16) -> crate::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("{} proxy listening on {}", self.protocol(), listener.local_addr()?);
        self.serve(listener, token).await
    }
}

/// Shared accept loop: one spawned handler per connection, each under a
/// child of the server token. An accept error terminates the loop with
/// that error; cancellation returns [`crate::Error::Cancelled`] and closes
/// the listener on the way out.
pub(crate) async fn accept_loop<H, Fut>(
    listener: TcpListener,
    token: CancellationToken,
    handler: H,
) -> crate::Result<()>
where
    H: Fn(TcpStream, SocketAddr, CancellationToken) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handler(stream, peer, token.child_token()));
                    }
                    Err(e) => return Err(crate::Error::Io(e)),
                }
            }
            _ = token.cancelled() => return Err(crate::Error::Cancelled),
        }
    }
}
