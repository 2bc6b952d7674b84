//! Upstream dialing
//!
//! The [`Dialer`] trait is the seam between the protocol engines and the
//! network: engines ask it for a TCP connection to a `host:port` target and
//! never touch the platform client directly. The default implementation
//! resolves, connects under a deadline, and honours cancellation.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Opens TCP connections to upstream targets.
///
/// Implementations map their failure classes onto `io::ErrorKind` so
/// callers can derive wire-level reply codes from the error alone:
/// resolution failures surface as `HostUnreachable`, expired deadlines as
/// `TimedOut`, and cancellation as `Interrupted`.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr`, a canonical `host:port` target.
    async fn dial(&self, token: &CancellationToken, addr: &str) -> io::Result<TcpStream>;
}

/// Default dialer backed by the tokio TCP client.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    /// Deadline for the whole dial, resolution included.
    pub connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: crate::DIAL_TIMEOUT,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, token: &CancellationToken, addr: &str) -> io::Result<TcpStream> {
        let connect = async {
            let addrs = lookup_host(addr)
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::HostUnreachable, e))?;

            let mut last_err = None;
            for sa in addrs {
                match TcpStream::connect(sa).await {
                    Ok(stream) => {
                        stream.set_nodelay(true).ok();
                        trace!("dialed {} via {}", addr, sa);
                        return Ok(stream);
                    }
                    Err(e) => last_err = Some(e),
                }
            }

            Err(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::HostUnreachable, "no addresses resolved")
            }))
        };

        tokio::select! {
            _ = token.cancelled() => {
                Err(io::Error::new(io::ErrorKind::Interrupted, "dial cancelled"))
            }
            res = tokio::time::timeout(self.connect_timeout, connect) => match res {
                Ok(r) => r,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial {} timed out", addr),
                )),
            },
        }
    }
}
