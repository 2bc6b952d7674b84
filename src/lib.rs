//! # Switchboard
//!
//! A multi-protocol TCP proxy server. Inbound client connections are
//! terminated, a negotiation protocol (SOCKS5 per RFC 1928, or HTTP/1.1
//! with CONNECT tunneling) determines the intended upstream, the upstream
//! is dialed, and bytes are relayed in both directions until one side
//! closes, the relay goes idle, or shutdown is signalled.
//!
//! ## Architecture
//!
//! ```text
//! client socket -> accept loop -> protocol engine (SOCKS5 | HTTP)
//!                                      |
//!                                   dialer -> upstream socket
//!                                      |
//!                          (client, upstream) -> relay
//! ```
//!
//! The protocol engines live in [`proxy`], the byte shuttle in [`relay`],
//! and the upstream dialing seam in [`dialer`]. Cancellation is carried by
//! a `CancellationToken`; everything else (timeouts, chunk sizing) travels
//! as explicit configuration values.

pub mod config;
pub mod dialer;
pub mod proxy;
pub mod relay;

pub use config::Config;
pub use dialer::{Dialer, TcpDialer};
pub use proxy::{HttpProxy, Protocol, Proxy, Socks5Proxy};
pub use relay::{relay, RelayConfig, RelayError};

use std::time::Duration;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 1080;

/// Default transmit unit for the relay. Approximates a standard Ethernet
/// MTU payload; bounds per-direction latency and memory use.
pub const DEFAULT_CHUNK_SIZE: usize = 1500;

/// Default inactivity deadline for SOCKS5 relays.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Inactivity deadline for HTTP CONNECT tunnels.
pub const HTTP_TUNNEL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for dialing an upstream.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,
}
