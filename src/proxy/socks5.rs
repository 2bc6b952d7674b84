//! SOCKS5 proxy implementation (RFC 1928)

use super::{accept_loop, addr, Proxy, ProxyError};
use crate::dialer::Dialer;
use crate::relay::{relay, RelayConfig, RelayError};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// SOCKS5 version
pub const SOCKS_VERSION: u8 = 0x05;

/// METHOD field values
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;

/// CMD field values
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// REP field values
pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;
/// Reserved by the RFC, never sent.
pub const REP_UNASSIGNED: u8 = 0x09;

/// Fills fields marked as reserved.
pub const FIELD_RESERVED: u8 = 0x00;

/// Methods the server is willing to select, in preference order.
const SUPPORTED_METHODS: &[u8] = &[METHOD_NO_AUTH];

/// SOCKS5 proxy server
#[derive(Clone)]
pub struct Socks5Proxy {
    dialer: Arc<dyn Dialer>,
    relay_config: RelayConfig,
}

impl Socks5Proxy {
    /// Create a new SOCKS5 proxy dialing upstreams through `dialer`.
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            relay_config: RelayConfig::default(),
        }
    }

    /// Override the relay tuning used after dispatch.
    pub fn with_relay_config(mut self, relay_config: RelayConfig) -> Self {
        self.relay_config = relay_config;
        self
    }

    /// Perform the steps required to be SOCKS5 compliant on one accepted
    /// connection: method subnegotiation, request parsing, dispatch, and
    /// the relay. The stream is consumed and closed on every exit path.
    pub async fn handle<S>(
        &self,
        mut stream: S,
        peer: SocketAddr,
        token: CancellationToken,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.negotiate(&mut stream).await?;

        let (cmd, target) = read_request(&mut stream).await?;
        debug!("performing [{}] to {} for {}", pretty_cmd(cmd), target, peer);

        match cmd {
            CMD_CONNECT => self.connect(stream, &target, peer, token).await,
            _ => {
                write_reply(&mut stream, REP_COMMAND_NOT_SUPPORTED, None).await?;
                Err(ProxyError::UnsupportedCommand(cmd))
            }
        }
    }

    /// Method subnegotiation. Writes the selection reply unless the
    /// greeting itself is malformed.
    async fn negotiate<S>(&self, stream: &mut S) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;

        if header[0] != SOCKS_VERSION {
            return Err(ProxyError::UnsupportedVersion(header[0]));
        }
        let nmethods = header[1] as usize;
        if nmethods == 0 {
            return Err(ProxyError::NoMethodsOffered);
        }

        let mut methods = vec![0u8; nmethods];
        stream.read_exact(&mut methods).await?;

        let method = select_method(&methods);
        stream.write_all(&[SOCKS_VERSION, method]).await?;

        if method == METHOD_NO_ACCEPTABLE {
            return Err(ProxyError::NoAcceptableMethod);
        }
        Ok(())
    }

    /// CONNECT: dial the target, echo the bound address, then relay.
    async fn connect<S>(
        &self,
        mut stream: S,
        target: &str,
        peer: SocketAddr,
        token: CancellationToken,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let upstream = match self.dialer.dial(&token, target).await {
            Ok(conn) => conn,
            Err(e) => {
                write_reply(&mut stream, reply_for_dial_error(&e), None).await?;
                return Err(ProxyError::Dial {
                    target: target.to_string(),
                    source: e,
                });
            }
        };

        let bound = upstream.local_addr()?;
        write_reply(&mut stream, REP_SUCCESS, Some(bound)).await?;

        let start = Instant::now();
        debug!("{} <-> {} (~> {}): data transmission begin", peer, bound, target);

        let res = relay(token, stream, upstream, self.relay_config.clone()).await;

        debug!(
            "{} <-> {} (~> {}): data transmission end after {:?}",
            peer,
            bound,
            target,
            start.elapsed()
        );

        match res {
            Ok(()) => Ok(()),
            Err(RelayError::Cancelled) => {
                debug!("relay for {} cancelled by shutdown", target);
                Ok(())
            }
            Err(RelayError::IdleTimeout(d)) => {
                info!("connection to {} idle for {:?}, closing", target, d);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Proxy for Socks5Proxy {
    fn protocol(&self) -> &'static str {
        "socks5"
    }

    async fn serve(&self, listener: TcpListener, token: CancellationToken) -> crate::Result<()> {
        accept_loop(listener, token, |stream, peer, conn_token| {
            let engine = self.clone();
            async move {
                debug!("new SOCKS5 connection from {}", peer);
                if let Err(e) = engine.handle(stream, peer, conn_token).await {
                    error!("SOCKS5 connection from {} failed: {}", peer, e);
                }
            }
        })
        .await
    }
}

/// Read the request header and target address that follow negotiation.
async fn read_request<S>(stream: &mut S) -> Result<(u8, String), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(ProxyError::UnsupportedVersion(header[0]));
    }
    let cmd = header[1];
    // header[2] is reserved

    let target = addr::read_address(stream).await?;
    Ok((cmd, target))
}

/// Write a reply. `bound` carries the upstream's local endpoint on
/// success; `None` emits the zero-filled IPv4 null triple.
async fn write_reply<W>(w: &mut W, rep: u8, bound: Option<SocketAddr>) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![SOCKS_VERSION, rep, FIELD_RESERVED];
    match bound {
        Some(sa) => {
            let encoded = addr::write_address(&sa.to_string())?;
            buf.extend_from_slice(&encoded);
        }
        None => {
            buf.push(addr::ATYP_IPV4);
            buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    w.write_all(&buf).await?;
    Ok(())
}

/// Scan the server's preference order for a method the client offered.
fn select_method(offered: &[u8]) -> u8 {
    for supported in SUPPORTED_METHODS {
        if offered.contains(supported) {
            return *supported;
        }
    }
    METHOD_NO_ACCEPTABLE
}

/// Map a dial failure onto its REP code.
fn reply_for_dial_error(e: &io::Error) -> u8 {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
        io::ErrorKind::HostUnreachable | io::ErrorKind::TimedOut => REP_HOST_UNREACHABLE,
        io::ErrorKind::NetworkUnreachable => REP_NETWORK_UNREACHABLE,
        _ => REP_GENERAL_FAILURE,
    }
}

fn pretty_cmd(cmd: u8) -> &'static str {
    match cmd {
        CMD_CONNECT => "Connect",
        CMD_BIND => "Bind",
        CMD_UDP_ASSOCIATE => "Associate",
        _ => "Undefined",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::TcpDialer;
    use tokio::io::duplex;
    use tokio::net::TcpStream;

    fn engine() -> Socks5Proxy {
        Socks5Proxy::new(Arc::new(TcpDialer::default()))
    }

    fn test_peer() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Start a TCP echo server, return its address.
    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if let Ok((mut stream, _)) = listener.accept().await {
                    tokio::spawn(async move {
                        let (mut r, mut w) = stream.split();
                        let _ = tokio::io::copy(&mut r, &mut w).await;
                    });
                }
            }
        });
        addr
    }

    /// Read a reply, returning (rep, atyp) and consuming the bound address.
    async fn read_reply<S: AsyncRead + Unpin>(stream: &mut S) -> (u8, u8) {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], SOCKS_VERSION);
        let (rep, atyp) = (header[1], header[3]);
        match atyp {
            addr::ATYP_IPV4 => {
                let mut rest = [0u8; 6];
                stream.read_exact(&mut rest).await.unwrap();
            }
            addr::ATYP_IPV6 => {
                let mut rest = [0u8; 18];
                stream.read_exact(&mut rest).await.unwrap();
            }
            addr::ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.unwrap();
                let mut rest = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut rest).await.unwrap();
            }
            _ => panic!("unexpected ATYP {}", atyp),
        }
        (rep, atyp)
    }

    #[tokio::test]
    async fn negotiate_selects_no_auth() {
        let (mut client, mut server) = duplex(256);
        client.write_all(&[5, 2, 0, 1]).await.unwrap();

        engine().negotiate(&mut server).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0]);
    }

    #[tokio::test]
    async fn negotiate_rejects_unsupported_methods() {
        let (mut client, mut server) = duplex(256);
        // client offers only GSSAPI
        client.write_all(&[5, 1, 1]).await.unwrap();

        let err = engine().negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoAcceptableMethod));

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0xff]);
    }

    #[tokio::test]
    async fn negotiate_rejects_wrong_version() {
        let (mut client, mut server) = duplex(256);
        client.write_all(&[4, 1]).await.unwrap();

        let err = engine().negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::UnsupportedVersion(4)));

        // nothing must have been written back
        drop(server);
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn negotiate_rejects_zero_methods() {
        let (mut client, mut server) = duplex(256);
        client.write_all(&[5, 0]).await.unwrap();

        let err = engine().negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoMethodsOffered));

        drop(server);
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn connect_relays_to_echo_server() {
        let echo = echo_server().await;
        let (mut client, server) = duplex(4096);

        let eng = engine();
        let handle = tokio::spawn(async move {
            let _ = eng
                .handle(server, test_peer(), CancellationToken::new())
                .await;
        });

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0]);

        let mut request = vec![5, CMD_CONNECT, 0, addr::ATYP_IPV4];
        match echo.ip() {
            std::net::IpAddr::V4(ip) => request.extend_from_slice(&ip.octets()),
            std::net::IpAddr::V6(_) => unreachable!(),
        }
        request.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let (rep, atyp) = read_reply(&mut client).await;
        assert_eq!(rep, REP_SUCCESS);
        assert_eq!(atyp, addr::ATYP_IPV4);

        let payload = b"hello through the proxy";
        client.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, payload);

        drop(client);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn connect_to_domain_target() {
        let echo = echo_server().await;
        let (mut client, server) = duplex(4096);

        let eng = engine();
        tokio::spawn(async move {
            let _ = eng
                .handle(server, test_peer(), CancellationToken::new())
                .await;
        });

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        let host = b"localhost";
        let mut request = vec![5, CMD_CONNECT, 0, addr::ATYP_DOMAIN, host.len() as u8];
        request.extend_from_slice(host);
        request.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let (rep, _) = read_reply(&mut client).await;
        assert_eq!(rep, REP_SUCCESS);

        client.write_all(b"via domain").await.unwrap();
        let mut echoed = [0u8; 10];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"via domain");
    }

    #[tokio::test]
    async fn connect_refused_maps_to_rep_5() {
        let (mut client, server) = duplex(1024);

        let eng = engine();
        let handle = tokio::spawn(async move {
            eng.handle(server, test_peer(), CancellationToken::new())
                .await
        });

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        // port 1 on loopback refuses immediately
        let request = [5, CMD_CONNECT, 0, addr::ATYP_IPV4, 127, 0, 0, 1, 0, 1];
        client.write_all(&request).await.unwrap();

        let (rep, atyp) = read_reply(&mut client).await;
        assert_eq!(rep, REP_CONNECTION_REFUSED);
        assert_eq!(atyp, addr::ATYP_IPV4);

        assert!(matches!(
            handle.await.unwrap(),
            Err(ProxyError::Dial { .. })
        ));
    }

    #[tokio::test]
    async fn bind_is_declined() {
        let (mut client, server) = duplex(1024);

        let eng = engine();
        let handle = tokio::spawn(async move {
            eng.handle(server, test_peer(), CancellationToken::new())
                .await
        });

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        let request = [5, CMD_BIND, 0, addr::ATYP_IPV4, 127, 0, 0, 1, 0, 80];
        client.write_all(&request).await.unwrap();

        let mut full_reply = [0u8; 10];
        client.read_exact(&mut full_reply).await.unwrap();
        assert_eq!(full_reply, [5, 7, 0, 1, 0, 0, 0, 0, 0, 0]);

        assert!(matches!(
            handle.await.unwrap(),
            Err(ProxyError::UnsupportedCommand(CMD_BIND))
        ));
    }

    #[tokio::test]
    async fn associate_is_declined() {
        let (mut client, server) = duplex(1024);

        let eng = engine();
        let handle = tokio::spawn(async move {
            eng.handle(server, test_peer(), CancellationToken::new())
                .await
        });

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        let request = [
            5,
            CMD_UDP_ASSOCIATE,
            0,
            addr::ATYP_IPV4,
            0,
            0,
            0,
            0,
            0,
            0x50,
        ];
        client.write_all(&request).await.unwrap();

        let (rep, _) = read_reply(&mut client).await;
        assert_eq!(rep, REP_COMMAND_NOT_SUPPORTED);

        assert!(matches!(
            handle.await.unwrap(),
            Err(ProxyError::UnsupportedCommand(CMD_UDP_ASSOCIATE))
        ));
    }

    #[test]
    fn method_selection_prefers_server_order() {
        assert_eq!(select_method(&[0, 1, 2]), METHOD_NO_AUTH);
        assert_eq!(select_method(&[2, 1, 0]), METHOD_NO_AUTH);
        assert_eq!(select_method(&[1, 2]), METHOD_NO_ACCEPTABLE);
    }

    #[test]
    fn dial_error_rep_mapping() {
        let rep = |kind| reply_for_dial_error(&io::Error::from(kind));
        assert_eq!(rep(io::ErrorKind::ConnectionRefused), REP_CONNECTION_REFUSED);
        assert_eq!(rep(io::ErrorKind::TimedOut), REP_HOST_UNREACHABLE);
        assert_eq!(rep(io::ErrorKind::HostUnreachable), REP_HOST_UNREACHABLE);
        assert_eq!(
            rep(io::ErrorKind::NetworkUnreachable),
            REP_NETWORK_UNREACHABLE
        );
        assert_eq!(rep(io::ErrorKind::PermissionDenied), REP_GENERAL_FAILURE);
    }

    #[tokio::test]
    async fn success_reply_echoes_bound_address() {
        let echo = echo_server().await;

        // drive a real TCP round through serve() to check the bound triple
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let serve_token = token.clone();
        tokio::spawn(async move {
            let _ = engine().serve(listener, serve_token).await;
        });

        let mut conn = TcpStream::connect(proxy_addr).await.unwrap();
        conn.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        conn.read_exact(&mut reply).await.unwrap();

        let mut request = vec![5, CMD_CONNECT, 0, addr::ATYP_IPV4, 127, 0, 0, 1];
        request.extend_from_slice(&echo.port().to_be_bytes());
        conn.write_all(&request).await.unwrap();

        let mut header = [0u8; 4];
        conn.read_exact(&mut header).await.unwrap();
        assert_eq!(header[1], REP_SUCCESS);
        assert_eq!(header[3], addr::ATYP_IPV4);

        let mut bound = [0u8; 6];
        conn.read_exact(&mut bound).await.unwrap();
        // loopback upstream, so the proxy's outgoing socket is 127.0.0.1
        assert_eq!(&bound[..4], &[127, 0, 0, 1]);
        let port = u16::from_be_bytes([bound[4], bound[5]]);
        assert_ne!(port, 0);

        token.cancel();
    }
}
