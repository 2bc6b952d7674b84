//! HTTP proxy implementation
//!
//! Two modes, selected by request method: plain requests are re-issued
//! upstream after hop-by-hop header cleanup (RFC 7230 section 6.1), and
//! `CONNECT` hijacks the raw stream and hands it to the relay. Wrapping
//! the listener in TLS turns the same engine into the `https` variant.

use super::{accept_loop, Proxy, ProxyError};
use crate::dialer::Dialer;
use crate::relay::{relay, RelayConfig, RelayError};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// HTTP proxy server
#[derive(Clone)]
pub struct HttpProxy {
    dialer: Arc<dyn Dialer>,
    tunnel_config: RelayConfig,
    tls: Option<TlsAcceptor>,
}

impl HttpProxy {
    /// Create a new HTTP proxy dialing upstreams through `dialer`.
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            tunnel_config: RelayConfig::tunnel(),
            tls: None,
        }
    }

    /// Wrap accepted connections in TLS; the proxy then reports itself
    /// as `https`.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Override the relay tuning used for CONNECT tunnels.
    pub fn with_tunnel_config(mut self, tunnel_config: RelayConfig) -> Self {
        self.tunnel_config = tunnel_config;
        self
    }

    /// Handle one accepted connection: parse the request head, then either
    /// tunnel (CONNECT) or forward the request upstream.
    pub async fn handle<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        token: CancellationToken,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(stream);

        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await? == 0 {
            // client connected and went away
            return Ok(());
        }

        let mut parts = request_line.split_whitespace();
        let (method, target) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(_version)) => (m.to_string(), t.to_string()),
            _ => {
                write_status(reader.get_mut(), "400 Bad Request").await?;
                return Err(ProxyError::MalformedRequest(
                    request_line.trim().to_string(),
                ));
            }
        };

        let headers = read_headers(&mut reader).await?;

        debug!("HTTP {} {} from {}", method, target, peer);

        if method.eq_ignore_ascii_case("CONNECT") {
            self.handle_connect(reader, &target, peer, token).await
        } else {
            self.handle_forward(reader, &method, &target, headers, token)
                .await
        }
    }

    /// CONNECT: dial the authority, acknowledge, take over the raw stream,
    /// and relay.
    async fn handle_connect<S>(
        &self,
        mut reader: BufReader<S>,
        target: &str,
        peer: SocketAddr,
        token: CancellationToken,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !valid_authority(target) {
            write_status(reader.get_mut(), "400 Bad Request").await?;
            return Err(ProxyError::InvalidTarget(target.to_string()));
        }

        let mut upstream = match self.dialer.dial(&token, target).await {
            Ok(conn) => conn,
            Err(e) => {
                write_status(reader.get_mut(), "503 Service Unavailable").await?;
                return Err(ProxyError::Dial {
                    target: target.to_string(),
                    source: e,
                });
            }
        };

        reader.get_mut().write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;

        // take over the raw stream; anything the client pipelined behind
        // the request head is sitting in the read buffer
        let buffered = reader.buffer().to_vec();
        let client = reader.into_inner();
        if !buffered.is_empty() {
            upstream.write_all(&buffered).await?;
        }

        let start = Instant::now();
        debug!("tunnel {} ~> {}: begin", peer, target);

        let res = relay(token, client, upstream, self.tunnel_config.clone()).await;

        debug!(
            "tunnel {} ~> {}: end after {:?}",
            peer,
            target,
            start.elapsed()
        );

        match res {
            Ok(()) => Ok(()),
            Err(RelayError::Cancelled) => {
                debug!("tunnel to {} cancelled by shutdown", target);
                Ok(())
            }
            Err(RelayError::IdleTimeout(d)) => {
                debug!("tunnel to {} idle for {:?}, closing", target, d);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-issue a plain request upstream and stream the response back.
    async fn handle_forward<S>(
        &self,
        mut reader: BufReader<S>,
        method: &str,
        target: &str,
        mut headers: Vec<(String, String)>,
        token: CancellationToken,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (authority, path) = match split_request_target(target, &headers) {
            Some(t) => t,
            None => {
                write_status(reader.get_mut(), "400 Bad Request").await?;
                return Err(ProxyError::InvalidTarget(target.to_string()));
            }
        };

        clean_headers(&mut headers);
        if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host")) {
            headers.push(("Host".to_string(), authority.clone()));
        }

        let upstream = match self.dialer.dial(&token, &authority).await {
            Ok(conn) => conn,
            Err(e) => {
                write_status(reader.get_mut(), "503 Service Unavailable").await?;
                return Err(ProxyError::Dial {
                    target: authority,
                    source: e,
                });
            }
        };
        let mut upstream = BufReader::new(upstream);

        // request head in origin form; close delimits unframed bodies
        let mut head = format!("{} {} HTTP/1.1\r\n", method, path);
        for (name, value) in &headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("Connection: close\r\n\r\n");
        upstream.get_mut().write_all(head.as_bytes()).await?;

        if let Some(len) = content_length(&headers) {
            if len > 0 {
                let mut body = (&mut reader).take(len);
                tokio::io::copy(&mut body, upstream.get_mut()).await?;
            }
        }

        let mut status_line = String::new();
        if upstream.read_line(&mut status_line).await? == 0 {
            return Err(ProxyError::MalformedRequest(
                "upstream closed before responding".to_string(),
            ));
        }
        let mut response_headers = read_headers(&mut upstream).await?;
        clean_headers(&mut response_headers);

        let client = reader.get_mut();
        let mut head = String::new();
        head.push_str(status_line.trim_end());
        head.push_str("\r\n");
        for (name, value) in &response_headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("Connection: close\r\n\r\n");
        client.write_all(head.as_bytes()).await?;

        let copied = tokio::select! {
            res = tokio::io::copy(&mut upstream, client) => res?,
            _ = token.cancelled() => return Err(ProxyError::Relay(RelayError::Cancelled)),
        };
        debug!("forwarded {} {} ({} body bytes)", method, target, copied);

        let _ = client.shutdown().await;
        Ok(())
    }
}

#[async_trait]
impl Proxy for HttpProxy {
    fn protocol(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }

    async fn serve(&self, listener: TcpListener, token: CancellationToken) -> crate::Result<()> {
        accept_loop(listener, token, |stream, peer, conn_token| {
            let engine = self.clone();
            async move {
                debug!("new {} proxy connection from {}", engine.protocol(), peer);
                let res = match engine.tls.clone() {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => engine.handle(tls_stream, peer, conn_token).await,
                        Err(e) => {
                            debug!("TLS accept from {} failed: {}", peer, e);
                            return;
                        }
                    },
                    None => engine.handle(stream, peer, conn_token).await,
                };
                if let Err(e) = res {
                    error!("HTTP proxy connection from {} failed: {}", peer, e);
                }
            }
        })
        .await
    }
}

/// Read header lines up to the blank separator.
async fn read_headers<R>(reader: &mut R) -> Result<Vec<(String, String)>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ProxyError::MalformedRequest(
                "unterminated header block".to_string(),
            ));
        }
        let line = line.trim_end();
        if line.is_empty() {
            return Ok(headers);
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
}

/// Drop the fields not intended for downstream recipients: every field the
/// `Connection` header names, then `Connection` itself. See RFC 7230
/// section 6.1.
fn clean_headers(headers: &mut Vec<(String, String)>) {
    let named: Vec<String> = headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, value)| value.split(',').map(|t| t.trim().to_string()))
        .collect();

    headers.retain(|(name, _)| {
        !name.eq_ignore_ascii_case("connection")
            && !named.iter().any(|h| name.eq_ignore_ascii_case(h))
    });
}

/// Resolve the request target into `(authority, origin-form path)`.
///
/// Proxy requests normally carry the absolute form; origin-form targets
/// fall back to the `Host` header.
fn split_request_target(
    target: &str,
    headers: &[(String, String)],
) -> Option<(String, String)> {
    if let Some(rest) = target.strip_prefix("http://") {
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return None;
        }
        Some((ensure_port(authority), path.to_string()))
    } else if target.starts_with('/') {
        let host = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("host"))
            .map(|(_, value)| value.clone())?;
        Some((ensure_port(&host), target.to_string()))
    } else {
        None
    }
}

/// Append the default HTTP port when the authority carries none.
fn ensure_port(authority: &str) -> String {
    let has_port = if let Some(rest) = authority.strip_prefix('[') {
        // bracketed IPv6: a port sits after the closing bracket
        rest.rsplit_once(']')
            .map(|(_, tail)| tail.starts_with(':'))
            .unwrap_or(false)
    } else {
        authority.contains(':')
    };

    if has_port {
        authority.to_string()
    } else {
        format!("{}:80", authority)
    }
}

/// A CONNECT authority must be `host:port`.
fn valid_authority(target: &str) -> bool {
    match target.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().map_or(false, |p| p > 0),
        None => false,
    }
}

fn content_length(headers: &[(String, String)]) -> Option<u64> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse().ok())
}

async fn write_status<W>(w: &mut W, status: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(format!("HTTP/1.1 {}\r\n\r\n", status).as_bytes())
        .await
}
