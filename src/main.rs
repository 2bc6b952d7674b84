//! Switchboard proxy server
//!
//! A single binary exposing the SOCKS5 and HTTP(S) proxy engines: pick a
//! protocol, a port, and (for https) a certificate/key pair. SIGINT and
//! SIGTERM shut the server down gracefully.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use switchboard::config::Config;
use switchboard::dialer::{Dialer, TcpDialer};
use switchboard::proxy::{HttpProxy, Protocol, Proxy, Socks5Proxy};
use switchboard::relay::RelayConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Switchboard - multi-protocol TCP proxy
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(about = "Multi-protocol TCP proxy server (SOCKS5, HTTP, HTTPS)")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Server listening port [default: 1080]
    #[arg(short, long)]
    port: Option<u16>,

    /// Proxy protocol used. Available protocols: http, https, socks5
    #[arg(long)]
    proto: Option<String>,

    /// TLS certificate path [default: server.pem]
    #[arg(long)]
    cert: Option<String>,

    /// TLS key path [default: server.key]
    #[arg(long)]
    key: Option<String>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path).context("failed to load configuration")?,
        None => Config::default(),
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let proto: Protocol = args
        .proto
        .clone()
        .or_else(|| config.server.proto.clone())
        .ok_or_else(|| anyhow!("proto is required (--proto or the config file)"))?
        .parse()
        .map_err(|e| anyhow!("{}", e))?;

    let port = args
        .port
        .or(config.server.port)
        .unwrap_or(switchboard::DEFAULT_PORT);

    let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::default());

    let proxy: Arc<dyn Proxy> = match proto {
        Protocol::Socks5 => {
            let relay_config = config.relay.apply_to(RelayConfig::default());
            Arc::new(Socks5Proxy::new(dialer).with_relay_config(relay_config))
        }
        Protocol::Http => {
            let tunnel_config = config.relay.apply_to(RelayConfig::tunnel());
            Arc::new(HttpProxy::new(dialer).with_tunnel_config(tunnel_config))
        }
        Protocol::Https => {
            let cert_path = args
                .cert
                .clone()
                .or_else(|| config.server.tls_cert.clone())
                .unwrap_or_else(|| "server.pem".to_string());
            let key_path = args
                .key
                .clone()
                .or_else(|| config.server.tls_key.clone())
                .unwrap_or_else(|| "server.key".to_string());

            let certs = load_certs(&cert_path).context("failed to load TLS certificate")?;
            let key = load_private_key(&key_path).context("failed to load TLS private key")?;
            let tls_config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .context("failed to build TLS server config")?;

            let tunnel_config = config.relay.apply_to(RelayConfig::tunnel());
            Arc::new(
                HttpProxy::new(dialer)
                    .with_tls(TlsAcceptor::from(Arc::new(tls_config)))
                    .with_tunnel_config(tunnel_config),
            )
        }
    };

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    info!("proxy ({}) listening on :{}", proxy.protocol(), port);
    match proxy.listen_and_serve(token, port).await {
        Ok(()) => Ok(()),
        Err(switchboard::Error::Cancelled) => {
            info!("shut down");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Resolves once SIGINT or SIGTERM is delivered.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let ctrl_c = tokio::signal::ctrl_c();
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Load a TLS certificate chain from a PEM file.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let mut file = std::io::BufReader::new(
        std::fs::File::open(path).context(format!("failed to open cert file: {}", path))?,
    );
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to parse PEM certificates")?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", path));
    }
    Ok(certs)
}

/// Load a TLS private key from a PEM file.
fn load_private_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let mut file = std::io::BufReader::new(
        std::fs::File::open(path).context(format!("failed to open key file: {}", path))?,
    );
    rustls_pemfile::private_key(&mut file)
        .context("failed to parse PEM private key")?
        .ok_or_else(|| anyhow!("no private key found in {}", path))
}
