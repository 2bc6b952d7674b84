//! Bidirectional byte relay
//!
//! [`relay`] shuttles bytes between two endpoints until one direction ends,
//! the inactivity deadline fires, or the parent token is cancelled. The two
//! directions run as symmetric peers sharing an activity counter; an idle
//! watcher trips when a full period passes without the counter moving.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no data transferred for {0:?}")]
    IdleTimeout(Duration),

    #[error("relay cancelled")]
    Cancelled,

    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(usize),
}

/// Tuning for one relay pair.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum period without observed progress before both endpoints are
    /// closed.
    pub idle_timeout: Duration,
    /// Maximum bytes read per copy iteration.
    pub chunk_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: crate::DEFAULT_IDLE_TIMEOUT,
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl RelayConfig {
    pub fn new(idle_timeout: Duration, chunk_size: usize) -> Self {
        Self {
            idle_timeout,
            chunk_size,
        }
    }

    /// Defaults for HTTP CONNECT tunnels.
    pub fn tunnel() -> Self {
        Self {
            idle_timeout: crate::HTTP_TUNNEL_IDLE_TIMEOUT,
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Shuttle bytes between `a` and `b` in both directions.
///
/// Returns once both directions have seen a clean EOF, or with the first
/// error: a socket failure, [`RelayError::IdleTimeout`] when neither
/// direction makes progress for a full `idle_timeout`, or
/// [`RelayError::Cancelled`] when `token` fires. Both endpoints are
/// consumed and closed on every exit path.
pub async fn relay<A, B>(
    token: CancellationToken,
    a: A,
    b: B,
    config: RelayConfig,
) -> Result<(), RelayError>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    if config.chunk_size == 0 {
        return Err(RelayError::InvalidChunkSize(config.chunk_size));
    }

    let activity = Arc::new(AtomicU64::new(0));

    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let a_to_b = shuttle(a_read, b_write, config.chunk_size, Arc::clone(&activity));
    let b_to_a = shuttle(b_read, a_write, config.chunk_size, Arc::clone(&activity));
    let idle = idle_watch(Arc::clone(&activity), config.idle_timeout);
    tokio::pin!(a_to_b, b_to_a, idle);

    let mut a_done = false;
    let mut b_done = false;

    loop {
        tokio::select! {
            res = &mut a_to_b, if !a_done => {
                let n = res?;
                trace!("outbound direction finished after {} bytes", n);
                a_done = true;
                if b_done {
                    return Ok(());
                }
            }
            res = &mut b_to_a, if !b_done => {
                let n = res?;
                trace!("inbound direction finished after {} bytes", n);
                b_done = true;
                if a_done {
                    return Ok(());
                }
            }
            _ = &mut idle => return Err(RelayError::IdleTimeout(config.idle_timeout)),
            _ = token.cancelled() => return Err(RelayError::Cancelled),
        }
    }
}

/// One transfer direction: bounded reads from `r`, written to `w`.
///
/// A clean EOF half-closes the peer's write side so it can observe the end
/// of the stream while its own transfer keeps draining. Only reads that
/// returned bytes count as progress.
async fn shuttle<R, W>(
    mut r: R,
    mut w: W,
    chunk_size: usize,
    activity: Arc<AtomicU64>,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;

    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            let _ = w.shutdown().await;
            return Ok(total);
        }
        w.write_all(&buf[..n]).await?;
        activity.fetch_add(1, Ordering::Relaxed);
        total += n as u64;
    }
}

/// Completes once a full `period` elapses with no movement on `activity`.
async fn idle_watch(activity: Arc<AtomicU64>, period: Duration) {
    let mut seen = activity.load(Ordering::Relaxed);
    loop {
        tokio::time::sleep(period).await;
        let now = activity.load(Ordering::Relaxed);
        if now == seen {
            return;
        }
        seen = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::duplex;

    #[tokio::test]
    async fn moves_data_both_ways() {
        let (client_a, a_end) = duplex(64 * 1024);
        let (client_b, b_end) = duplex(64 * 1024);

        let token = CancellationToken::new();
        let handle = tokio::spawn(relay(token, a_end, b_end, RelayConfig::default()));

        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();

        let (mut a_read, mut a_write) = tokio::io::split(client_a);
        let (mut b_read, mut b_write) = tokio::io::split(client_b);

        let out = payload.clone();
        let send_a = tokio::spawn(async move {
            a_write.write_all(&out).await.unwrap();
            a_write.shutdown().await.unwrap();
        });
        let out = payload.clone();
        let send_b = tokio::spawn(async move {
            b_write.write_all(&out).await.unwrap();
            b_write.shutdown().await.unwrap();
        });
        let recv_a = tokio::spawn(async move {
            let mut got = Vec::new();
            a_read.read_to_end(&mut got).await.unwrap();
            got
        });
        let recv_b = tokio::spawn(async move {
            let mut got = Vec::new();
            b_read.read_to_end(&mut got).await.unwrap();
            got
        });

        assert_eq!(recv_b.await.unwrap(), payload);
        assert_eq!(recv_a.await.unwrap(), payload);
        send_a.await.unwrap();
        send_b.await.unwrap();

        assert!(matches!(handle.await.unwrap(), Ok(())));
    }

    #[tokio::test]
    async fn idle_timeout_closes_both_ends() {
        let (mut client_a, a_end) = duplex(1024);
        let (mut client_b, b_end) = duplex(1024);

        let config = RelayConfig::new(Duration::from_millis(100), 1500);
        let started = Instant::now();
        let res = relay(CancellationToken::new(), a_end, b_end, config).await;

        assert!(matches!(res, Err(RelayError::IdleTimeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(100));

        // the relay's ends are gone, so both peers see EOF
        let mut buf = [0u8; 1];
        assert_eq!(client_a.read(&mut buf).await.unwrap(), 0);
        assert_eq!(client_b.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn traffic_defers_idle_timeout() {
        let (mut client_a, a_end) = duplex(1024);
        let (mut client_b, b_end) = duplex(1024);

        let config = RelayConfig::new(Duration::from_millis(120), 1500);
        let handle = tokio::spawn(relay(CancellationToken::new(), a_end, b_end, config));

        // keep one direction busy past the first idle period
        for _ in 0..4 {
            client_a.write_all(b"tick").await.unwrap();
            let mut buf = [0u8; 4];
            client_b.read_exact(&mut buf).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let res = tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("relay should time out after traffic stops")
            .unwrap();
        assert!(matches!(res, Err(RelayError::IdleTimeout(_))));
    }

    #[tokio::test]
    async fn cancellation_stops_transfer() {
        let (mut client_a, a_end) = duplex(1024);
        let (_client_b, b_end) = duplex(1024);

        let token = CancellationToken::new();
        let cancel = token.clone();
        let handle = tokio::spawn(relay(token, a_end, b_end, RelayConfig::default()));

        client_a.write_all(b"in flight").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let res = tokio::time::timeout(Duration::from_millis(50), handle)
            .await
            .expect("relay should stop promptly on cancellation")
            .unwrap();
        assert!(matches!(res, Err(RelayError::Cancelled)));
    }

    #[tokio::test]
    async fn rejects_zero_chunk_size() {
        let (_client_a, a_end) = duplex(16);
        let (_client_b, b_end) = duplex(16);

        let config = RelayConfig::new(Duration::from_secs(1), 0);
        let res = relay(CancellationToken::new(), a_end, b_end, config).await;
        assert!(matches!(res, Err(RelayError::InvalidChunkSize(0))));
    }

    #[tokio::test]
    async fn half_close_drains_remaining_direction() {
        let (client_a, a_end) = duplex(1024);
        let (mut client_b, b_end) = duplex(1024);

        let handle = tokio::spawn(relay(
            CancellationToken::new(),
            a_end,
            b_end,
            RelayConfig::default(),
        ));

        // close the a side entirely; b can still finish its send
        let (mut a_read, mut a_write) = tokio::io::split(client_a);
        a_write.shutdown().await.unwrap();

        client_b.write_all(b"late data").await.unwrap();
        let mut buf = [0u8; 9];
        a_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late data");

        // b closes; relay ends cleanly
        client_b.shutdown().await.unwrap();
        assert!(matches!(handle.await.unwrap(), Ok(())));
    }
}
