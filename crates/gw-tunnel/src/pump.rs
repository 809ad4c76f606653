//! Bidirectional byte pump with half-close semantics.
//!
//! On EOF in one direction, that direction's task half-closes the opposite
//! endpoint's write side (rather than tearing down the whole connection)
//! and exits; the other direction keeps running until it observes its own
//! EOF, which happens once the peer half-closes back. Only once both
//! directions have finished does the caller treat the tunnel as closed —
//! this lets protocols that write their last bytes only after seeing EOF
//! on the request side (HTTP/1 without Content-Length, DB query replies)
//! finish delivering them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use gw_transform::TokenBucket;

use crate::buffer_pool::BufferPool;

pub struct PumpOutcome {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub send_err: Option<String>,
    pub recv_err: Option<String>,
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    pool: &BufferPool,
    limiter: Option<&TokenBucket>,
    counter: &AtomicU64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let mut buf = pool.acquire();
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            pool.release(buf);
            return Ok(());
        }
        if let Some(limiter) = limiter {
            limiter.wait_n(n as u64).await;
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        pool.release(buf);
    }
}

/// Pump bytes between `local` and `tunnel` until both directions reach
/// EOF or error. `limiter_send`/`limiter_recv` rate-limit the
/// local->tunnel and tunnel->local directions independently.
pub async fn pump_bidirectional<A, B>(
    local: A,
    tunnel: B,
    pool: Arc<BufferPool>,
    limiter_send: Option<Arc<TokenBucket>>,
    limiter_recv: Option<Arc<TokenBucket>>,
) -> PumpOutcome
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (local_r, local_w) = tokio::io::split(local);
    let (tunnel_r, tunnel_w) = tokio::io::split(tunnel);

    let bytes_sent = Arc::new(AtomicU64::new(0));
    let bytes_recv = Arc::new(AtomicU64::new(0));

    let send_task = {
        let pool = pool.clone();
        let bytes_sent = bytes_sent.clone();
        tokio::spawn(async move {
            copy_direction(local_r, tunnel_w, &pool, limiter_send.as_deref(), &bytes_sent).await
        })
    };
    let recv_task = {
        let pool = pool.clone();
        let bytes_recv = bytes_recv.clone();
        tokio::spawn(async move {
            copy_direction(tunnel_r, local_w, &pool, limiter_recv.as_deref(), &bytes_recv).await
        })
    };

    let send_result = send_task
        .await
        .unwrap_or_else(|e| Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())));
    let recv_result = recv_task
        .await
        .unwrap_or_else(|e| Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())));

    PumpOutcome {
        bytes_sent: bytes_sent.load(Ordering::Relaxed),
        bytes_recv: bytes_recv.load(Ordering::Relaxed),
        send_err: send_result.err().map(|e| e.to_string()),
        recv_err: recv_result.err().map(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn echoes_bytes_and_reports_normal_close() {
        let (local, mut local_peer) = duplex(4096);
        let (tunnel, mut tunnel_peer) = duplex(4096);
        let pool = Arc::new(BufferPool::new(8, 1024));

        let pump = tokio::spawn(pump_bidirectional(local, tunnel, pool, None, None));

        local_peer.write_all(b"HELLO").await.unwrap();
        local_peer.shutdown().await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = tunnel_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HELLO");

        tunnel_peer.shutdown().await.unwrap();

        let outcome = pump.await.unwrap();
        assert_eq!(outcome.bytes_sent, 5);
        assert!(outcome.send_err.is_none());
        assert!(outcome.recv_err.is_none());
    }

    #[tokio::test]
    async fn half_close_lets_opposite_direction_finish() {
        let (local, mut local_peer) = duplex(4096);
        let (tunnel, mut tunnel_peer) = duplex(4096);
        let pool = Arc::new(BufferPool::new(8, 1024));

        let pump = tokio::spawn(pump_bidirectional(local, tunnel, pool, None, None));

        // Peer on the local side closes its write direction first.
        local_peer.shutdown().await.unwrap();

        // The tunnel side can still send its response after observing the
        // half-close on its own read direction.
        tunnel_peer.write_all(b"late response").await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = local_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late response");

        tunnel_peer.shutdown().await.unwrap();
        let outcome = pump.await.unwrap();
        assert_eq!(outcome.bytes_recv, "late response".len() as u64);
    }
}
