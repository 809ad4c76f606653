//! `TunnelChannel`: the tunnel-transport endpoint `gw_tunnel::Tunnel::serve`
//! pumps bytes against. It demuxes one tunnel's data out of the shared
//! control connection's packet stream and muxes writes back into it as
//! `TunnelData` packets, so `Tunnel` never has to know tunnels share a
//! transport at all.
//!
//! Reads are fed by the client surface's read loop pushing payloads into
//! `inbound_rx` as it demuxes incoming `TunnelData` packets by `tunnel_id`.
//! An empty payload marks a half-close (the peer's write side shut down);
//! the channel surfaces that as ordinary EOF.
//!
//! Writes go into `outbound_tx`, drained by a per-tunnel task that frames
//! each chunk as a `TunnelData` packet and enqueues it on the shared
//! `StreamProcessor`. `poll_shutdown` sends an empty chunk as the
//! corresponding half-close marker, matching the UDP framing module's
//! convention of zero meaning "nothing here" made explicit for TCP tunnels.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

pub struct TunnelChannel {
    tunnel_id: String,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound_rx: mpsc::Receiver<Bytes>,
    read_leftover: Option<Bytes>,
    inbound_done: bool,
    registry: Arc<DashMap<String, mpsc::Sender<Bytes>>>,
}

impl TunnelChannel {
    pub(crate) fn new(
        tunnel_id: String,
        outbound_tx: mpsc::UnboundedSender<Bytes>,
        inbound_rx: mpsc::Receiver<Bytes>,
        registry: Arc<DashMap<String, mpsc::Sender<Bytes>>>,
    ) -> Self {
        Self {
            tunnel_id,
            outbound_tx,
            inbound_rx,
            read_leftover: None,
            inbound_done: false,
            registry,
        }
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }
}

impl Drop for TunnelChannel {
    fn drop(&mut self) {
        self.registry.remove(&self.tunnel_id);
    }
}

impl AsyncRead for TunnelChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.inbound_done {
            return Poll::Ready(Ok(()));
        }

        if let Some(leftover) = self.read_leftover.take() {
            return Poll::Ready(Ok(drain_into(&mut self, leftover, buf)));
        }

        match self.inbound_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                if chunk.is_empty() {
                    self.inbound_done = true;
                    return Poll::Ready(Ok(()));
                }
                let _ = drain_into(&mut self, chunk, buf);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => {
                self.inbound_done = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Copy as much of `chunk` into `buf` as fits, stashing the remainder back
/// onto `this.read_leftover` for the next poll.
fn drain_into(this: &mut TunnelChannel, mut chunk: Bytes, buf: &mut ReadBuf<'_>) -> () {
    let n = chunk.len().min(buf.remaining());
    buf.put_slice(&chunk[..n]);
    if n < chunk.len() {
        this.read_leftover = Some(chunk.split_off(n));
    }
}

impl AsyncWrite for TunnelChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        match self.outbound_tx.send(Bytes::copy_from_slice(buf)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tunnel write side closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // Best-effort: if the pump task has already gone away there is
        // nothing left to notify.
        let _ = self.outbound_tx.send(Bytes::new());
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn make_pair() -> (
        TunnelChannel,
        mpsc::UnboundedReceiver<Bytes>,
        mpsc::Sender<Bytes>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let registry = Arc::new(DashMap::new());
        registry.insert("t1".to_string(), inbound_tx.clone());
        let channel = TunnelChannel::new("t1".to_string(), outbound_tx, inbound_rx, registry);
        (channel, outbound_rx, inbound_tx)
    }

    #[tokio::test]
    async fn write_forwards_bytes_to_outbound_channel() {
        let (mut channel, mut outbound_rx, _inbound_tx) = make_pair();
        channel.write_all(b"hello").await.unwrap();
        let sent = outbound_rx.recv().await.unwrap();
        assert_eq!(&sent[..], b"hello");
    }

    #[tokio::test]
    async fn shutdown_sends_empty_marker() {
        let (mut channel, mut outbound_rx, _inbound_tx) = make_pair();
        channel.shutdown().await.unwrap();
        let sent = outbound_rx.recv().await.unwrap();
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn read_returns_pushed_bytes() {
        let (mut channel, _outbound_rx, inbound_tx) = make_pair();
        inbound_tx.send(Bytes::from_static(b"world")).await.unwrap();
        let mut buf = [0u8; 16];
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[tokio::test]
    async fn empty_payload_signals_eof() {
        let (mut channel, _outbound_rx, inbound_tx) = make_pair();
        inbound_tx.send(Bytes::new()).await.unwrap();
        let mut buf = [0u8; 16];
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn read_splits_chunk_larger_than_buffer() {
        let (mut channel, _outbound_rx, inbound_tx) = make_pair();
        inbound_tx.send(Bytes::from_static(b"abcdef")).await.unwrap();
        let mut buf = [0u8; 3];
        let n1 = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n1], b"abc");
        let n2 = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n2], b"def");
    }

    #[tokio::test]
    async fn dropping_channel_removes_it_from_the_registry() {
        let (channel, _outbound_rx, _inbound_tx) = make_pair();
        let registry = channel.registry.clone();
        drop(channel);
        assert!(!registry.contains_key("t1"));
    }
}
