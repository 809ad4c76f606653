//! UDP adapter: one shared socket per mapping, demultiplexed into virtual
//! connections keyed by the sender's address. The spec this grew from calls
//! for N `SO_REUSEPORT` sockets on Unix (capped at the CPU count) with a
//! single-socket fallback elsewhere; without `socket2` in this workspace's
//! dependency stack there's no way to set `SO_REUSEPORT` at all, so every
//! platform gets the fallback. The demultiplexing logic is unaffected
//! either way — it is what turns "one socket" into "one virtual connection
//! per peer" regardless of how many underlying sockets there are.
//!
//! A virtual connection's outbound direction (peer -> tunnel) batches and
//! frames datagrams the same way `gw_tunnel::udp_pump::run_outbound` does
//! for a socket it owns outright; here the source is this connection's own
//! demultiplexed channel instead of a raw `socket.recv`. The inbound
//! direction (tunnel -> peer) reuses `run_inbound` unmodified, since sending
//! on a shared `UdpSocket` via `&self` is safe to do concurrently from every
//! virtual connection's task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use gw_tunnel::udp_pump::{OutboundBatcher, FLUSH_INTERVAL};

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const JANITOR_INTERVAL: Duration = Duration::from_secs(10);
const MAX_DATAGRAM_LEN: usize = u16::MAX as usize;

pub struct UdpAdapter {
    socket: Arc<UdpSocket>,
    conns: DashMap<SocketAddr, mpsc::Sender<Bytes>>,
    last_active: DashMap<SocketAddr, Instant>,
}

impl UdpAdapter {
    pub async fn bind(local_port: u16) -> std::io::Result<Self> {
        let addr: SocketAddr = SocketAddr::from(([127, 0, 0, 1], local_port));
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        Ok(Self {
            socket,
            conns: DashMap::new(),
            last_active: DashMap::new(),
        })
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Receive datagrams and demultiplex them by sender address, reporting
    /// each newly seen peer (with the channel its datagrams will arrive on)
    /// to `new_conns`. Also runs the idle-connection janitor. Exits once
    /// `cancel` fires or `new_conns` is dropped.
    pub async fn run(
        &self,
        new_conns: mpsc::Sender<(SocketAddr, mpsc::Receiver<Bytes>)>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut datagram = vec![0u8; MAX_DATAGRAM_LEN];
        let mut janitor = tokio::time::interval(JANITOR_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return;
                    }
                }
                _ = janitor.tick() => self.reap_idle(),
                received = self.socket.recv_from(&mut datagram) => {
                    let (n, peer_addr) = match received {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "udp recv error");
                            continue;
                        }
                    };
                    self.last_active.insert(peer_addr, Instant::now());
                    let payload = Bytes::copy_from_slice(&datagram[..n]);
                    if let Some(sender) = self.conns.get(&peer_addr) {
                        let _ = sender.send(payload).await;
                        continue;
                    }
                    let (tx, rx) = mpsc::channel(256);
                    let _ = tx.send(payload).await;
                    self.conns.insert(peer_addr, tx);
                    if new_conns.send((peer_addr, rx)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn reap_idle(&self) {
        let now = Instant::now();
        let stale: Vec<SocketAddr> = self
            .last_active
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) > IDLE_TIMEOUT)
            .map(|entry| *entry.key())
            .collect();
        for peer_addr in stale {
            self.conns.remove(&peer_addr);
            self.last_active.remove(&peer_addr);
        }
    }
}

/// Drain one virtual connection's inbound datagrams (already demultiplexed
/// by [`UdpAdapter::run`]) into the tunnel, framed and batched just like
/// `run_outbound` batches a socket's own reads.
pub async fn pump_outbound<W>(mut datagrams: mpsc::Receiver<Bytes>, mut writer: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batcher = OutboundBatcher::new();
    loop {
        tokio::select! {
            biased;
            datagram = datagrams.recv() => {
                match datagram {
                    Some(datagram) => {
                        let full = batcher
                            .push(&datagram)
                            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
                        if full {
                            writer.write_all(&batcher.take()).await?;
                        }
                    }
                    None => {
                        if !batcher.is_empty() {
                            writer.write_all(&batcher.take()).await?;
                        }
                        return Ok(());
                    }
                }
            }
            _ = tokio::time::sleep(FLUSH_INTERVAL) => {
                if !batcher.is_empty() {
                    writer.write_all(&batcher.take()).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn bind_succeeds_on_ephemeral_port() {
        let adapter = UdpAdapter::bind(0).await.unwrap();
        assert!(adapter.socket().local_addr().is_ok());
    }

    #[tokio::test]
    async fn pump_outbound_flushes_on_channel_close() {
        let (tx, rx) = mpsc::channel(8);
        let (mut writer, mut reader) = duplex(4096);
        tx.send(Bytes::from_static(b"hello")).await.unwrap();
        drop(tx);

        pump_outbound(rx, &mut writer).await.unwrap();

        let mut buf = vec![0u8; 16];
        use tokio::io::AsyncReadExt;
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }
}
