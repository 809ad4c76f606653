//! UDP-over-tunnel framing and batching.
//!
//! Datagrams ride the tunnel as `[len:2 BE][bytes]` frames. Outbound
//! (local socket -> tunnel) datagrams are coalesced into a single write of
//! up to `MAX_BATCH_BYTES` (256 KiB), flushed either when full or after
//! `FLUSH_INTERVAL` (20ms) of accumulation — this amortises the per-write
//! syscall cost across a burst of small datagrams without adding more than
//! one flush interval of latency to an isolated one. Inbound reads drain up
//! to `MAX_INBOUND_BATCH` (32) frames per pass before yielding, so one
//! noisy virtual connection can't starve the others sharing the pump loop.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{self, Duration};

use gw_protocol::ProtocolError;

pub const MAX_BATCH_BYTES: usize = 256 * 1024;
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(20);
pub const MAX_INBOUND_BATCH: usize = 32;
const FRAME_HEADER_LEN: usize = 2;
const MAX_DATAGRAM_LEN: usize = u16::MAX as usize;

/// Append one `[len:2][bytes]` frame to `out`.
pub fn encode_frame(payload: &[u8], out: &mut BytesMut) -> Result<(), ProtocolError> {
    if payload.len() > MAX_DATAGRAM_LEN {
        return Err(ProtocolError::TooLarge(payload.len(), MAX_DATAGRAM_LEN));
    }
    out.put_u16(payload.len() as u16);
    out.put_slice(payload);
    Ok(())
}

/// Pull one complete frame out of `buf`, if present. Leaves a partial
/// trailing frame untouched for the next read to complete.
pub fn try_decode_frame(buf: &mut BytesMut) -> Option<Bytes> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < FRAME_HEADER_LEN + len {
        return None;
    }
    buf.advance(FRAME_HEADER_LEN);
    Some(buf.split_to(len).freeze())
}

/// Accumulates outbound datagrams into batched wire frames, flushing once
/// `MAX_BATCH_BYTES` is reached.
pub struct OutboundBatcher {
    buf: BytesMut,
}

impl OutboundBatcher {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_BATCH_BYTES),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns `true` if the batch has hit capacity and should be flushed
    /// immediately rather than waiting for the flush timer.
    pub fn push(&mut self, payload: &[u8]) -> Result<bool, ProtocolError> {
        encode_frame(payload, &mut self.buf)?;
        Ok(self.buf.len() >= MAX_BATCH_BYTES)
    }

    pub fn take(&mut self) -> Bytes {
        std::mem::replace(&mut self.buf, BytesMut::with_capacity(MAX_BATCH_BYTES)).freeze()
    }
}

impl Default for OutboundBatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Read datagrams from `socket` and batch-write them framed to `writer`
/// until the socket errors or the task is cancelled.
pub async fn run_outbound<W>(socket: &tokio::net::UdpSocket, mut writer: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batcher = OutboundBatcher::new();
    let mut datagram = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let flush_deadline = time::sleep(FLUSH_INTERVAL);
        tokio::select! {
            biased;
            recv = socket.recv(&mut datagram) => {
                let n = recv?;
                let full = batcher
                    .push(&datagram[..n])
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
                if full {
                    let batch = batcher.take();
                    writer.write_all(&batch).await?;
                }
            }
            _ = flush_deadline => {
                if !batcher.is_empty() {
                    let batch = batcher.take();
                    writer.write_all(&batch).await?;
                }
            }
        }
    }
}

/// Read framed datagrams from `reader`, up to `MAX_INBOUND_BATCH` per pass,
/// and send each to `target` over `socket`.
pub async fn run_inbound<R>(
    mut reader: R,
    socket: &tokio::net::UdpSocket,
    target: std::net::SocketAddr,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(MAX_BATCH_BYTES);
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut sent = 0;
        while sent < MAX_INBOUND_BATCH {
            match try_decode_frame(&mut buf) {
                Some(frame) => {
                    socket.send_to(&frame, target).await?;
                    sent += 1;
                }
                None => break,
            }
        }
    }
}
