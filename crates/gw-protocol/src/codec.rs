//! The stream processor: wraps a bidirectional byte transport, applies the
//! transform stack, and exposes a priority write queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::packet::{Packet, ProtocolError, MAX_PAYLOAD_LEN};
use crate::transform::{Compressor, Encryptor};

/// Priority bucket for a queued write. Strict ordering: Command > Normal >
/// Heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Heartbeat,
    Normal,
    Command,
}

/// The heartbeat bucket is bounded; enqueuing past this capacity drops the
/// oldest queued heartbeat rather than blocking the sender.
pub const HEARTBEAT_QUEUE_CAP: usize = 3;

struct WriteQueues {
    command: VecDeque<BytesMut>,
    normal: VecDeque<BytesMut>,
    heartbeat: VecDeque<BytesMut>,
    closed: bool,
}

impl WriteQueues {
    fn new() -> Self {
        Self {
            command: VecDeque::new(),
            normal: VecDeque::new(),
            heartbeat: VecDeque::new(),
            closed: false,
        }
    }

    fn push(&mut self, priority: Priority, frame: BytesMut) {
        match priority {
            Priority::Command => self.command.push_back(frame),
            Priority::Normal => self.normal.push_back(frame),
            Priority::Heartbeat => {
                if self.heartbeat.len() >= HEARTBEAT_QUEUE_CAP {
                    self.heartbeat.pop_front();
                }
                self.heartbeat.push_back(frame);
            }
        }
    }

    fn pop(&mut self) -> Option<BytesMut> {
        self.command
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.heartbeat.pop_front())
    }
}

struct SharedQueue {
    queues: Mutex<WriteQueues>,
    notify: Notify,
}

struct ReadState<S> {
    reader: ReadHalf<S>,
    buf: BytesMut,
}

/// A bidirectional packet transport: a mutex-guarded reader half behind
/// `read_packet`, and a background task draining the priority write queue
/// onto the writer half. Guarding the reader with a mutex (rather than
/// requiring `&mut self`) lets a single `Arc<StreamProcessor<S>>` be handed
/// to both the task driving the read loop and any other task that only
/// ever needs to call `write_packet` — there is never more than one reader
/// in practice, but the type doesn't have to assume that.
pub struct StreamProcessor<S> {
    read_state: Mutex<ReadState<S>>,
    compressor: Option<Arc<dyn Compressor>>,
    encryptor: Option<Arc<dyn Encryptor>>,
    shared: Arc<SharedQueue>,
    stream_mode: Arc<AtomicBool>,
    max_payload_len: usize,
}

impl<S> StreamProcessor<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(
        stream: S,
        compressor: Option<Arc<dyn Compressor>>,
        encryptor: Option<Arc<dyn Encryptor>>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let shared = Arc::new(SharedQueue {
            queues: Mutex::new(WriteQueues::new()),
            notify: Notify::new(),
        });
        spawn_drain_task(writer, shared.clone());

        Self {
            read_state: Mutex::new(ReadState {
                reader,
                buf: BytesMut::new(),
            }),
            compressor,
            encryptor,
            shared,
            stream_mode: Arc::new(AtomicBool::new(false)),
            max_payload_len: MAX_PAYLOAD_LEN,
        }
    }

    /// Switch between packet-framed mode and raw byte-stream mode. Once
    /// enabled, `read_packet` refuses further calls — callers must use
    /// the underlying transport directly (used by long-poll-style
    /// transport variants, not by the raw TCP transport this gateway uses
    /// day to day).
    pub fn set_stream_mode(&self, on: bool) {
        self.stream_mode.store(on, Ordering::SeqCst);
    }

    pub fn is_stream_mode(&self) -> bool {
        self.stream_mode.load(Ordering::SeqCst)
    }

    /// Enqueue a packet for writing at the given priority. Returns once
    /// the packet has been transformed, framed, and queued — not once it
    /// has actually reached the wire. Never blocks on queue depth.
    pub async fn write_packet(&self, mut pkt: Packet, priority: Priority) -> Result<(), ProtocolError> {
        if let Some(compressor) = &self.compressor {
            if pkt.compressed {
                pkt.payload = Bytes::from(compressor.compress(&pkt.payload)?);
            }
        }
        if let Some(encryptor) = &self.encryptor {
            if pkt.encrypted {
                pkt.payload = Bytes::from(encryptor.encrypt(&pkt.payload)?);
            }
        }

        if pkt.payload.len() > self.max_payload_len {
            return Err(ProtocolError::TooLarge(
                pkt.payload.len(),
                self.max_payload_len,
            ));
        }

        let frame = pkt.encode();
        // The lock is only ever held for the duration of a queue push or
        // pop — never across an await point beyond acquiring it here.
        let mut guard = self.shared.queues.lock().await;
        if guard.closed {
            return Err(ProtocolError::Closed);
        }
        guard.push(priority, frame);
        drop(guard);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Read exactly one packet, applying the inverse transform stack.
    ///
    /// Takes `&self`: the read half lives behind an internal mutex, so
    /// there is no need for callers to hold this processor mutably just to
    /// drive its read loop.
    pub async fn read_packet(&self) -> Result<Packet, ProtocolError> {
        if self.is_stream_mode() {
            return Err(ProtocolError::Malformed(
                "read_packet called while in stream mode".into(),
            ));
        }

        let mut state = self.read_state.lock().await;

        let type_byte = self.read_exact_buf(&mut state, 1).await?[0];
        let base_type = type_byte & 0x0F;
        let carries_tunnel_id = matches!(base_type, 3..=6);
        let has_v2 = type_byte & 0x40 != 0;

        let mut header = BytesMut::new();
        header.extend_from_slice(&[type_byte]);

        if carries_tunnel_id {
            let len_byte = self.read_exact_buf(&mut state, 1).await?;
            header.extend_from_slice(&len_byte);
            let id_len = len_byte[0] as usize;
            if id_len > 0 {
                header.extend_from_slice(&self.read_exact_buf(&mut state, id_len).await?);
            }
        }

        if has_v2 {
            header.extend_from_slice(&self.read_exact_buf(&mut state, 1 + 8 + 8).await?);
        }

        let len_bytes = self.read_exact_buf(&mut state, 4).await?;
        header.extend_from_slice(&len_bytes);
        let payload_len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;
        if payload_len > self.max_payload_len {
            return Err(ProtocolError::TooLarge(payload_len, self.max_payload_len));
        }

        let payload = if payload_len > 0 {
            self.read_exact_buf(&mut state, payload_len).await?
        } else {
            Vec::new()
        };
        drop(state);

        let mut full = header;
        full.extend_from_slice(&payload);
        let mut pkt = Packet::decode(full.freeze())?;

        if pkt.encrypted {
            let encryptor = self
                .encryptor
                .as_ref()
                .ok_or_else(|| ProtocolError::TransformFailure("no encryptor configured".into()))?;
            pkt.payload = Bytes::from(encryptor.decrypt(&pkt.payload)?);
        }
        if pkt.compressed {
            let compressor = self
                .compressor
                .as_ref()
                .ok_or_else(|| ProtocolError::TransformFailure("no compressor configured".into()))?;
            pkt.payload = Bytes::from(compressor.decompress(&pkt.payload)?);
        }

        Ok(pkt)
    }

    async fn read_exact_buf(
        &self,
        state: &mut ReadState<S>,
        n: usize,
    ) -> Result<Vec<u8>, ProtocolError> {
        if state.buf.len() < n {
            let need = n - state.buf.len();
            let mut tmp = vec![0u8; need];
            state.reader.read_exact(&mut tmp).await?;
            state.buf.extend_from_slice(&tmp);
        }
        let out = state.buf.split_to(n);
        Ok(out.to_vec())
    }

    pub async fn read_raw(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        if !self.is_stream_mode() {
            return Err(ProtocolError::Malformed(
                "read_raw called outside stream mode".into(),
            ));
        }
        let mut state = self.read_state.lock().await;
        if !state.buf.is_empty() {
            let n = state.buf.len().min(buf.len());
            let chunk = state.buf.split_to(n);
            buf[..n].copy_from_slice(&chunk);
            return Ok(n);
        }
        Ok(state.reader.read(buf).await?)
    }

    /// Signal the drain task to stop once its queue is empty.
    pub async fn close(&self) {
        let mut guard = self.shared.queues.lock().await;
        guard.closed = true;
        drop(guard);
        self.shared.notify.notify_one();
    }
}

fn spawn_drain_task<W>(mut writer: WriteHalf<W>, shared: Arc<SharedQueue>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        loop {
            let frame = {
                let mut guard = shared.queues.lock().await;
                match guard.pop() {
                    Some(frame) => Some(frame),
                    None if guard.closed => None,
                    None => {
                        drop(guard);
                        shared.notify.notified().await;
                        continue;
                    }
                }
            };

            let Some(frame) = frame else {
                debug!("stream processor drain task exiting: closed and empty");
                break;
            };

            if let Err(e) = writer.write_all(&frame).await {
                warn!(error = %e, "stream processor write failed, stopping drain task");
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use tokio::io::duplex;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (client, server) = duplex(64 * 1024);
        let client_proc = StreamProcessor::new(client, None, None);
        let server_proc = StreamProcessor::new(server, None, None);

        let pkt = Packet::new(PacketType::Handshake, Bytes::from_static(b"hello"));
        client_proc.write_packet(pkt, Priority::Normal).await.unwrap();

        let got = server_proc.read_packet().await.unwrap();
        assert_eq!(&got.payload[..], b"hello");
    }

    #[tokio::test]
    async fn heartbeat_bucket_drops_oldest_on_overflow() {
        let (client, _server) = duplex(8); // tiny buffer keeps the drain task stalled mid-write
        let processor = StreamProcessor::new(client, None, None);

        // Fill past capacity before the drain task can make progress.
        for i in 0..(HEARTBEAT_QUEUE_CAP as u8 + 2) {
            let pkt = Packet::new(PacketType::Heartbeat, Bytes::from(vec![i]));
            processor.write_packet(pkt, Priority::Heartbeat).await.unwrap();
        }

        let guard = processor.shared.queues.lock().await;
        assert!(guard.heartbeat.len() <= HEARTBEAT_QUEUE_CAP);
    }

    #[tokio::test]
    async fn command_priority_drains_before_normal_and_heartbeat() {
        let (client, server) = duplex(64 * 1024);
        let processor = StreamProcessor::new(client, None, None);
        let server_proc = StreamProcessor::new(server, None, None);

        // Pause the drain by locking the queue's mutex manually is not
        // possible from the test; instead enqueue fast enough that all
        // three are queued before the drain task runs once.
        processor
            .write_packet(
                Packet::new(PacketType::Heartbeat, Bytes::new()),
                Priority::Heartbeat,
            )
            .await
            .unwrap();
        processor
            .write_packet(
                Packet::new(PacketType::Handshake, Bytes::from_static(b"normal")),
                Priority::Normal,
            )
            .await
            .unwrap();
        processor
            .write_packet(
                Packet::new(PacketType::JsonCommand, Bytes::from_static(b"cmd")),
                Priority::Command,
            )
            .await
            .unwrap();

        let first = server_proc.read_packet().await.unwrap();
        assert_eq!(&first.payload[..], b"cmd");
    }
}
