//! Packet framing.
//!
//! Wire format (V1): `[type:1][tunnel_id_len:1][tunnel_id:N]?[payload_len:4 BE][payload:N]`.
//! The `tunnel_id` block is present iff `packet_type` is tunnel-carrying.
//!
//! Wire format (V2): when the type byte's `V2_EXTENSION` bit is set, a block
//! `[v2_flags:1][seq:8 BE][ack:8 BE]` is inserted immediately before the
//! payload-length field. A packet with that bit clear is byte-identical to
//! V1 — readers that don't understand V2 semantics can still frame it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum payload size accepted on the wire before a connection is failed.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet too large: {0} bytes exceeds max {1}")]
    TooLarge(usize, usize),
    #[error("truncated frame")]
    Truncated,
    #[error("unknown packet type byte: {0:#x}")]
    UnknownType(u8),
    #[error("invalid tunnel id: {0}")]
    InvalidTunnelId(String),
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("transform failed: {0}")]
    TransformFailure(String),
    #[error("stream closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The base packet type. Compression/encryption/V2-extension are carried as
/// separate bits on the wire type byte, not as additional variants here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Handshake,
    JsonCommand,
    Heartbeat,
    TunnelOpen,
    TunnelOpenAck,
    TunnelData,
    TunnelClose,
}

impl PacketType {
    const fn base_bits(self) -> u8 {
        match self {
            PacketType::Handshake => 0,
            PacketType::JsonCommand => 1,
            PacketType::Heartbeat => 2,
            PacketType::TunnelOpen => 3,
            PacketType::TunnelOpenAck => 4,
            PacketType::TunnelData => 5,
            PacketType::TunnelClose => 6,
        }
    }

    fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        Ok(match bits {
            0 => PacketType::Handshake,
            1 => PacketType::JsonCommand,
            2 => PacketType::Heartbeat,
            3 => PacketType::TunnelOpen,
            4 => PacketType::TunnelOpenAck,
            5 => PacketType::TunnelData,
            6 => PacketType::TunnelClose,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }

    /// Whether packets of this type carry a `tunnel_id` block.
    pub const fn carries_tunnel_id(self) -> bool {
        matches!(
            self,
            PacketType::TunnelOpen
                | PacketType::TunnelOpenAck
                | PacketType::TunnelData
                | PacketType::TunnelClose
        )
    }
}

const FLAG_COMPRESSED: u8 = 0x10;
const FLAG_ENCRYPTED: u8 = 0x20;
const FLAG_V2: u8 = 0x40;
const BASE_TYPE_MASK: u8 = 0x0F;

/// SYN/FIN/ACK/RST/Migrate/Buffer flags carried in the V2 extension block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct V2Flags(pub u8);

impl V2Flags {
    pub const SYN: u8 = 0x01;
    pub const FIN: u8 = 0x02;
    pub const ACK: u8 = 0x04;
    pub const RST: u8 = 0x08;
    pub const MIGRATE: u8 = 0x10;
    pub const BUFFER: u8 = 0x20;

    pub fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V2Extension {
    pub flags: V2Flags,
    pub seq: u64,
    pub ack: u64,
}

/// A framed message on a control or tunnel transport.
///
/// `payload` always holds the bytes as they travel on the wire for this
/// packet — i.e. after compression/encryption have already been applied by
/// the stream processor's transform stack. `compressed`/`encrypted` record
/// which transforms were applied so the reading side's stack can invert
/// them in the right order.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    pub compressed: bool,
    pub encrypted: bool,
    pub tunnel_id: Option<String>,
    pub payload: Bytes,
    pub v2: Option<V2Extension>,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: Bytes) -> Self {
        Self {
            packet_type,
            compressed: false,
            encrypted: false,
            tunnel_id: None,
            payload,
            v2: None,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(PacketType::Heartbeat, Bytes::new())
    }

    pub fn with_tunnel_id(mut self, tunnel_id: impl Into<String>) -> Self {
        self.tunnel_id = Some(tunnel_id.into());
        self
    }

    pub fn with_v2(mut self, v2: V2Extension) -> Self {
        self.v2 = Some(v2);
        self
    }

    fn type_byte(&self) -> u8 {
        let mut b = self.packet_type.base_bits() & BASE_TYPE_MASK;
        if self.compressed {
            b |= FLAG_COMPRESSED;
        }
        if self.encrypted {
            b |= FLAG_ENCRYPTED;
        }
        if self.v2.is_some() {
            b |= FLAG_V2;
        }
        b
    }

    /// Encode this packet into its wire representation. Does not itself
    /// validate the max-size invariant — callers check that before writing.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(self.type_byte());

        if self.packet_type.carries_tunnel_id() {
            let id = self.tunnel_id.as_deref().unwrap_or_default();
            let bytes = id.as_bytes();
            // Wire format reserves one length byte for the tunnel id.
            let len = bytes.len().min(u8::MAX as usize) as u8;
            buf.put_u8(len);
            buf.extend_from_slice(&bytes[..len as usize]);
        }

        if let Some(v2) = self.v2 {
            buf.put_u8(v2.flags.0);
            buf.put_u64(v2.seq);
            buf.put_u64(v2.ack);
        }

        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a single packet from a buffer that contains exactly one frame
    /// (or more — trailing bytes are ignored by the caller, which is
    /// expected to have already split the frame out using
    /// [`peek_frame_len`]).
    pub fn decode(mut buf: impl Buf) -> Result<Self, ProtocolError> {
        if buf.remaining() < 1 {
            return Err(ProtocolError::Truncated);
        }
        let type_byte = buf.get_u8();
        let packet_type = PacketType::from_bits(type_byte & BASE_TYPE_MASK)?;
        let compressed = type_byte & FLAG_COMPRESSED != 0;
        let encrypted = type_byte & FLAG_ENCRYPTED != 0;
        let has_v2 = type_byte & FLAG_V2 != 0;

        let tunnel_id = if packet_type.carries_tunnel_id() {
            if buf.remaining() < 1 {
                return Err(ProtocolError::Truncated);
            }
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return Err(ProtocolError::Truncated);
            }
            let mut raw = vec![0u8; len];
            buf.copy_to_slice(&mut raw);
            Some(
                String::from_utf8(raw)
                    .map_err(|e| ProtocolError::InvalidTunnelId(e.to_string()))?,
            )
        } else {
            None
        };

        let v2 = if has_v2 {
            if buf.remaining() < 1 + 8 + 8 {
                return Err(ProtocolError::Truncated);
            }
            let flags = V2Flags(buf.get_u8());
            let seq = buf.get_u64();
            let ack = buf.get_u64();
            Some(V2Extension { flags, seq, ack })
        } else {
            None
        };

        if buf.remaining() < 4 {
            return Err(ProtocolError::Truncated);
        }
        let payload_len = buf.get_u32() as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::TooLarge(payload_len, MAX_PAYLOAD_LEN));
        }
        if buf.remaining() < payload_len {
            return Err(ProtocolError::Truncated);
        }
        let mut payload = vec![0u8; payload_len];
        buf.copy_to_slice(&mut payload);

        Ok(Packet {
            packet_type,
            compressed,
            encrypted,
            tunnel_id,
            payload: Bytes::from(payload),
            v2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_v1_heartbeat() {
        let pkt = Packet::heartbeat();
        let encoded = pkt.encode();
        let decoded = Packet::decode(encoded.freeze()).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Heartbeat);
        assert!(decoded.payload.is_empty());
        assert!(decoded.v2.is_none());
    }

    #[test]
    fn round_trip_tunnel_data_with_id() {
        let pkt = Packet::new(PacketType::TunnelData, Bytes::from_static(b"hello"))
            .with_tunnel_id("tcp-tunnel-123-8080");
        let encoded = pkt.encode();
        let decoded = Packet::decode(encoded.freeze()).unwrap();
        assert_eq!(decoded.tunnel_id.as_deref(), Some("tcp-tunnel-123-8080"));
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[test]
    fn round_trip_v2_extension() {
        let pkt = Packet::new(PacketType::TunnelData, Bytes::from_static(b"abc"))
            .with_tunnel_id("t1")
            .with_v2(V2Extension {
                flags: V2Flags(V2Flags::SYN | V2Flags::ACK),
                seq: 7,
                ack: 3,
            });
        let encoded = pkt.encode();
        let decoded = Packet::decode(encoded.freeze()).unwrap();
        let v2 = decoded.v2.expect("v2 extension present");
        assert!(v2.flags.has(V2Flags::SYN));
        assert!(v2.flags.has(V2Flags::ACK));
        assert!(!v2.flags.has(V2Flags::FIN));
        assert_eq!(v2.seq, 7);
        assert_eq!(v2.ack, 3);
    }

    #[test]
    fn compressed_and_encrypted_flags_round_trip() {
        let mut pkt = Packet::new(PacketType::JsonCommand, Bytes::from_static(b"{}"));
        pkt.compressed = true;
        pkt.encrypted = true;
        let encoded = pkt.encode();
        let decoded = Packet::decode(encoded.freeze()).unwrap();
        assert!(decoded.compressed);
        assert!(decoded.encrypted);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let pkt = Packet::new(PacketType::Handshake, Bytes::from_static(b"hello world"));
        let mut encoded = pkt.encode();
        encoded.truncate(encoded.len() - 3);
        let err = Packet::decode(encoded.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(PacketType::Heartbeat.base_bits());
        buf.put_u32((MAX_PAYLOAD_LEN + 1) as u32);
        let err = Packet::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::TooLarge(_, _)));
    }
}
