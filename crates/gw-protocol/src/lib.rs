//! Wire protocol for the gateway's control and tunnel transports: packet
//! framing, the stream processor, commands, handshake, and notifications.

pub mod codec;
pub mod command;
pub mod error;
pub mod handshake;
pub mod notification;
pub mod packet;
pub mod transform;
pub mod tunnel_wire;

pub use codec::{Priority, StreamProcessor, HEARTBEAT_QUEUE_CAP};
pub use command::{Command, CommandType};
pub use error::GatewayError;
pub use handshake::{HandshakeRequest, HandshakeResponse, TransportProtocol};
pub use notification::{Notification, NotificationCategory};
pub use packet::{Packet, PacketType, ProtocolError, V2Extension, V2Flags, MAX_PAYLOAD_LEN};
pub use tunnel_wire::{TunnelCloseBody, TunnelOpenAckBody, TunnelOpenBody};
