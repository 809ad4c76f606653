//! A mock control-connection server for integration tests.
//!
//! Binds to a random port, accepts TCP connections, and speaks just enough
//! of the real `gw-protocol` framing to exercise a client's handshake and
//! heartbeat paths without standing up a full `gateway-server`.

use std::net::SocketAddr;

use tokio::net::TcpListener;

use gw_protocol::{codec::Priority, HandshakeRequest, HandshakeResponse, Packet, PacketType, StreamProcessor};

pub struct MockControlServer {
    addr: SocketAddr,
    _task: tokio::task::JoinHandle<()>,
}

impl MockControlServer {
    /// Start the mock server, binding to a random available port.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let task = tokio::spawn(async move {
            Self::accept_loop(listener).await;
        });

        Ok(Self { addr, _task: task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn accept_loop(listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    tokio::spawn(async move {
                        let _ = Self::handle_connection(stream).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    /// First message must be a `Handshake`; any other type gets a
    /// `HandshakeResponse::rejected` back, mirroring the first-message
    /// contract every real control connection enforces.
    async fn handle_connection(stream: tokio::net::TcpStream) -> Result<(), gw_protocol::ProtocolError> {
        let proc = StreamProcessor::new(stream, None, None);

        let first = proc.read_packet().await?;
        if first.packet_type != PacketType::Handshake {
            let resp = HandshakeResponse::rejected("expected handshake first");
            let body = serde_json::to_vec(&resp).unwrap_or_default();
            proc.write_packet(Packet::new(PacketType::Handshake, body.into()), Priority::Command)
                .await?;
            return Ok(());
        }

        let _req: HandshakeRequest = serde_json::from_slice(&first.payload)
            .map_err(|e| gw_protocol::ProtocolError::Malformed(e.to_string()))?;
        let resp = HandshakeResponse::ok("");
        let body = serde_json::to_vec(&resp).unwrap_or_default();
        proc.write_packet(Packet::new(PacketType::Handshake, body.into()), Priority::Command)
            .await?;

        loop {
            let pkt = proc.read_packet().await?;
            match pkt.packet_type {
                PacketType::Heartbeat => {
                    proc.write_packet(Packet::heartbeat(), Priority::Heartbeat).await?;
                }
                PacketType::JsonCommand => {
                    // Echo the command back so tests can assert round-tripping.
                    proc.write_packet(
                        Packet::new(PacketType::JsonCommand, pkt.payload),
                        Priority::Command,
                    )
                    .await?;
                }
                _ => {}
            }
        }
    }
}
