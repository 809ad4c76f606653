//! A minimal client speaking the real `gw-protocol` framing, for driving a
//! `gateway-server` (or `MockControlServer`) from an integration test.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use gw_protocol::{codec::Priority, HandshakeRequest, HandshakeResponse, Packet, StreamProcessor, TransportProtocol};

pub struct MockControlClient {
    proc: StreamProcessor<TcpStream>,
}

impl MockControlClient {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            proc: StreamProcessor::new(stream, None, None),
        })
    }

    pub async fn handshake(
        &mut self,
        client_id: i64,
        token: &str,
    ) -> Result<HandshakeResponse, Box<dyn std::error::Error + Send + Sync>> {
        let req = HandshakeRequest {
            client_id,
            protocol: TransportProtocol::Tcp,
            token: token.to_string(),
        };
        let body = serde_json::to_vec(&req)?;
        self.proc
            .write_packet(
                Packet::new(gw_protocol::PacketType::Handshake, body.into()),
                Priority::Command,
            )
            .await?;
        let resp_packet = self.proc.read_packet().await?;
        let resp: HandshakeResponse = serde_json::from_slice(&resp_packet.payload)?;
        Ok(resp)
    }

    pub async fn send_packet(&mut self, packet: Packet, priority: Priority) -> Result<(), gw_protocol::ProtocolError> {
        self.proc.write_packet(packet, priority).await
    }

    pub async fn recv_packet(&mut self) -> Result<Packet, gw_protocol::ProtocolError> {
        self.proc.read_packet().await
    }
}
