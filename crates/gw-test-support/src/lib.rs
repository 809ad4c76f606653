//! Shared test support: a mock control-connection server and client
//! speaking the real `gw-protocol` framing, for integration tests across
//! every other crate in the workspace.

pub mod mock_ws_client;
pub mod mock_ws_server;

pub use mock_ws_client::MockControlClient;
pub use mock_ws_server::MockControlServer;

#[cfg(test)]
mod tests {
    use super::*;
    use gw_protocol::{Packet, PacketType, Priority};

    #[tokio::test]
    async fn server_starts_and_reports_a_real_port() {
        let server = MockControlServer::start().await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn handshake_round_trips_successfully() {
        let server = MockControlServer::start().await.unwrap();
        let mut client = MockControlClient::connect(server.local_addr()).await.unwrap();

        let resp = client.handshake(42, "tok").await.unwrap();
        assert!(resp.success);
    }

    #[tokio::test]
    async fn non_handshake_first_packet_is_rejected() {
        let server = MockControlServer::start().await.unwrap();
        let mut client = MockControlClient::connect(server.local_addr()).await.unwrap();

        client
            .send_packet(Packet::heartbeat(), Priority::Heartbeat)
            .await
            .unwrap();
        let resp_packet = client.recv_packet().await.unwrap();
        assert_eq!(resp_packet.packet_type, PacketType::Handshake);
        let resp: gw_protocol::HandshakeResponse =
            serde_json::from_slice(&resp_packet.payload).unwrap();
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn command_packets_echo_back_after_handshake() {
        let server = MockControlServer::start().await.unwrap();
        let mut client = MockControlClient::connect(server.local_addr()).await.unwrap();
        client.handshake(1, "tok").await.unwrap();

        let payload = br#"{"hello":"world"}"#.to_vec();
        client
            .send_packet(
                Packet::new(PacketType::JsonCommand, payload.clone().into()),
                Priority::Command,
            )
            .await
            .unwrap();
        let echoed = client.recv_packet().await.unwrap();
        assert_eq!(echoed.payload.as_ref(), payload.as_slice());
    }
}
