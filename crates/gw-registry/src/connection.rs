//! A single client's control connection, as tracked by the registry.
//!
//! The registry never touches a socket directly — it hands commands to a
//! control connection's `outbound` channel, and whatever owns the real
//! socket (the per-connection read/write task) drains it and frames the
//! packets onto the wire. This mirrors the teacher's `broadcast::Sender`
//! handle-in-a-registry pattern, just with an mpsc per connection instead
//! of a fanout broadcast.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use gw_protocol::{HandshakeRequest, Packet, TransportProtocol};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct ControlConnection {
    pub client_id: String,
    pub conn_id: String,
    pub protocol: TransportProtocol,
    authenticated: AtomicBool,
    connected_at_ms: i64,
    last_heartbeat_ms: AtomicI64,
    outbound: mpsc::Sender<Packet>,
}

impl ControlConnection {
    pub fn new(
        client_id: impl Into<String>,
        conn_id: impl Into<String>,
        protocol: TransportProtocol,
        outbound: mpsc::Sender<Packet>,
    ) -> Self {
        let now = now_millis();
        Self {
            client_id: client_id.into(),
            conn_id: conn_id.into(),
            protocol,
            authenticated: AtomicBool::new(false),
            connected_at_ms: now,
            last_heartbeat_ms: AtomicI64::new(now),
            outbound,
        }
    }

    pub fn from_handshake(
        conn_id: impl Into<String>,
        req: &HandshakeRequest,
        outbound: mpsc::Sender<Packet>,
    ) -> Self {
        Self::new(req.client_id.to_string(), conn_id, req.protocol, outbound)
    }

    pub fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn touch_heartbeat(&self) {
        self.last_heartbeat_ms.store(now_millis(), Ordering::SeqCst);
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        let last = self.last_heartbeat_ms.load(Ordering::SeqCst);
        now_millis() - last > timeout.as_millis() as i64
    }

    pub fn connected_at_ms(&self) -> i64 {
        self.connected_at_ms
    }

    /// Enqueue a packet for this connection's writer task. Fails silently
    /// (logged by the caller) if the writer task has already exited.
    pub async fn send(&self, packet: Packet) -> Result<(), mpsc::error::SendError<Packet>> {
        self.outbound.send(packet).await
    }

    pub fn try_send(&self, packet: Packet) -> Result<(), mpsc::error::TrySendError<Packet>> {
        self.outbound.try_send(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> (ControlConnection, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(8);
        (
            ControlConnection::new("client-1", "sess-1", TransportProtocol::Tcp, tx),
            rx,
        )
    }

    #[test]
    fn starts_unauthenticated_and_fresh() {
        let (conn, _rx) = conn();
        assert!(!conn.is_authenticated());
        assert!(!conn.is_stale(Duration::from_secs(60)));
    }

    #[test]
    fn mark_authenticated_sticks() {
        let (conn, _rx) = conn();
        conn.mark_authenticated();
        assert!(conn.is_authenticated());
    }

    #[tokio::test]
    async fn send_reaches_the_outbound_channel() {
        let (conn, mut rx) = conn();
        conn.send(Packet::heartbeat()).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.packet_type, gw_protocol::PacketType::Heartbeat);
    }
}
