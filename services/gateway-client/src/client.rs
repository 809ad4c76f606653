//! `ClientSurface`: owns the single control connection to `gateway-server`,
//! keeps it alive across reconnects, and is the one place in this process
//! that knows how to speak the wire protocol. Everything else — mapping
//! handlers, protocol adapters, the notification dispatcher — goes through
//! this surface rather than touching a `StreamProcessor` directly.
//!
//! Tunnels and round-trip commands both correlate request/reply by reusing
//! an id the reply echoes back: `tunnel_id` for tunnel packets, `command_id`
//! for `JsonCommand` packets, the same convention the server's mapping-list
//! reply already uses.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use gw_dispatch::NotificationDispatcher;
use gw_protocol::{
    Command, CommandType, GatewayError, HandshakeRequest, HandshakeResponse, Notification,
    Packet, PacketType, Priority, StreamProcessor, TunnelCloseBody, TunnelOpenAckBody,
    TunnelOpenBody, MAX_PAYLOAD_LEN,
};
use gw_tunnel::reason::CloseReason;

use crate::config::{ClientConfig, MappingConfig};
use crate::tunnel_channel::TunnelChannel;

type ControlStream = StreamProcessor<TcpStream>;

/// A command pushed by the server that the rest of the client (the mapping
/// supervisor, mainly) needs to act on rather than `ClientSurface` handling
/// it internally.
#[derive(Debug, Clone)]
pub enum InboundCommand {
    MappingCreate(Command),
    MappingUpdate(Command),
    MappingDelete(Command),
    Kick { reason: String },
    Other(Command),
}

/// A tunnel the server asked this client to terminate, handed to whatever
/// dials the real target (a mapping's adapter).
pub struct OpenedTunnel {
    pub tunnel_id: String,
    pub mapping_id: String,
    pub channel: TunnelChannel,
    pub cancel: watch::Receiver<bool>,
    /// Set when the peer told us where to connect (the egress side of a
    /// server-initiated tunnel); `None` for tunnels this client dialed
    /// itself, where the caller already knows its own mapping's target.
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UserQuota {
    pub used_bytes: u64,
    pub limit_bytes: u64,
    pub used_connections: u32,
    pub limit_connections: u32,
}

#[derive(Debug, Clone)]
pub struct ClientContext {
    pub client_id: i64,
    pub server_addr: String,
    pub connected: bool,
}

struct Inner {
    cfg: ClientConfig,
    client_id: AtomicI64,
    conn: Mutex<Option<Arc<ControlStream>>>,
    pending_tunnel_acks: DashMap<String, oneshot::Sender<Result<(), String>>>,
    pending_commands: DashMap<String, oneshot::Sender<Command>>,
    tunnel_inbound: Arc<DashMap<String, mpsc::Sender<Bytes>>>,
    tunnel_cancels: DashMap<String, watch::Sender<bool>>,
    dispatcher: Arc<NotificationDispatcher>,
    inbound_commands: mpsc::UnboundedSender<InboundCommand>,
    incoming_tunnels: mpsc::UnboundedSender<OpenedTunnel>,
}

/// Cheaply `Clone`-able handle to the control connection; every clone shares
/// the same connection state.
#[derive(Clone)]
pub struct ClientSurface {
    inner: Arc<Inner>,
}

impl ClientSurface {
    /// Build a surface and the two channels its packet-dispatch loop feeds:
    /// pushed commands the caller must react to, and tunnels opened on this
    /// client's behalf by a peer.
    pub fn new(
        cfg: ClientConfig,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<InboundCommand>,
        mpsc::UnboundedReceiver<OpenedTunnel>,
    ) {
        let (inbound_commands, inbound_commands_rx) = mpsc::unbounded_channel();
        let (incoming_tunnels, incoming_tunnels_rx) = mpsc::unbounded_channel();

        let client_id = cfg.client_id;
        let inner = Arc::new(Inner {
            cfg,
            client_id: AtomicI64::new(client_id),
            conn: Mutex::new(None),
            pending_tunnel_acks: DashMap::new(),
            pending_commands: DashMap::new(),
            tunnel_inbound: Arc::new(DashMap::new()),
            tunnel_cancels: DashMap::new(),
            dispatcher,
            inbound_commands,
            incoming_tunnels,
        });

        (Self { inner }, inbound_commands_rx, incoming_tunnels_rx)
    }

    pub fn client_id(&self) -> i64 {
        self.inner.client_id.load(Ordering::SeqCst)
    }

    pub async fn get_context(&self) -> ClientContext {
        ClientContext {
            client_id: self.client_id(),
            server_addr: self.inner.cfg.server_addr.clone(),
            connected: self.inner.conn.lock().await.is_some(),
        }
    }

    /// Connect, handshake, and pump the control connection forever,
    /// reconnecting with the configured interval whenever it drops. Meant
    /// to be spawned once and left running for the process lifetime.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.connect_once().await {
                Ok(()) => debug!("control connection closed, reconnecting"),
                Err(e) => warn!(error = %e, "control connection attempt failed"),
            }
            *self.inner.conn.lock().await = None;
            tokio::time::sleep(self.inner.cfg.reconnect_interval).await;
        }
    }

    async fn connect_once(self: &Arc<Self>) -> Result<(), GatewayError> {
        let cfg = &self.inner.cfg;
        let stream = tokio::time::timeout(cfg.connect_timeout, TcpStream::connect(&cfg.server_addr))
            .await
            .map_err(|_| GatewayError::Timeout)?
            .map_err(GatewayError::NetworkError)?;
        stream.set_nodelay(true).map_err(GatewayError::NetworkError)?;

        let processor = Arc::new(StreamProcessor::new(stream, None, None));
        self.handshake(&processor).await?;
        *self.inner.conn.lock().await = Some(processor.clone());
        info!(server = %cfg.server_addr, client_id = self.client_id(), "control connection established");

        let heartbeat = tokio::spawn({
            let processor = processor.clone();
            let interval = cfg.heartbeat_interval;
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if processor.write_packet(Packet::heartbeat(), Priority::Heartbeat).await.is_err() {
                        break;
                    }
                }
            }
        });

        let result = loop {
            match processor.read_packet().await {
                Ok(pkt) => self.handle_packet(pkt).await,
                Err(e) => break Err(GatewayError::NetworkError(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))),
            }
        };
        heartbeat.abort();
        result
    }

    async fn handshake(&self, processor: &Arc<ControlStream>) -> Result<(), GatewayError> {
        let cfg = &self.inner.cfg;
        let request = HandshakeRequest {
            client_id: self.client_id(),
            protocol: cfg.protocol,
            token: cfg.token.clone(),
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| GatewayError::Internal(format!("encoding handshake request: {e}")))?;
        processor
            .write_packet(Packet::new(PacketType::Handshake, Bytes::from(body)), Priority::Command)
            .await
            .map_err(|e| GatewayError::NetworkError(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

        let pkt = processor
            .read_packet()
            .await
            .map_err(|e| GatewayError::NetworkError(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        if pkt.packet_type != PacketType::Handshake {
            return Err(GatewayError::InvalidState(format!(
                "expected handshake response, got {:?}",
                pkt.packet_type
            )));
        }
        let response: HandshakeResponse = serde_json::from_slice(&pkt.payload)
            .map_err(|e| GatewayError::Internal(format!("decoding handshake response: {e}")))?;
        if !response.success {
            return Err(GatewayError::Forbidden(
                response.error.unwrap_or_else(|| "handshake rejected".into()),
            ));
        }
        if let Some(assigned) = response.message.as_deref().and_then(|s| s.parse::<i64>().ok()) {
            self.inner.client_id.store(assigned, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn handle_packet(&self, pkt: Packet) {
        match pkt.packet_type {
            PacketType::Heartbeat => {}
            PacketType::Handshake => {
                debug!("ignoring unsolicited handshake packet on an established connection");
            }
            PacketType::JsonCommand => self.handle_json_command(pkt.payload).await,
            PacketType::TunnelOpen => self.handle_tunnel_open(pkt).await,
            PacketType::TunnelOpenAck => self.handle_tunnel_open_ack(pkt).await,
            PacketType::TunnelData => self.handle_tunnel_data(pkt).await,
            PacketType::TunnelClose => self.handle_tunnel_close(pkt).await,
        }
    }

    async fn handle_json_command(&self, payload: Bytes) {
        let command: Command = match serde_json::from_slice(&payload) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "malformed JsonCommand payload, dropping");
                return;
            }
        };

        if let Some((_, tx)) = self.inner.pending_commands.remove(&command.command_id) {
            let _ = tx.send(command);
            return;
        }

        match command.command_type {
            CommandType::Kick => {
                let reason = command
                    .body
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("kicked by server")
                    .to_string();
                let _ = self.inner.inbound_commands.send(InboundCommand::Kick { reason });
            }
            CommandType::MappingCreate => {
                let _ = self.inner.inbound_commands.send(InboundCommand::MappingCreate(command));
            }
            CommandType::MappingUpdate => {
                let _ = self.inner.inbound_commands.send(InboundCommand::MappingUpdate(command));
            }
            CommandType::MappingDelete => {
                let _ = self.inner.inbound_commands.send(InboundCommand::MappingDelete(command));
            }
            CommandType::Rpc => {
                match serde_json::from_value::<Notification>(command.body.clone()) {
                    Ok(notification) => self.inner.dispatcher.dispatch(notification).await,
                    Err(_) => {
                        let _ = self.inner.inbound_commands.send(InboundCommand::Other(command));
                    }
                }
            }
            _ => {
                let _ = self.inner.inbound_commands.send(InboundCommand::Other(command));
            }
        }
    }

    async fn handle_tunnel_open(&self, pkt: Packet) {
        let Some(tunnel_id) = pkt.tunnel_id.clone() else {
            warn!("TunnelOpen packet missing tunnel_id");
            return;
        };
        let body: TunnelOpenBody = match serde_json::from_slice(&pkt.payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "malformed TunnelOpen body");
                return;
            }
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        self.inner.tunnel_inbound.insert(tunnel_id.clone(), inbound_tx);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.inner.tunnel_cancels.insert(tunnel_id.clone(), cancel_tx);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.spawn_tunnel_pump(tunnel_id.clone(), outbound_rx);

        let channel = TunnelChannel::new(
            tunnel_id.clone(),
            outbound_tx,
            inbound_rx,
            self.inner.tunnel_inbound.clone(),
        );

        if let Some(conn) = self.current_conn().await {
            let ack = TunnelOpenAckBody::accepted();
            let ack_bytes = serde_json::to_vec(&ack).unwrap_or_default();
            let _ = conn
                .write_packet(
                    Packet::new(PacketType::TunnelOpenAck, Bytes::from(ack_bytes)).with_tunnel_id(&tunnel_id),
                    Priority::Command,
                )
                .await;
        }

        let opened = OpenedTunnel {
            tunnel_id,
            mapping_id: body.mapping_id,
            channel,
            cancel: cancel_rx,
            target_host: body.target_host,
            target_port: body.target_port,
        };
        let _ = self.inner.incoming_tunnels.send(opened);
    }

    async fn handle_tunnel_open_ack(&self, pkt: Packet) {
        let Some(tunnel_id) = pkt.tunnel_id else {
            return;
        };
        let Some((_, tx)) = self.inner.pending_tunnel_acks.remove(&tunnel_id) else {
            return;
        };
        let ack: Result<TunnelOpenAckBody, _> = serde_json::from_slice(&pkt.payload);
        let result = match ack {
            Ok(body) if body.accepted => Ok(()),
            Ok(body) => Err(body.error.unwrap_or_else(|| "tunnel open rejected".into())),
            Err(e) => Err(format!("malformed tunnel open ack: {e}")),
        };
        let _ = tx.send(result);
    }

    async fn handle_tunnel_data(&self, pkt: Packet) {
        let Some(tunnel_id) = pkt.tunnel_id else {
            return;
        };
        if let Some(sender) = self.inner.tunnel_inbound.get(&tunnel_id) {
            let _ = sender.send(pkt.payload).await;
        }
    }

    async fn handle_tunnel_close(&self, pkt: Packet) {
        let Some(tunnel_id) = pkt.tunnel_id else {
            return;
        };
        if let Some((_, cancel_tx)) = self.inner.tunnel_cancels.remove(&tunnel_id) {
            let _ = cancel_tx.send(true);
        }
        if let Some(sender) = self.inner.tunnel_inbound.get(&tunnel_id) {
            let _ = sender.send(Bytes::new()).await;
        }
    }

    fn spawn_tunnel_pump(&self, tunnel_id: String, mut outbound_rx: mpsc::UnboundedReceiver<Bytes>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(chunk) = outbound_rx.recv().await {
                let Some(conn) = inner.conn.lock().await.clone() else {
                    break;
                };
                let pkt = Packet::new(PacketType::TunnelData, chunk).with_tunnel_id(&tunnel_id);
                if conn.write_packet(pkt, Priority::Normal).await.is_err() {
                    break;
                }
            }
        });
    }

    async fn current_conn(&self) -> Option<Arc<ControlStream>> {
        self.inner.conn.lock().await.clone()
    }

    /// Open a tunnel to the peer responsible for `mapping` and wait for it
    /// to be accepted (or timed out, per `command_timeout`).
    pub async fn dial_tunnel(
        &self,
        mapping: &MappingConfig,
        peer_addr: SocketAddr,
    ) -> Result<OpenedTunnel, GatewayError> {
        let conn = self
            .current_conn()
            .await
            .ok_or_else(|| GatewayError::InvalidState("not connected".into()))?;

        let tunnel_id = Uuid::new_v4().to_string();
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        self.inner.tunnel_inbound.insert(tunnel_id.clone(), inbound_tx);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.inner.tunnel_cancels.insert(tunnel_id.clone(), cancel_tx);

        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner.pending_tunnel_acks.insert(tunnel_id.clone(), ack_tx);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.spawn_tunnel_pump(tunnel_id.clone(), outbound_rx);

        let client_id = self.client_id().to_string();
        let receiver_id = mapping.target_client_id.clone().unwrap_or_else(|| client_id.clone());
        let body = TunnelOpenBody {
            mapping_id: mapping.mapping_id.clone(),
            secret_key: mapping.secret_key.clone(),
            requester_client_id: client_id,
            receiver_client_id: receiver_id,
            target_host: mapping.target_host.clone(),
            target_port: mapping.target_port,
            peer_addr: peer_addr.to_string(),
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| GatewayError::Internal(format!("encoding tunnel open body: {e}")))?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(GatewayError::InvalidParam("tunnel open body too large".into()));
        }

        if let Err(e) = conn
            .write_packet(
                Packet::new(PacketType::TunnelOpen, Bytes::from(payload)).with_tunnel_id(&tunnel_id),
                Priority::Command,
            )
            .await
        {
            self.cleanup_tunnel(&tunnel_id);
            return Err(GatewayError::NetworkError(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())));
        }

        let timeout = self.inner.cfg.command_timeout;
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(OpenedTunnel {
                mapping_id: mapping.mapping_id.clone(),
                channel: TunnelChannel::new(tunnel_id.clone(), outbound_tx, inbound_rx, self.inner.tunnel_inbound.clone()),
                cancel: cancel_rx,
                target_host: mapping.target_host.clone(),
                target_port: mapping.target_port,
                tunnel_id,
            }),
            Ok(Ok(Err(reason))) => {
                self.cleanup_tunnel(&tunnel_id);
                Err(GatewayError::Forbidden(reason))
            }
            Ok(Err(_)) => {
                self.cleanup_tunnel(&tunnel_id);
                Err(GatewayError::Internal("tunnel open ack channel dropped".into()))
            }
            Err(_) => {
                self.cleanup_tunnel(&tunnel_id);
                Err(GatewayError::Timeout)
            }
        }
    }

    fn cleanup_tunnel(&self, tunnel_id: &str) {
        self.inner.tunnel_inbound.remove(tunnel_id);
        self.inner.tunnel_cancels.remove(tunnel_id);
        self.inner.pending_tunnel_acks.remove(tunnel_id);
    }

    /// Ask the server whether `mapping_id` still has capacity for another
    /// connection, reserving a slot against `max_connections` if it does.
    /// The cap travels with the request because the server has no other
    /// source of truth for a mapping's configured limit. A reserved slot
    /// must be given back with [`release_mapping_quota`] once the
    /// connection it was reserved for ends.
    pub async fn check_mapping_quota(&self, mapping_id: &str, max_connections: u32) -> Result<bool, GatewayError> {
        let reply = self
            .rpc(serde_json::json!({
                "op": "check_mapping_quota",
                "mapping_id": mapping_id,
                "max_connections": max_connections,
            }))
            .await?;
        Ok(reply.get("allowed").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    /// Release a connection slot previously reserved by
    /// [`check_mapping_quota`]. Fire-and-forget, like `track_traffic`.
    pub async fn release_mapping_quota(&self, mapping_id: &str) {
        let Some(conn) = self.current_conn().await else {
            return;
        };
        let command = Command::new(
            CommandType::Rpc,
            Uuid::new_v4().to_string(),
            self.client_id().to_string(),
            "server".to_string(),
        )
        .with_body(serde_json::json!({
            "op": "release_mapping_quota",
            "mapping_id": mapping_id,
        }));
        let Ok(payload) = serde_json::to_vec(&command) else {
            return;
        };
        let _ = conn
            .write_packet(Packet::new(PacketType::JsonCommand, Bytes::from(payload)), Priority::Normal)
            .await;
    }

    pub async fn get_user_quota(&self) -> Result<UserQuota, GatewayError> {
        let reply = self.rpc(serde_json::json!({ "op": "get_user_quota" })).await?;
        serde_json::from_value(reply)
            .map_err(|e| GatewayError::Internal(format!("decoding quota reply: {e}")))
    }

    /// Report observed traffic for billing/quota accounting. Fire-and-forget:
    /// the server doesn't reply, so this never blocks a data path on it.
    pub async fn track_traffic(&self, mapping_id: &str, bytes_sent: u64, bytes_recv: u64) {
        let Some(conn) = self.current_conn().await else {
            return;
        };
        let command = Command::new(
            CommandType::Rpc,
            Uuid::new_v4().to_string(),
            self.client_id().to_string(),
            "server".to_string(),
        )
        .with_body(serde_json::json!({
            "op": "track_traffic",
            "mapping_id": mapping_id,
            "bytes_sent": bytes_sent,
            "bytes_recv": bytes_recv,
        }));
        let Ok(payload) = serde_json::to_vec(&command) else {
            return;
        };
        let _ = conn
            .write_packet(Packet::new(PacketType::JsonCommand, Bytes::from(payload)), Priority::Normal)
            .await;
    }

    /// Tell the peer this tunnel closed, carrying the reason the pump
    /// observed. Best-effort: a closing connection racing this write is not
    /// treated as an error by the caller.
    pub async fn send_tunnel_close_notify(
        &self,
        tunnel_id: &str,
        reason: CloseReason,
    ) -> Result<(), GatewayError> {
        let Some(conn) = self.current_conn().await else {
            return Ok(());
        };
        let reason_str = serde_json::to_value(reason)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "error".to_string());
        let body = TunnelCloseBody { reason: reason_str };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| GatewayError::Internal(format!("encoding tunnel close body: {e}")))?;
        conn.write_packet(
            Packet::new(PacketType::TunnelClose, Bytes::from(payload)).with_tunnel_id(tunnel_id),
            Priority::Command,
        )
        .await
        .map_err(|e| GatewayError::NetworkError(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
    }

    async fn rpc(&self, body: serde_json::Value) -> Result<serde_json::Value, GatewayError> {
        let conn = self
            .current_conn()
            .await
            .ok_or_else(|| GatewayError::InvalidState("not connected".into()))?;

        let command_id = Uuid::new_v4().to_string();
        let command = Command::new(
            CommandType::Rpc,
            command_id.clone(),
            self.client_id().to_string(),
            "server".to_string(),
        )
        .with_body(body);
        let payload = serde_json::to_vec(&command)
            .map_err(|e| GatewayError::Internal(format!("encoding rpc command: {e}")))?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending_commands.insert(command_id.clone(), tx);

        if let Err(e) = conn
            .write_packet(Packet::new(PacketType::JsonCommand, Bytes::from(payload)), Priority::Command)
            .await
        {
            self.inner.pending_commands.remove(&command_id);
            return Err(GatewayError::NetworkError(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())));
        }

        match tokio::time::timeout(self.inner.cfg.command_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply.body),
            Ok(Err(_)) => {
                self.inner.pending_commands.remove(&command_id);
                Err(GatewayError::Internal("rpc reply channel dropped".into()))
            }
            Err(_) => {
                self.inner.pending_commands.remove(&command_id);
                Err(GatewayError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_quota_round_trips_through_json() {
        let quota = UserQuota {
            used_bytes: 10,
            limit_bytes: 100,
            used_connections: 1,
            limit_connections: 5,
        };
        let value = serde_json::to_value(quota).unwrap();
        let back: UserQuota = serde_json::from_value(value).unwrap();
        assert_eq!(back.limit_connections, 5);
    }
}
