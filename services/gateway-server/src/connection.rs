//! Per-connection task: accept a raw TCP stream, perform the handshake,
//! register it with the session registry, then relay packets for the life
//! of the connection.
//!
//! The server never terminates a tunnel itself — `TunnelOpen`, `TunnelData`
//! and friends are routed by `tunnel_id` to whichever other client's control
//! connection is the other side of that tunnel, using `AppState`'s
//! `tunnel_routes` table. The server only interprets `JsonCommand` packets
//! closely enough to know who a command is addressed to.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gw_protocol::{
    Command, CommandType, GatewayError, HandshakeRequest, HandshakeResponse, Packet, PacketType,
    Priority, StreamProcessor,
};
use gw_registry::ControlConnection;

use crate::state::{AppState, TunnelRoute};

/// Accept one TCP connection through its full lifecycle: handshake, then
/// the packet read loop, until the peer disconnects or a fatal protocol
/// error occurs.
pub async fn handle_connection(
    stream: TcpStream,
    state: AppState,
    handshake_timeout: Duration,
    heartbeat_timeout: Duration,
) {
    let _ = stream.set_nodelay(true);
    let proc = Arc::new(StreamProcessor::new(stream, None, None));

    let req = match tokio::time::timeout(handshake_timeout, proc.read_packet()).await {
        Ok(Ok(pkt)) if pkt.packet_type == PacketType::Handshake => {
            match serde_json::from_slice::<HandshakeRequest>(&pkt.payload) {
                Ok(req) => req,
                Err(e) => {
                    reject(&proc, &format!("malformed handshake: {e}")).await;
                    return;
                }
            }
        }
        Ok(Ok(_)) => {
            reject(&proc, "first packet must be a handshake").await;
            return;
        }
        Ok(Err(e)) => {
            debug!(error = %e, "connection closed before handshake");
            return;
        }
        Err(_) => {
            reject(&proc, "handshake timed out").await;
            return;
        }
    };

    let client_id = if req.is_anonymous() {
        state.next_anonymous_client_id().to_string()
    } else {
        req.client_id.to_string()
    };
    let conn_id = Uuid::new_v4().to_string();

    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let conn = Arc::new(ControlConnection::new(
        client_id.clone(),
        conn_id.clone(),
        req.protocol,
        outbound_tx,
    ));
    conn.mark_authenticated();

    if let Some(evicted) = state.registry.kick_old(conn.clone()).await {
        info!(client_id = %client_id, old_conn_id = %evicted.conn_id, "evicted prior session on duplicate login");
    }

    let drain_handle = tokio::spawn(drain_outbound(proc.clone(), outbound_rx));

    let ok = proc
        .write_packet(
            Packet::new(
                PacketType::Handshake,
                serde_json::to_vec(&HandshakeResponse::ok(client_id.clone()))
                    .unwrap_or_default()
                    .into(),
            ),
            Priority::Command,
        )
        .await;
    if ok.is_err() {
        state.registry.unregister(&client_id, &conn_id).await;
        return;
    }

    info!(client_id = %client_id, conn_id = %conn_id, "client connected");
    read_loop(proc.clone(), &state, &conn, heartbeat_timeout).await;

    state.registry.unregister(&client_id, &conn_id).await;
    proc.close().await;
    drain_handle.abort();
    info!(client_id = %client_id, conn_id = %conn_id, "client disconnected");
}

async fn reject(proc: &StreamProcessor<TcpStream>, error: &str) {
    let body = serde_json::to_vec(&HandshakeResponse::rejected(error)).unwrap_or_default();
    let _ = proc
        .write_packet(Packet::new(PacketType::Handshake, body.into()), Priority::Command)
        .await;
}

async fn drain_outbound(proc: Arc<StreamProcessor<TcpStream>>, mut rx: mpsc::Receiver<Packet>) {
    while let Some(pkt) = rx.recv().await {
        let priority = match pkt.packet_type {
            PacketType::Heartbeat => Priority::Heartbeat,
            PacketType::JsonCommand => Priority::Command,
            _ => Priority::Normal,
        };
        if proc.write_packet(pkt, priority).await.is_err() {
            break;
        }
    }
}

async fn read_loop(
    proc: Arc<StreamProcessor<TcpStream>>,
    state: &AppState,
    conn: &Arc<ControlConnection>,
    heartbeat_timeout: Duration,
) {
    loop {
        let read = tokio::time::timeout(heartbeat_timeout, proc.read_packet()).await;

        let pkt = match read {
            Ok(Ok(pkt)) => pkt,
            Ok(Err(e)) => {
                debug!(error = %e, client_id = %conn.client_id, "read loop ended");
                break;
            }
            Err(_) => {
                debug!(client_id = %conn.client_id, "heartbeat timeout, closing connection");
                break;
            }
        };

        match pkt.packet_type {
            PacketType::Heartbeat => {
                conn.touch_heartbeat();
            }
            PacketType::JsonCommand => {
                if let Err(e) = handle_command(&pkt, state, conn).await {
                    warn!(error = %e, client_id = %conn.client_id, "command handling failed");
                }
            }
            PacketType::TunnelOpen | PacketType::TunnelOpenAck | PacketType::TunnelData | PacketType::TunnelClose => {
                forward_tunnel_packet(pkt, state, conn).await;
            }
            PacketType::Handshake => {
                warn!(client_id = %conn.client_id, "unexpected second handshake packet, ignoring");
            }
        }
    }
}

async fn handle_command(
    pkt: &Packet,
    state: &AppState,
    conn: &Arc<ControlConnection>,
) -> Result<(), GatewayError> {
    let cmd: Command = serde_json::from_slice(&pkt.payload)
        .map_err(|e| GatewayError::ValidationError(format!("malformed command: {e}")))?;

    match cmd.command_type {
        CommandType::Heartbeat => {
            conn.touch_heartbeat();
        }
        CommandType::MappingCreate | CommandType::MappingUpdate | CommandType::MappingDelete | CommandType::MappingList => {
            relay_mapping_command(cmd, state, conn).await?;
        }
        CommandType::TunnelOpen | CommandType::TunnelOpenAck | CommandType::TunnelClose => {
            // Tunnel lifecycle is carried over the dedicated Tunnel* packet
            // types, not JsonCommand; a client sending one here is routing
            // a command-shaped echo of it, which we forward like any other
            // addressed command.
            relay_to_receiver(cmd, state).await?;
        }
        CommandType::Connect | CommandType::Disconnect => {
            relay_to_receiver(cmd, state).await?;
        }
        CommandType::Kick => {
            // Only the registry itself issues Kick; a client sending one is
            // ignored rather than relayed.
        }
        CommandType::Rpc => {
            handle_rpc(cmd, state, conn).await?;
        }
        CommandType::Transfer | CommandType::ConfigGet | CommandType::ConfigSet => {
            debug!(command_type = ?cmd.command_type, "command type not implemented by this gateway, dropping");
        }
    }
    Ok(())
}

/// Answer the quota/accounting ops `ClientSurface` sends as `Rpc` commands.
/// The counters these ops read and write (`quota:conns:*`, `quota:bytes:*`)
/// are plain `Runtime`-category store keys — process-local and
/// non-persistent, the stand-in `PersistentBackend`'s contract exists for
/// but doesn't itself need to back.
async fn handle_rpc(cmd: Command, state: &AppState, conn: &Arc<ControlConnection>) -> Result<(), GatewayError> {
    let op = cmd.body.get("op").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    match op.as_str() {
        "check_mapping_quota" => handle_check_mapping_quota(cmd, state, conn).await,
        "get_user_quota" => handle_get_user_quota(cmd, state, conn).await,
        "track_traffic" => handle_track_traffic(cmd, state, conn).await,
        "release_mapping_quota" => handle_release_mapping_quota(cmd, state, conn).await,
        _ => {
            debug!(op = %op, client_id = %conn.client_id, "unrecognized rpc op, dropping");
            Ok(())
        }
    }
}

/// Reserve a connection slot against `mapping_id`'s configured cap (sent by
/// the caller, since this server never holds a client's own mapping config)
/// and, if that succeeds, against this account's overall connection cap.
/// Denying either releases whichever slot was already reserved, so a denied
/// attempt never leaks a permanently-held reservation.
async fn handle_check_mapping_quota(
    cmd: Command,
    state: &AppState,
    conn: &Arc<ControlConnection>,
) -> Result<(), GatewayError> {
    let mapping_id = cmd.body.get("mapping_id").and_then(|v| v.as_str()).unwrap_or_default();
    let max_connections = cmd.body.get("max_connections").and_then(|v| v.as_u64()).unwrap_or(0);
    let mapping_key = format!("quota:conns:{}:{}", conn.client_id, mapping_id);
    let client_key = format!("quota:conns:{}", conn.client_id);

    let mapping_count = state.store.incr(&mapping_key, 1).await?;
    let mut allowed = max_connections == 0 || mapping_count as u64 <= max_connections;

    if allowed {
        let client_count = state.store.incr(&client_key, 1).await?;
        if let Some(limit) = state.default_user_connection_limit {
            if client_count as u64 > limit as u64 {
                allowed = false;
                state.store.incr(&client_key, -1).await?;
            }
        }
    }
    if !allowed {
        state.store.incr(&mapping_key, -1).await?;
    }

    let reply = Command::new(CommandType::Rpc, cmd.command_id.clone(), "gateway", &conn.client_id)
        .with_body(serde_json::json!({ "allowed": allowed }));
    send_command(conn, reply)
}

/// Reply with this account's live byte/connection usage against its
/// configured defaults. Read-only: unlike `check_mapping_quota`, this
/// reserves nothing, matching `ClientSurface::get_user_quota`'s "ask"
/// framing.
async fn handle_get_user_quota(
    cmd: Command,
    state: &AppState,
    conn: &Arc<ControlConnection>,
) -> Result<(), GatewayError> {
    let client_key = format!("quota:conns:{}", conn.client_id);
    let bytes_key = format!("quota:bytes:{}", conn.client_id);

    let used_connections = state.store.incr(&client_key, 0).await? as u32;
    let used_bytes = state.store.incr(&bytes_key, 0).await? as u64;

    let reply = Command::new(CommandType::Rpc, cmd.command_id.clone(), "gateway", &conn.client_id).with_body(
        serde_json::json!({
            "used_bytes": used_bytes,
            "limit_bytes": state.default_user_byte_limit.unwrap_or(0),
            "used_connections": used_connections,
            "limit_connections": state.default_user_connection_limit.unwrap_or(0),
        }),
    );
    send_command(conn, reply)
}

/// Fire-and-forget traffic accounting; no reply, matching
/// `ClientSurface::track_traffic`.
async fn handle_track_traffic(cmd: Command, state: &AppState, conn: &Arc<ControlConnection>) -> Result<(), GatewayError> {
    let bytes_sent = cmd.body.get("bytes_sent").and_then(|v| v.as_u64()).unwrap_or(0);
    let bytes_recv = cmd.body.get("bytes_recv").and_then(|v| v.as_u64()).unwrap_or(0);
    let bytes_key = format!("quota:bytes:{}", conn.client_id);
    state.store.incr(&bytes_key, (bytes_sent + bytes_recv) as i64).await?;
    Ok(())
}

/// Release a connection slot reserved by a prior `check_mapping_quota` call.
/// Fire-and-forget, called once the connection it was reserved for closes;
/// without this the per-mapping and per-account counters only ever grow.
async fn handle_release_mapping_quota(
    cmd: Command,
    state: &AppState,
    conn: &Arc<ControlConnection>,
) -> Result<(), GatewayError> {
    let mapping_id = cmd.body.get("mapping_id").and_then(|v| v.as_str()).unwrap_or_default();
    let mapping_key = format!("quota:conns:{}:{}", conn.client_id, mapping_id);
    let client_key = format!("quota:conns:{}", conn.client_id);
    state.store.incr(&mapping_key, -1).await?;
    state.store.incr(&client_key, -1).await?;
    Ok(())
}

async fn relay_mapping_command(
    cmd: Command,
    state: &AppState,
    conn: &Arc<ControlConnection>,
) -> Result<(), GatewayError> {
    let key = format!("mapping:{}:{}", conn.client_id, cmd.command_id);
    match cmd.command_type {
        CommandType::MappingDelete => {
            state.store.delete(&key).await?;
        }
        CommandType::MappingList => {
            let prefix = format!("mapping:{}:", conn.client_id);
            let keys = state.store.query_by_prefix(&prefix).await?;
            let reply = Command::new(CommandType::MappingList, cmd.command_id.clone(), "gateway", &conn.client_id)
                .with_body(serde_json::json!({ "keys": keys }));
            send_command(conn, reply)?;
        }
        CommandType::MappingCreate | CommandType::MappingUpdate => {
            let body = serde_json::to_vec(&cmd.body)
                .map_err(|e| GatewayError::ValidationError(e.to_string()))?;
            state.store.set(&key, body, 0).await?;
        }
        _ => unreachable!("relay_mapping_command only called for mapping command types"),
    }
    Ok(())
}

async fn relay_to_receiver(cmd: Command, state: &AppState) -> Result<(), GatewayError> {
    let Some(target) = state.registry.get(&cmd.receiver_id).await else {
        debug!(receiver_id = %cmd.receiver_id, "command addressed to an offline client, dropping");
        return Ok(());
    };
    send_command(&target, cmd)
}

fn send_command(conn: &Arc<ControlConnection>, cmd: Command) -> Result<(), GatewayError> {
    let body = serde_json::to_vec(&cmd).map_err(|e| GatewayError::ValidationError(e.to_string()))?;
    conn.try_send(Packet::new(PacketType::JsonCommand, body.into()))
        .map_err(|e| GatewayError::Internal(format!("outbound queue closed: {e}")))
}

/// Forward a tunnel-carrying packet to the other side of its route.
///
/// `TunnelOpen` is special: it establishes the route in the first place,
/// reading `requester_client_id`/`receiver_client_id` out of its body
/// rather than looking one up.
async fn forward_tunnel_packet(pkt: Packet, state: &AppState, conn: &Arc<ControlConnection>) {
    let Some(tunnel_id) = pkt.tunnel_id.clone() else {
        warn!(client_id = %conn.client_id, "tunnel packet missing tunnel_id, dropping");
        return;
    };

    if pkt.packet_type == PacketType::TunnelOpen {
        match serde_json::from_slice::<gw_protocol::TunnelOpenBody>(&pkt.payload) {
            Ok(body) => {
                state.register_tunnel_route(
                    tunnel_id.clone(),
                    TunnelRoute {
                        requester_client_id: body.requester_client_id.clone(),
                        receiver_client_id: body.receiver_client_id.clone(),
                    },
                );
                forward_to(state, &body.receiver_client_id, pkt).await;
            }
            Err(e) => {
                warn!(error = %e, tunnel_id = %tunnel_id, "malformed TunnelOpen body, dropping");
            }
        }
        return;
    }

    let Some(route) = state.tunnel_routes.get(&tunnel_id).map(|r| r.value().clone()) else {
        debug!(tunnel_id = %tunnel_id, "tunnel packet for unknown route, dropping");
        return;
    };
    let Some(peer) = route.peer_of(&conn.client_id) else {
        warn!(client_id = %conn.client_id, tunnel_id = %tunnel_id, "client is not a party to this tunnel route");
        return;
    };
    let peer = peer.to_string();

    if pkt.packet_type == PacketType::TunnelClose {
        state.remove_tunnel_route(&tunnel_id);
    }

    forward_to(state, &peer, pkt).await;
}

async fn forward_to(state: &AppState, client_id: &str, pkt: Packet) {
    let Some(target) = state.registry.get(client_id).await else {
        debug!(client_id = %client_id, "tunnel peer is offline, dropping packet");
        return;
    };
    if let Err(e) = target.try_send(pkt) {
        warn!(client_id = %client_id, error = %e, "failed to enqueue tunnel packet for peer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_protocol::TransportProtocol;

    #[tokio::test]
    async fn malformed_command_is_rejected_without_panicking() {
        let (tx, _rx) = mpsc::channel(8);
        let conn = Arc::new(ControlConnection::new("c1", "s1", TransportProtocol::Tcp, tx));
        let state = AppState::new(
            Arc::new(gw_storage::HybridStore::new(Arc::new(gw_storage::SqliteBackend::open_in_memory().unwrap()))),
            10_000,
        );
        let pkt = Packet::new(PacketType::JsonCommand, b"not json".to_vec().into());
        let err = handle_command(&pkt, &state, &conn).await.unwrap_err();
        assert!(matches!(err, GatewayError::ValidationError(_)));
    }

    #[tokio::test]
    async fn mapping_list_replies_with_stored_keys() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Arc::new(ControlConnection::new("c1", "s1", TransportProtocol::Tcp, tx));
        let state = AppState::new(
            Arc::new(gw_storage::HybridStore::new(Arc::new(gw_storage::SqliteBackend::open_in_memory().unwrap()))),
            10_000,
        );
        state
            .store
            .set("mapping:c1:m1", b"{}".to_vec(), 0)
            .await
            .unwrap();

        let cmd = Command::new(CommandType::MappingList, "req1", "c1", "gateway");
        let pkt = Packet::new(PacketType::JsonCommand, serde_json::to_vec(&cmd).unwrap().into());
        handle_command(&pkt, &state, &conn).await.unwrap();

        let reply_pkt = rx.recv().await.unwrap();
        let reply: Command = serde_json::from_slice(&reply_pkt.payload).unwrap();
        assert_eq!(reply.body["keys"][0], "mapping:c1:m1");
    }

    #[tokio::test]
    async fn tunnel_open_registers_a_route_and_forwards_to_receiver() {
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let conn_a = Arc::new(ControlConnection::new("a", "s1", TransportProtocol::Tcp, tx_a));
        let conn_b = Arc::new(ControlConnection::new("b", "s2", TransportProtocol::Tcp, tx_b));
        conn_b.mark_authenticated();
        let state = AppState::new(
            Arc::new(gw_storage::HybridStore::new(Arc::new(gw_storage::SqliteBackend::open_in_memory().unwrap()))),
            10_000,
        );
        state.registry.register(conn_b.clone()).await;

        let body = gw_protocol::TunnelOpenBody {
            mapping_id: "m1".into(),
            secret_key: "k".into(),
            requester_client_id: "a".into(),
            receiver_client_id: "b".into(),
            target_host: None,
            target_port: None,
            peer_addr: "203.0.113.1:1234".into(),
        };
        let pkt = Packet::new(PacketType::TunnelOpen, serde_json::to_vec(&body).unwrap().into())
            .with_tunnel_id("t1");

        forward_tunnel_packet(pkt, &state, &conn_a).await;

        assert!(state.tunnel_routes.contains_key("t1"));
        let forwarded = rx_b.recv().await.unwrap();
        assert_eq!(forwarded.packet_type, PacketType::TunnelOpen);
    }

    async fn rpc_command(conn: &Arc<ControlConnection>, state: &AppState, op_body: serde_json::Value) -> Command {
        let cmd = Command::new(CommandType::Rpc, "req1", &conn.client_id, "gateway").with_body(op_body);
        let pkt = Packet::new(PacketType::JsonCommand, serde_json::to_vec(&cmd).unwrap().into());
        handle_command(&pkt, state, conn).await.unwrap();
        cmd
    }

    #[tokio::test]
    async fn check_mapping_quota_rejects_the_kplus1th_connection() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Arc::new(ControlConnection::new("c1", "s1", TransportProtocol::Tcp, tx));
        let state = AppState::new(
            Arc::new(gw_storage::HybridStore::new(Arc::new(gw_storage::SqliteBackend::open_in_memory().unwrap()))),
            10_000,
        );

        for _ in 0..2 {
            rpc_command(&conn, &state, serde_json::json!({"op": "check_mapping_quota", "mapping_id": "m1", "max_connections": 2})).await;
            let reply_pkt = rx.recv().await.unwrap();
            let reply: Command = serde_json::from_slice(&reply_pkt.payload).unwrap();
            assert_eq!(reply.body["allowed"], true);
        }

        rpc_command(&conn, &state, serde_json::json!({"op": "check_mapping_quota", "mapping_id": "m1", "max_connections": 2})).await;
        let reply_pkt = rx.recv().await.unwrap();
        let reply: Command = serde_json::from_slice(&reply_pkt.payload).unwrap();
        assert_eq!(reply.body["allowed"], false);
    }

    #[tokio::test]
    async fn release_mapping_quota_frees_the_slot_for_reuse() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Arc::new(ControlConnection::new("c1", "s1", TransportProtocol::Tcp, tx));
        let state = AppState::new(
            Arc::new(gw_storage::HybridStore::new(Arc::new(gw_storage::SqliteBackend::open_in_memory().unwrap()))),
            10_000,
        );

        rpc_command(&conn, &state, serde_json::json!({"op": "check_mapping_quota", "mapping_id": "m1", "max_connections": 1})).await;
        rx.recv().await.unwrap();

        let release = Command::new(CommandType::Rpc, "rel1", "c1", "gateway")
            .with_body(serde_json::json!({"op": "release_mapping_quota", "mapping_id": "m1"}));
        let pkt = Packet::new(PacketType::JsonCommand, serde_json::to_vec(&release).unwrap().into());
        handle_command(&pkt, &state, &conn).await.unwrap();

        rpc_command(&conn, &state, serde_json::json!({"op": "check_mapping_quota", "mapping_id": "m1", "max_connections": 1})).await;
        let reply_pkt = rx.recv().await.unwrap();
        let reply: Command = serde_json::from_slice(&reply_pkt.payload).unwrap();
        assert_eq!(reply.body["allowed"], true);
    }

    #[tokio::test]
    async fn get_user_quota_reflects_configured_defaults_and_live_usage() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Arc::new(ControlConnection::new("c1", "s1", TransportProtocol::Tcp, tx));
        let state = AppState::new(
            Arc::new(gw_storage::HybridStore::new(Arc::new(gw_storage::SqliteBackend::open_in_memory().unwrap()))),
            10_000,
        )
        .with_user_quota_defaults(Some(1_000), Some(5));

        rpc_command(&conn, &state, serde_json::json!({"op": "track_traffic", "mapping_id": "m1", "bytes_sent": 10, "bytes_recv": 20})).await;

        rpc_command(&conn, &state, serde_json::json!({"op": "get_user_quota"})).await;
        let reply_pkt = rx.recv().await.unwrap();
        let reply: Command = serde_json::from_slice(&reply_pkt.payload).unwrap();
        assert_eq!(reply.body["used_bytes"], 30);
        assert_eq!(reply.body["limit_bytes"], 1000);
        assert_eq!(reply.body["limit_connections"], 5);
    }
}
