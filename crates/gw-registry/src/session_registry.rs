//! Control-connection registry, indexed by both `conn_id` and `client_id`.
//!
//! A duplicate login (the same `client_id` reconnecting while an old
//! connection is still registered) evicts the *old* connection: the new
//! connection always wins, and the old one is sent a `Kick` command so its
//! own read loop can close the socket and report `DUPLICATE_LOGIN` to
//! whatever's driving it. A connection registered past the registry's cap
//! evicts the single oldest entry the same way, tagged `CONNECTION_CAP_REACHED`
//! instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use gw_protocol::{Command, Packet, PacketType};

use crate::connection::ControlConnection;

pub struct SessionRegistry {
    by_conn: RwLock<HashMap<String, Arc<ControlConnection>>>,
    by_client: RwLock<HashMap<String, Arc<ControlConnection>>>,
    cap: usize,
}

impl SessionRegistry {
    /// `cap` bounds the number of connections held by `conn_id`; once
    /// reached, `register`/`kick_old` evict the single oldest entry
    /// (by `connected_at_ms`) before inserting the new one.
    pub fn new(cap: usize) -> Self {
        Self {
            by_conn: RwLock::new(HashMap::new()),
            by_client: RwLock::new(HashMap::new()),
            cap,
        }
    }

    /// Register `conn`, indexed by `conn_id` always and by `client_id` if
    /// `conn` is authenticated. If this pushes the registry past its cap,
    /// the single oldest connection (by `connected_at_ms`) is evicted and
    /// sent a capacity `Kick` first. Returns the evicted connection, if any.
    pub async fn register(&self, conn: Arc<ControlConnection>) -> Option<Arc<ControlConnection>> {
        let evicted = self.evict_oldest_if_at_cap().await;
        self.insert(conn).await;
        evicted
    }

    async fn insert(&self, conn: Arc<ControlConnection>) {
        if conn.is_authenticated() {
            self.by_client.write().await.insert(conn.client_id.clone(), conn.clone());
        }
        self.by_conn.write().await.insert(conn.conn_id.clone(), conn);
    }

    async fn evict_oldest_if_at_cap(&self) -> Option<Arc<ControlConnection>> {
        let oldest_conn_id = {
            let map = self.by_conn.read().await;
            if map.len() < self.cap {
                return None;
            }
            map.values().min_by_key(|c| c.connected_at_ms()).map(|c| c.conn_id.clone())?
        };
        let evicted = self.remove_conn_id(&oldest_conn_id).await;
        if let Some(old) = &evicted {
            warn!(client_id = %old.client_id, conn_id = %old.conn_id, "evicting oldest connection, registry at capacity");
            let kick = Command::kick_for_capacity(Uuid::new_v4().to_string(), "registry", &old.client_id);
            if let Ok(body) = serde_json::to_vec(&kick) {
                let _ = old.try_send(Packet::new(PacketType::JsonCommand, body.into()));
            }
        }
        evicted
    }

    async fn remove_conn_id(&self, conn_id: &str) -> Option<Arc<ControlConnection>> {
        let removed = self.by_conn.write().await.remove(conn_id);
        if let Some(conn) = &removed {
            let mut by_client = self.by_client.write().await;
            if by_client.get(&conn.client_id).map(|c| c.conn_id.as_str()) == Some(conn_id) {
                by_client.remove(&conn.client_id);
            }
        }
        removed
    }

    /// Register `conn` (subject to the same cap eviction `register` applies),
    /// and if a different connection was already registered for this
    /// `client_id`, remove its stale `conn_id` entry and send it a `Kick`
    /// command. Returns the connection evicted for the duplicate login, if
    /// any — a cap eviction of some unrelated connection is handled (and
    /// logged) internally but not returned here.
    pub async fn kick_old(&self, conn: Arc<ControlConnection>) -> Option<Arc<ControlConnection>> {
        let client_id = conn.client_id.clone();
        let new_conn_id = conn.conn_id.clone();

        let cap_evicted = self.evict_oldest_if_at_cap().await;
        let superseded = self.by_client.read().await.get(&client_id).cloned();
        self.insert(conn).await;

        let old = superseded?;
        if old.conn_id == new_conn_id {
            return None;
        }
        if cap_evicted.as_ref().is_some_and(|e| e.conn_id == old.conn_id) {
            // Already removed and kicked as part of the capacity sweep.
            return None;
        }

        self.by_conn.write().await.remove(&old.conn_id);
        let kick = Command::kick(Uuid::new_v4().to_string(), "registry", &client_id);
        if let Ok(body) = serde_json::to_vec(&kick) {
            let _ = old.try_send(Packet::new(PacketType::JsonCommand, body.into()));
        }
        Some(old)
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<ControlConnection>> {
        self.by_client.read().await.get(client_id).cloned()
    }

    pub async fn get_by_conn_id(&self, conn_id: &str) -> Option<Arc<ControlConnection>> {
        self.by_conn.read().await.get(conn_id).cloned()
    }

    /// Remove the registration for `client_id`/`conn_id`, but only if
    /// `conn_id` still holds the `client_id` slot — guards against an old
    /// connection's teardown racing past a newer registration and deleting
    /// it by accident.
    pub async fn unregister(&self, client_id: &str, conn_id: &str) -> bool {
        let owns_client_slot = {
            let by_client = self.by_client.read().await;
            by_client.get(client_id).map(|c| c.conn_id.as_str()) == Some(conn_id)
        };
        if !owns_client_slot {
            return false;
        }
        self.by_client.write().await.remove(client_id);
        self.by_conn.write().await.remove(conn_id);
        true
    }

    /// Sweep every registered connection for heartbeat staleness, removing
    /// and returning the stale ones for the caller to close.
    pub async fn cleanup_stale(&self, timeout: Duration) -> Vec<Arc<ControlConnection>> {
        let stale_ids: Vec<String> = {
            let map = self.by_conn.read().await;
            map.iter()
                .filter(|(_, conn)| conn.is_stale(timeout))
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut removed = Vec::with_capacity(stale_ids.len());
        for conn_id in stale_ids {
            if let Some(conn) = self.remove_conn_id(&conn_id).await {
                removed.push(conn);
            }
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.by_conn.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_protocol::TransportProtocol;
    use tokio::sync::mpsc;

    fn conn(client_id: &str, conn_id: &str) -> (Arc<ControlConnection>, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(8);
        let c = ControlConnection::new(client_id, conn_id, TransportProtocol::Tcp, tx);
        c.mark_authenticated();
        (Arc::new(c), rx)
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let registry = SessionRegistry::new(10);
        let (c1, _rx) = conn("alice", "s1");
        assert!(registry.register(c1).await.is_none());
        assert!(registry.get("alice").await.is_some());
        assert!(registry.get_by_conn_id("s1").await.is_some());
    }

    #[tokio::test]
    async fn kick_old_evicts_and_sends_kick_command() {
        let registry = SessionRegistry::new(10);
        let (c1, mut rx1) = conn("alice", "s1");
        registry.register(c1).await;

        let (c2, _rx2) = conn("alice", "s2");
        registry.kick_old(c2).await;

        let evicted_from_conn_index = registry.get_by_conn_id("s1").await;
        assert!(evicted_from_conn_index.is_none(), "stale conn_id entry must be dropped on kick_old");

        let kicked_packet = rx1.recv().await.expect("old connection receives a kick");
        let cmd: Command = serde_json::from_slice(&kicked_packet.payload).unwrap();
        assert_eq!(cmd.body["code"], "DUPLICATE_LOGIN");

        // The new session now owns the registration.
        assert_eq!(registry.get("alice").await.unwrap().conn_id, "s2");
    }

    #[tokio::test]
    async fn unregister_is_a_noop_for_a_superseded_session() {
        let registry = SessionRegistry::new(10);
        let (c1, _rx1) = conn("alice", "s1");
        registry.register(c1).await;
        let (c2, _rx2) = conn("alice", "s2");
        registry.kick_old(c2).await;

        // A delayed unregister for the old session must not evict the new one.
        assert!(!registry.unregister("alice", "s1").await);
        assert_eq!(registry.get("alice").await.unwrap().conn_id, "s2");
    }

    #[tokio::test]
    async fn cleanup_stale_removes_expired_connections() {
        let registry = SessionRegistry::new(10);
        let (c1, _rx1) = conn("alice", "s1");
        registry.register(c1).await;

        let removed = registry.cleanup_stale(Duration::from_millis(0)).await;
        assert_eq!(removed.len(), 1);
        assert!(registry.get("alice").await.is_none());
    }

    #[tokio::test]
    async fn registering_past_capacity_evicts_the_oldest_connection() {
        let registry = SessionRegistry::new(2);
        let (c1, mut rx1) = conn("alice", "s1");
        let (c2, _rx2) = conn("bob", "s2");
        registry.register(c1).await;
        registry.register(c2).await;
        assert_eq!(registry.len().await, 2);

        let (c3, _rx3) = conn("carol", "s3");
        let evicted = registry.register(c3).await.expect("registry is at capacity");
        assert_eq!(evicted.client_id, "alice");

        let kicked_packet = rx1.recv().await.expect("evicted connection receives a kick");
        let cmd: Command = serde_json::from_slice(&kicked_packet.payload).unwrap();
        assert_eq!(cmd.body["code"], "CONNECTION_CAP_REACHED");

        assert_eq!(registry.len().await, 2);
        assert!(registry.get("alice").await.is_none());
        assert!(registry.get("carol").await.is_some());
    }

    #[tokio::test]
    async fn anonymous_connection_is_indexed_only_by_conn_id() {
        let registry = SessionRegistry::new(10);
        let (tx, _rx) = mpsc::channel(8);
        let conn = Arc::new(ControlConnection::new("", "s1", TransportProtocol::Tcp, tx));
        assert!(!conn.is_authenticated());
        registry.register(conn).await;
        assert!(registry.get_by_conn_id("s1").await.is_some());
        assert!(registry.get("").await.is_none());
    }
}
