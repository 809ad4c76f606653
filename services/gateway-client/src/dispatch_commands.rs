//! Mapping supervisor: owns one [`MappingHandle`] per live mapping, reacting
//! to `MappingCreate`/`MappingUpdate`/`MappingDelete` pushed from the server
//! and to `Kick` by tearing every mapping down and returning so the caller
//! can decide what "kicked" means for the process as a whole.
//!
//! Each `InboundCommand` variant is handled in full before the next one is
//! read off the channel — commands arrive in send order (per the control
//! connection's ordering guarantee) and this loop preserves that, rather
//! than racing concurrent mapping mutations against each other.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

use gw_tunnel::BufferPool;

use crate::client::{ClientSurface, InboundCommand};
use crate::config::MappingCommandBody;
use crate::mapping::{self, MappingHandle};

/// Drive the mapping supervisor until the channel closes or the client is
/// kicked. Returns `true` if the client was kicked (the caller should not
/// attempt to reconnect), `false` on ordinary channel closure.
pub async fn run(
    mut inbound: mpsc::UnboundedReceiver<InboundCommand>,
    client: ClientSurface,
    pool: Arc<BufferPool>,
    live: Arc<DashMap<String, MappingHandle>>,
) -> bool {
    while let Some(command) = inbound.recv().await {
        match command {
            InboundCommand::MappingCreate(cmd) => create_or_replace(&cmd, &client, &pool, &live),
            InboundCommand::MappingUpdate(cmd) => create_or_replace(&cmd, &client, &pool, &live),
            InboundCommand::MappingDelete(cmd) => {
                if let Some(mapping_id) = cmd.body.get("mapping_id").and_then(|v| v.as_str()) {
                    if let Some((_, handle)) = live.remove(mapping_id) {
                        handle.shutdown();
                        info!(mapping_id, "mapping deleted");
                    }
                } else {
                    warn!("MappingDelete command missing mapping_id");
                }
            }
            InboundCommand::Kick { reason } => {
                warn!(reason = %reason, "kicked by server, tearing down all mappings");
                for entry in live.iter() {
                    entry.value().shutdown();
                }
                live.clear();
                return true;
            }
            InboundCommand::Other(cmd) => {
                warn!(command_type = ?cmd.command_type, "unhandled inbound command");
            }
        }
    }
    false
}

fn create_or_replace(
    cmd: &gw_protocol::Command,
    client: &ClientSurface,
    pool: &Arc<BufferPool>,
    live: &Arc<DashMap<String, MappingHandle>>,
) {
    let body: MappingCommandBody = match serde_json::from_value(cmd.body.clone()) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "malformed mapping command body");
            return;
        }
    };
    let mapping = match body.into_mapping_config() {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "invalid mapping configuration");
            return;
        }
    };

    if let Some((_, old)) = live.remove(&mapping.mapping_id) {
        old.shutdown();
    }
    let mapping_id = mapping.mapping_id.clone();
    let handle = mapping::spawn(mapping, client.clone(), pool.clone());
    live.insert(mapping_id.clone(), handle);
    info!(mapping_id = %mapping_id, "mapping live");
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_dispatch::NotificationDispatcher;

    fn test_client() -> (ClientSurface, mpsc::UnboundedReceiver<InboundCommand>) {
        let cfg = crate::config::load_config_from_str(r#"server_addr = "127.0.0.1:1""#).unwrap();
        let dispatcher = Arc::new(NotificationDispatcher::new());
        let (client, inbound_rx, _incoming_tunnels_rx) = ClientSurface::new(cfg, dispatcher);
        (client, inbound_rx)
    }

    #[tokio::test]
    async fn channel_closure_returns_not_kicked() {
        let (client, inbound_rx) = test_client();
        let pool = Arc::new(BufferPool::new(4, 1024));
        let live = Arc::new(DashMap::new());
        drop(client.clone());

        let kicked = run(inbound_rx, client, pool, live).await;
        assert!(!kicked);
    }

    #[tokio::test]
    async fn kick_tears_down_every_mapping_and_returns_true() {
        let (client, inbound_rx) = test_client();
        let pool = Arc::new(BufferPool::new(4, 1024));
        let live = Arc::new(DashMap::new());

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(InboundCommand::Kick { reason: "test".into() }).unwrap();
        drop(tx);
        let _ = inbound_rx;

        let kicked = run(rx, client, pool, live).await;
        assert!(kicked);
    }
}
