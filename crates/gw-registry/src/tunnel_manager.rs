//! Concurrent tunnel_id -> `Tunnel` map. Registration is first-wins: if two
//! `TunnelOpen` commands race on the same id (a retried open, say), only
//! the first to land gets to run; the second is told no and its caller is
//! expected to generate a fresh id and retry.

use std::sync::Arc;

use dashmap::DashMap;

use gw_tunnel::Tunnel;

pub struct TunnelManager {
    tunnels: DashMap<String, Arc<Tunnel>>,
}

impl TunnelManager {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
        }
    }

    /// Returns `true` if `tunnel` became the registered tunnel for its id,
    /// `false` if one was already registered.
    pub fn try_register(&self, tunnel: Arc<Tunnel>) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.tunnels.entry(tunnel.id().to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(tunnel);
                true
            }
        }
    }

    pub fn get(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(tunnel_id).map(|entry| entry.clone())
    }

    pub fn remove(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.remove(tunnel_id).map(|(_, tunnel)| tunnel)
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}
