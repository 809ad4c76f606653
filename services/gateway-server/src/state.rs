//! Process-wide shared state: the session registry, the tunnel-route
//! table, the notification dispatcher, and hybrid storage. One `AppState`
//! is built at startup and cloned (cheaply, behind `Arc`) into every
//! connection task.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use gw_dispatch::NotificationDispatcher;
use gw_registry::SessionRegistry;
use gw_storage::HybridStore;

/// Which two clients a live tunnel connects, keyed by `tunnel_id`. The
/// server never interprets `TunnelData` payloads — it only needs this to
/// know which control connection to relay a tunnel-carrying packet onto.
#[derive(Debug, Clone)]
pub struct TunnelRoute {
    pub requester_client_id: String,
    pub receiver_client_id: String,
}

impl TunnelRoute {
    /// The client on the other end of `from`, or `None` if `from` is
    /// neither side of this route.
    pub fn peer_of(&self, from: &str) -> Option<&str> {
        if from == self.requester_client_id {
            Some(&self.receiver_client_id)
        } else if from == self.receiver_client_id {
            Some(&self.requester_client_id)
        } else {
            None
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub store: Arc<HybridStore>,
    pub tunnel_routes: Arc<DashMap<String, TunnelRoute>>,
    anonymous_id_seq: Arc<AtomicI64>,
    /// `None` means unlimited, same convention as a mapping's own
    /// `max_connections == 0`. Backs the stubbed `get_user_quota` RPC.
    pub default_user_byte_limit: Option<u64>,
    pub default_user_connection_limit: Option<u32>,
}

impl AppState {
    /// `max_connections` is also the session registry's connection cap —
    /// the same quantity bounding the raw TCP accept semaphore in `main.rs`
    /// bounds how many control connections the registry holds at once.
    pub fn new(store: Arc<HybridStore>, max_connections: usize) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(max_connections)),
            dispatcher: Arc::new(NotificationDispatcher::new()),
            store,
            tunnel_routes: Arc::new(DashMap::new()),
            // Anonymous client ids start well above any plausible
            // registered id so they can't collide with one.
            anonymous_id_seq: Arc::new(AtomicI64::new(1_000_000_000)),
            default_user_byte_limit: None,
            default_user_connection_limit: None,
        }
    }

    pub fn with_user_quota_defaults(mut self, byte_limit: Option<u64>, connection_limit: Option<u32>) -> Self {
        self.default_user_byte_limit = byte_limit;
        self.default_user_connection_limit = connection_limit;
        self
    }

    /// Assign a fresh synthetic client id for an anonymous handshake.
    pub fn next_anonymous_client_id(&self) -> i64 {
        self.anonymous_id_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_tunnel_route(&self, tunnel_id: impl Into<String>, route: TunnelRoute) {
        self.tunnel_routes.insert(tunnel_id.into(), route);
    }

    pub fn remove_tunnel_route(&self, tunnel_id: &str) -> Option<TunnelRoute> {
        self.tunnel_routes.remove(tunnel_id).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_of_resolves_either_direction() {
        let route = TunnelRoute {
            requester_client_id: "42".into(),
            receiver_client_id: "43".into(),
        };
        assert_eq!(route.peer_of("42"), Some("43"));
        assert_eq!(route.peer_of("43"), Some("42"));
        assert_eq!(route.peer_of("99"), None);
    }

    #[test]
    fn anonymous_ids_are_monotonic_and_never_repeat() {
        let state = AppState::new(
            Arc::new(HybridStore::new(Arc::new(gw_storage::SqliteBackend::open_in_memory().unwrap()))),
            10_000,
        );
        let a = state.next_anonymous_client_id();
        let b = state.next_anonymous_client_id();
        assert!(b > a);
    }
}
