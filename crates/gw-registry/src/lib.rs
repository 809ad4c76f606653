//! Session and tunnel registries shared by the gateway server: which
//! client owns which control connection, and which tunnel_id is already
//! live.

pub mod connection;
pub mod session_registry;
pub mod tunnel_manager;

pub use connection::ControlConnection;
pub use session_registry::SessionRegistry;
pub use tunnel_manager::TunnelManager;
