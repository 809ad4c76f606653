//! gateway-client: the process that lives behind a NAT/firewall, holds the
//! single control connection to `gateway-server`, and terminates every
//! tunnel this client is party to — both tunnels it dials (its own
//! configured mappings) and tunnels a peer dials through it.
//!
//! Exposes modules for integration testing.

pub mod client;
pub mod config;
pub mod dispatch_commands;
pub mod mapping;
pub mod notify;
pub mod tunnel_channel;
