pub mod config;
pub mod connection;
pub mod state;

pub use config::ServerConfig;
pub use state::AppState;
