use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use gateway_server::config::{self, ServerConfig};
use gateway_server::connection;
use gateway_server::AppState;
use gw_storage::{HybridStore, Janitor, SqliteBackend};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "gateway-server starting");

    let cfg = match config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cfg).await {
        error!(error = %e, "gateway-server exited with an error");
        std::process::exit(1);
    }
    info!("gateway-server shut down gracefully");
}

async fn run(cfg: ServerConfig) -> std::io::Result<()> {
    let backend = match &cfg.storage_path {
        Some(path) => SqliteBackend::open(std::path::Path::new(path))
            .map_err(|e| std::io::Error::other(e.to_string()))?,
        None => {
            warn!("no storage_path configured, mapping state will not survive a restart");
            SqliteBackend::open_in_memory().map_err(|e| std::io::Error::other(e.to_string()))?
        }
    };
    let store = Arc::new(HybridStore::new(Arc::new(backend)));
    let state = AppState::new(store.clone(), cfg.max_connections)
        .with_user_quota_defaults(cfg.default_user_byte_limit, cfg.default_user_connection_limit);

    let janitor = Janitor::new(store, cfg.storage_sweep_interval).spawn();

    let registry = state.registry.clone();
    let heartbeat_timeout = cfg.heartbeat_timeout;
    let cleanup_interval = cfg.stale_cleanup_interval;
    let cleanup_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        loop {
            ticker.tick().await;
            let stale = registry.cleanup_stale(heartbeat_timeout).await;
            for conn in &stale {
                warn!(client_id = %conn.client_id, "dropping connection for missed heartbeats");
            }
        }
    });

    let listener = TcpListener::bind(&cfg.bind).await?;
    info!(addr = %cfg.bind, "gateway-server listening");

    let permits = Arc::new(Semaphore::new(cfg.max_connections));

    tokio::select! {
        _ = accept_loop(listener, state, cfg.handshake_timeout, cfg.heartbeat_timeout, permits) => {}
        _ = shutdown_signal() => {
            info!("shutdown signal received, no longer accepting new connections");
        }
    }

    cleanup_handle.abort();
    janitor.abort();
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    state: AppState,
    handshake_timeout: std::time::Duration,
    heartbeat_timeout: std::time::Duration,
    permits: Arc<Semaphore>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed, continuing");
                continue;
            }
        };

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };

        let state = state.clone();
        tokio::spawn(async move {
            info!(peer = %peer, "accepted connection");
            connection::handle_connection(stream, state, handshake_timeout, heartbeat_timeout).await;
            drop(permit);
        });
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
