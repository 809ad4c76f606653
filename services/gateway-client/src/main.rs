// gateway-client: maintains the control connection to gateway-server, runs
// one accept loop per configured mapping, and terminates tunnels a peer
// dials through this client (the egress side of another client's mapping).

use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use gateway_client::client::{ClientContext, ClientSurface, OpenedTunnel};
use gateway_client::config;
use gateway_client::dispatch_commands;
use gateway_client::mapping;
use gateway_client::notify::LoggingNotificationHandler;
use gw_dispatch::NotificationDispatcher;
use gw_tunnel::{BufferPool, Tunnel};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "gateway-client starting");

    let cfg = match config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    run(cfg).await;
    info!("gateway-client shut down");
}

async fn run(cfg: config::ClientConfig) {
    let dispatcher = Arc::new(NotificationDispatcher::new());
    dispatcher.register(Arc::new(LoggingNotificationHandler)).await;

    let mappings = cfg.mappings.clone();
    let (client, inbound_commands, incoming_tunnels) = ClientSurface::new(cfg, dispatcher);
    let client = Arc::new(client);

    let control_handle = tokio::spawn(client.clone().run());

    let pool = Arc::new(BufferPool::new(256, gw_tunnel::DEFAULT_BUF_SIZE));
    let live_mappings = Arc::new(DashMap::new());
    for mapping in mappings {
        let mapping_id = mapping.mapping_id.clone();
        let handle = mapping::spawn(mapping, (*client).clone(), pool.clone());
        live_mappings.insert(mapping_id, handle);
    }

    let incoming_handle = tokio::spawn(handle_incoming_tunnels(incoming_tunnels, (*client).clone(), pool.clone()));
    let supervisor_handle = tokio::spawn(dispatch_commands::run(
        inbound_commands,
        (*client).clone(),
        pool,
        live_mappings.clone(),
    ));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
        kicked = supervisor_handle => {
            match kicked {
                Ok(true) => warn!("disconnecting: kicked by server"),
                Ok(false) => warn!("mapping supervisor exited unexpectedly"),
                Err(e) => error!(error = %e, "mapping supervisor task panicked"),
            }
        }
    }

    control_handle.abort();
    incoming_handle.abort();
    for entry in live_mappings.iter() {
        entry.value().shutdown();
    }

    let ClientContext { client_id, .. } = client.get_context().await;
    info!(client_id, "gateway-client stopped");
}

/// Terminate tunnels a peer opened through this client: dial the target the
/// peer told us about and pump bytes until either side closes.
async fn handle_incoming_tunnels(
    mut incoming: tokio::sync::mpsc::UnboundedReceiver<OpenedTunnel>,
    client: ClientSurface,
    pool: Arc<BufferPool>,
) {
    while let Some(opened) = incoming.recv().await {
        tokio::spawn(serve_incoming_tunnel(opened, client.clone(), pool.clone()));
    }
}

async fn serve_incoming_tunnel(opened: OpenedTunnel, client: ClientSurface, pool: Arc<BufferPool>) {
    let (Some(host), Some(port)) = (opened.target_host.as_deref(), opened.target_port) else {
        warn!(tunnel_id = %opened.tunnel_id, "incoming tunnel has no target, dropping");
        return;
    };

    let target = match TcpStream::connect((host, port)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(tunnel_id = %opened.tunnel_id, target = %format!("{host}:{port}"), error = %e, "failed to dial egress target");
            return;
        }
    };
    let _ = target.set_nodelay(true);

    let tunnel = Tunnel::new(opened.tunnel_id.clone(), opened.mapping_id.clone());
    tunnel.mark_connected();
    let report = tunnel
        .serve_cancelable(target, opened.channel, pool, None, None, opened.cancel)
        .await;
    if report.notify {
        let _ = client.send_tunnel_close_notify(&opened.tunnel_id, report.reason).await;
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
