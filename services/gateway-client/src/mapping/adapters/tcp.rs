//! TCP adapter: binds `127.0.0.1:local_port` (IPv4 only, matching the rest
//! of this workspace's loopback-only local listeners) and accepts
//! connections until cancelled.
//!
//! Nagle is disabled on every accepted socket. TCP keepalive and the 512
//! KiB send/recv buffer hint are not applied: both need `socket2`, which
//! isn't part of this workspace's dependency stack, so they're left at the
//! platform default rather than pulling in a crate with no other use here.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tracing::warn;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct TcpAdapter {
    listener: TcpListener,
}

impl TcpAdapter {
    pub async fn bind(local_port: u16) -> std::io::Result<Self> {
        let addr: SocketAddr = SocketAddr::from(([127, 0, 0, 1], local_port));
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Accept connections until `cancel` fires, pushing each one (with its
    /// peer address) to `conns`. A transient accept error backs off briefly
    /// and retries rather than tearing the loop down.
    pub async fn run(&self, conns: mpsc::Sender<(TcpStream, SocketAddr)>, mut cancel: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!(error = %e, "failed to disable Nagle on accepted socket");
                            }
                            if conns.send((stream, peer_addr)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "tcp accept error, backing off");
                            sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }
}
