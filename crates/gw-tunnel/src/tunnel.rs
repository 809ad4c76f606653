//! A single established tunnel: the thing a mapping handler opens once a
//! local connection needs to ride the control connection to the peer.
//!
//! A `Tunnel` owns nothing but its identity and lifecycle state; the actual
//! byte transport is handed to `serve`/`serve_cancelable` as two generic
//! `AsyncRead + AsyncWrite` endpoints (the local socket and the tunnel data
//! stream demuxed out of the control connection). This keeps `Tunnel` free
//! of any dependency on what kind of socket it is carrying, per the
//! "interface, not struct, at the transport seam" design note.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use gw_protocol::notification::TunnelClosedPayload;
use gw_transform::TokenBucket;

use crate::buffer_pool::BufferPool;
use crate::pump::{pump_bidirectional, PumpOutcome};
use crate::reason::{self, CloseReason};
use crate::state::{TunnelState, TunnelStateCell};

pub struct TunnelCloseReport {
    pub reason: CloseReason,
    pub notify: bool,
    pub payload: TunnelClosedPayload,
}

pub struct Tunnel {
    id: String,
    mapping_id: String,
    state: TunnelStateCell,
}

impl Tunnel {
    pub fn new(id: impl Into<String>, mapping_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mapping_id: mapping_id.into(),
            state: TunnelStateCell::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mapping_id(&self) -> &str {
        &self.mapping_id
    }

    pub fn state(&self) -> TunnelState {
        self.state.get()
    }

    /// Connecting -> Connected, once `TunnelOpenAck` has been received (or,
    /// on the server side, once the local dial has succeeded).
    pub fn mark_connected(&self) -> bool {
        self.state.start()
    }

    /// Whether this call won the race to tear the tunnel down. Safe to call
    /// from a command handler (e.g. a `TunnelClose` from the peer) racing
    /// against the pump's own natural EOF.
    pub fn begin_close(&self) -> bool {
        self.state.begin_close()
    }

    /// Pump bytes until both directions finish, then classify the close and
    /// report it. Does not itself decide whether to notify the peer; the
    /// caller forwards `report.payload` only if `report.notify` is true.
    pub async fn serve<A, B>(
        &self,
        local: A,
        remote: B,
        pool: Arc<BufferPool>,
        limiter_send: Option<Arc<TokenBucket>>,
        limiter_recv: Option<Arc<TokenBucket>>,
    ) -> TunnelCloseReport
    where
        A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let started = Instant::now();
        let outcome = pump_bidirectional(local, remote, pool, limiter_send, limiter_recv).await;
        self.finish(started, outcome)
    }

    /// As `serve`, but the pump is raced against `cancel` firing (e.g. a
    /// `TunnelClose` command arriving on the control connection mid-flight).
    /// If `cancel` fires first the report is classified as `ContextCanceled`
    /// and the underlying endpoints are dropped, tearing the connection down
    /// rather than waiting for a natural EOF.
    pub async fn serve_cancelable<A, B>(
        &self,
        local: A,
        remote: B,
        pool: Arc<BufferPool>,
        limiter_send: Option<Arc<TokenBucket>>,
        limiter_recv: Option<Arc<TokenBucket>>,
        mut cancel: watch::Receiver<bool>,
    ) -> TunnelCloseReport
    where
        A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.changed() => PumpOutcome {
                bytes_sent: 0,
                bytes_recv: 0,
                send_err: Some("context canceled".to_string()),
                recv_err: Some("context canceled".to_string()),
            },
            outcome = pump_bidirectional(local, remote, pool, limiter_send, limiter_recv) => outcome,
        };
        self.finish(started, outcome)
    }

    fn finish(&self, started: Instant, outcome: PumpOutcome) -> TunnelCloseReport {
        self.begin_close();
        let reason = reason::classify(outcome.send_err.as_deref(), outcome.recv_err.as_deref());
        self.state.finish_close();
        let payload = TunnelClosedPayload {
            tunnel_id: self.id.clone(),
            mapping_id: self.mapping_id.clone(),
            reason,
            bytes_sent: outcome.bytes_sent,
            bytes_recv: outcome.bytes_recv,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        TunnelCloseReport {
            reason,
            notify: reason::should_notify(reason),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn serve_reports_normal_close_on_clean_eof() {
        let tunnel = Tunnel::new("t1", "m1");
        assert!(tunnel.mark_connected());

        let (local, mut local_peer) = duplex(4096);
        let (remote, mut remote_peer) = duplex(4096);
        let pool = Arc::new(BufferPool::new(4, 1024));

        let handle = tokio::spawn({
            let tunnel = Arc::new(tunnel);
            let tunnel2 = tunnel.clone();
            async move { (tunnel2.serve(local, remote, pool, None, None).await, tunnel) }
        });

        local_peer.shutdown().await.unwrap();
        remote_peer.shutdown().await.unwrap();

        let (report, tunnel) = handle.await.unwrap();
        assert_eq!(report.reason, CloseReason::Normal);
        assert!(report.notify);
        assert_eq!(tunnel.state(), TunnelState::Closed);
    }

    #[tokio::test]
    async fn serve_cancelable_reports_context_canceled() {
        let tunnel = Tunnel::new("t2", "m1");
        tunnel.mark_connected();

        let (local, _local_peer) = duplex(4096);
        let (remote, _remote_peer) = duplex(4096);
        let pool = Arc::new(BufferPool::new(4, 1024));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            tunnel
                .serve_cancelable(local, remote, pool, None, None, rx)
                .await
        });

        tx.send(true).unwrap();
        let report = handle.await.unwrap();
        assert_eq!(report.reason, CloseReason::ContextCanceled);
        assert!(!report.notify);
    }
}
