//! Close-reason classification from the pump's observed I/O errors.

pub use gw_protocol::notification::CloseReason;

/// Classify a tunnel's close from its two directions' terminal errors, per
/// the observation table: EOF/closed-pipe is a peer close, reset/broken
/// pipe is a network error, timeout/deadline text is a timeout, "use of
/// closed" is a closed-transport race, anything else is a bare error, and
/// no error on either side is a normal close.
pub fn classify(send_err: Option<&str>, recv_err: Option<&str>) -> CloseReason {
    if send_err.is_none() && recv_err.is_none() {
        return CloseReason::Normal;
    }
    for err in [send_err, recv_err].into_iter().flatten() {
        let lower = err.to_lowercase();
        if lower.contains("eof") || lower.contains("closed pipe") {
            return CloseReason::PeerClosed;
        }
        if lower.contains("connection reset") || lower.contains("broken pipe") {
            return CloseReason::NetworkError;
        }
        if lower.contains("timeout") || lower.contains("deadline exceeded") {
            return CloseReason::Timeout;
        }
        if lower.contains("use of closed") {
            return CloseReason::Closed;
        }
        if lower.contains("canceled") || lower.contains("cancelled") {
            return CloseReason::ContextCanceled;
        }
    }
    CloseReason::Error
}

/// Whether a `TunnelClosed` notification should be emitted for this reason.
/// `PeerClosed` and `ContextCanceled` are excluded — the peer already knows.
pub fn should_notify(reason: CloseReason) -> bool {
    !matches!(reason, CloseReason::PeerClosed | CloseReason::ContextCanceled)
}
