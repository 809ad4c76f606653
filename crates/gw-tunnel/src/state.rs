//! Tunnel state machine.
//!
//! ```text
//! Connecting --start()--> Connected --close(reason)--> Closing --> Closed
//!                            |                                       ^
//!                            +--notify_peer_closed--> Closing --------+
//! ```
//!
//! Transitions are guarded by a single CAS on the underlying atomic; only
//! the caller that wins the `Connected|Connecting -> Closing` race runs
//! teardown. `Closed` is terminal.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelState {
    Connecting = 0,
    Connected = 1,
    Closing = 2,
    Closed = 3,
}

impl TunnelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TunnelState::Connecting,
            1 => TunnelState::Connected,
            2 => TunnelState::Closing,
            _ => TunnelState::Closed,
        }
    }
}

pub struct TunnelStateCell(AtomicU8);

impl TunnelStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(TunnelState::Connecting as u8))
    }

    pub fn get(&self) -> TunnelState {
        TunnelState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Connecting -> Connected. No-op (returns false) if already past
    /// Connecting.
    pub fn start(&self) -> bool {
        self.0
            .compare_exchange(
                TunnelState::Connecting as u8,
                TunnelState::Connected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Attempt the `{Connecting,Connected} -> Closing` transition. Returns
    /// `true` only for the caller that wins the race — every other
    /// (concurrent or later) call returns `false` and must not run
    /// teardown again.
    pub fn begin_close(&self) -> bool {
        loop {
            let current = self.0.load(Ordering::SeqCst);
            match TunnelState::from_u8(current) {
                TunnelState::Closing | TunnelState::Closed => return false,
                _ => {
                    if self
                        .0
                        .compare_exchange(
                            current,
                            TunnelState::Closing as u8,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        return true;
                    }
                }
            }
        }
    }

    /// Closing -> Closed. Called once by the winner of `begin_close` after
    /// both directions' teardown has completed.
    pub fn finish_close(&self) {
        self.0.store(TunnelState::Closed as u8, Ordering::SeqCst);
    }
}

impl Default for TunnelStateCell {
    fn default() -> Self {
        Self::new()
    }
}
