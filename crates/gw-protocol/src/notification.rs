//! Server→client notification taxonomy.
//!
//! Notification types are numeric codes, grouped into ranges: system
//! (1–19), mapping (20–39), tunnel (40–59), custom (>=100). A notification
//! carries its numeric `type_code` plus a JSON payload whose shape is fixed
//! per type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SYSTEM_MESSAGE: u32 = 1;
pub const QUOTA_WARNING: u32 = 2;

pub const MAPPING_EVENT: u32 = 20;

pub const TUNNEL_OPENED: u32 = 40;
pub const TUNNEL_CLOSED: u32 = 41;
pub const TUNNEL_ERROR: u32 = 42;

pub const CUSTOM_RANGE_START: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationCategory {
    System,
    Mapping,
    Tunnel,
    Custom,
    Generic,
}

/// Classify a raw type code into its dispatch category.
pub fn category_of(type_code: u32) -> NotificationCategory {
    match type_code {
        1..=19 => NotificationCategory::System,
        20..=39 => NotificationCategory::Mapping,
        40..=59 => NotificationCategory::Tunnel,
        c if c >= CUSTOM_RANGE_START => NotificationCategory::Custom,
        _ => NotificationCategory::Generic,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub type_code: u32,
    pub payload: Value,
}

impl Notification {
    pub fn new(type_code: u32, payload: Value) -> Self {
        Self { type_code, payload }
    }

    pub fn category(&self) -> NotificationCategory {
        category_of(self.type_code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMessagePayload {
    pub message: String,
    pub severity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaWarningPayload {
    pub quota_kind: String,
    pub used: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingEventPayload {
    pub mapping_id: String,
    pub event: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOpenedPayload {
    pub tunnel_id: String,
    pub mapping_id: String,
}

/// Close reason as classified by the tunnel lifecycle engine; see
/// `gw-tunnel::reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Normal,
    PeerClosed,
    NetworkError,
    Timeout,
    Closed,
    Error,
    LocalClosed,
    ContextCanceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelClosedPayload {
    pub tunnel_id: String,
    pub mapping_id: String,
    pub reason: CloseReason,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelErrorPayload {
    pub tunnel_id: String,
    pub mapping_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomPayload {
    pub sender_id: String,
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ranges_correctly() {
        assert_eq!(category_of(SYSTEM_MESSAGE), NotificationCategory::System);
        assert_eq!(category_of(QUOTA_WARNING), NotificationCategory::System);
        assert_eq!(category_of(MAPPING_EVENT), NotificationCategory::Mapping);
        assert_eq!(category_of(TUNNEL_OPENED), NotificationCategory::Tunnel);
        assert_eq!(category_of(TUNNEL_CLOSED), NotificationCategory::Tunnel);
        assert_eq!(category_of(150), NotificationCategory::Custom);
        assert_eq!(category_of(60), NotificationCategory::Generic);
    }

    #[test]
    fn tunnel_closed_payload_round_trips() {
        let payload = TunnelClosedPayload {
            tunnel_id: "t1".into(),
            mapping_id: "m1".into(),
            reason: CloseReason::PeerClosed,
            bytes_sent: 5,
            bytes_recv: 5,
            duration_ms: 120,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["reason"], "peer_closed");
    }
}
