//! JSON bodies carried by `TunnelOpen`/`TunnelOpenAck`/`TunnelClose` packets.
//!
//! The packet's own `tunnel_id` field identifies which tunnel a body
//! belongs to; these bodies carry everything the rendezvous server and the
//! two clients involved need beyond that: which mapping, which client owns
//! the target, and (on open) the secret key and peer address the owning
//! client's adapter should authorize against.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOpenBody {
    pub mapping_id: String,
    pub secret_key: String,
    pub requester_client_id: String,
    pub receiver_client_id: String,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub peer_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelOpenAckBody {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TunnelOpenAckBody {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            accepted: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelCloseBody {
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_body_round_trips_through_json() {
        let body = TunnelOpenBody {
            mapping_id: "m1".into(),
            secret_key: "s3cr3t".into(),
            requester_client_id: "42".into(),
            receiver_client_id: "43".into(),
            target_host: Some("127.0.0.1".into()),
            target_port: Some(8080),
            peer_addr: "203.0.113.9:51000".into(),
        };
        let json = serde_json::to_string(&body).unwrap();
        let back: TunnelOpenBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mapping_id, "m1");
        assert_eq!(back.target_port, Some(8080));
    }

    #[test]
    fn ack_body_omits_error_when_accepted() {
        let json = serde_json::to_value(TunnelOpenAckBody::accepted()).unwrap();
        assert!(json.get("error").is_none());
    }
}
