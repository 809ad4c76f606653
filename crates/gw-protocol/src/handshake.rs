//! Handshake request/response carried in `Handshake` packets.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Kcp,
    Quic,
    Ws,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub client_id: i64,
    pub protocol: TransportProtocol,
    pub token: String,
}

impl HandshakeRequest {
    /// `client_id == 0` or a `token` prefixed with `"anonymous:"` marks
    /// anonymous mode, in which the server assigns a fresh client id.
    pub fn is_anonymous(&self) -> bool {
        self.client_id == 0 || self.token.starts_with("anonymous:")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HandshakeResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            error: None,
            message: Some(message.into()),
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_zero_is_anonymous() {
        let req = HandshakeRequest {
            client_id: 0,
            protocol: TransportProtocol::Tcp,
            token: "whatever".into(),
        };
        assert!(req.is_anonymous());
    }

    #[test]
    fn anonymous_token_prefix_is_anonymous() {
        let req = HandshakeRequest {
            client_id: 42,
            protocol: TransportProtocol::Ws,
            token: "anonymous:abc".into(),
        };
        assert!(req.is_anonymous());
    }

    #[test]
    fn authenticated_request_is_not_anonymous() {
        let req = HandshakeRequest {
            client_id: 42,
            protocol: TransportProtocol::Tcp,
            token: "real-token".into(),
        };
        assert!(!req.is_anonymous());
    }
}
