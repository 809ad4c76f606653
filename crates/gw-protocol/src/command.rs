//! The structured message carried inside a `JsonCommand` packet.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// The closed set of recognised command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Connect,
    Disconnect,
    Heartbeat,
    /// Sent by the registry to evict a connection superseded by a duplicate
    /// login; body carries `{"reason": ..., "code": "DUPLICATE_LOGIN"}`.
    Kick,
    MappingCreate,
    MappingUpdate,
    MappingDelete,
    MappingList,
    TunnelOpen,
    TunnelOpenAck,
    TunnelClose,
    Transfer,
    ConfigGet,
    ConfigSet,
    Rpc,
}

/// A structured message inside a `JsonCommand` packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_type: CommandType,
    pub command_id: String,
    pub token: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: Value,
}

impl Command {
    pub fn new(
        command_type: CommandType,
        command_id: impl Into<String>,
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
    ) -> Self {
        Self {
            command_type,
            command_id: command_id.into(),
            token: String::new(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            body: Value::Null,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Validate the non-empty-id invariants from the data model.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.command_id.is_empty() {
            return Err(GatewayError::ValidationError(
                "command_id must not be empty".into(),
            ));
        }
        if self.sender_id.is_empty() {
            return Err(GatewayError::ValidationError(
                "sender_id must not be empty".into(),
            ));
        }
        if self.receiver_id.is_empty() {
            return Err(GatewayError::ValidationError(
                "receiver_id must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn kick(command_id: impl Into<String>, sender_id: impl Into<String>, receiver_id: impl Into<String>) -> Self {
        Self::new(CommandType::Kick, command_id, sender_id, receiver_id).with_body(
            serde_json::json!({
                "reason": "Another client logged in with the same ID",
                "code": "DUPLICATE_LOGIN",
            }),
        )
    }

    /// As [`Command::kick`], but for a connection evicted to make room under
    /// the registry's connection cap rather than a duplicate login.
    pub fn kick_for_capacity(
        command_id: impl Into<String>,
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
    ) -> Self {
        Self::new(CommandType::Kick, command_id, sender_id, receiver_id).with_body(
            serde_json::json!({
                "reason": "Connection registry is at capacity",
                "code": "CONNECTION_CAP_REACHED",
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kick_command_carries_duplicate_login_code() {
        let cmd = Command::kick("c1", "registry", "old-conn");
        assert_eq!(cmd.command_type, CommandType::Kick);
        assert_eq!(cmd.body["code"], "DUPLICATE_LOGIN");
    }

    #[test]
    fn kick_for_capacity_carries_its_own_code() {
        let cmd = Command::kick_for_capacity("c1", "registry", "old-conn");
        assert_eq!(cmd.command_type, CommandType::Kick);
        assert_eq!(cmd.body["code"], "CONNECTION_CAP_REACHED");
    }

    #[test]
    fn validate_rejects_empty_ids() {
        let cmd = Command::new(CommandType::Heartbeat, "", "s", "r");
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn command_round_trips_through_json() {
        let cmd = Command::new(CommandType::MappingCreate, "id1", "s1", "r1")
            .with_token("tok")
            .with_body(serde_json::json!({"mapping_id": "m1"}));
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back.command_type, CommandType::MappingCreate);
        assert_eq!(back.body["mapping_id"], "m1");
    }
}
