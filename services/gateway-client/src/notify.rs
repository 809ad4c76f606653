//! The default `NotificationHandler`: logs every category at a level that
//! matches its severity. Registered with the shared `NotificationDispatcher`
//! at startup; nothing else in this process needs to see raw notifications
//! unless a future handler (a metrics exporter, a UI event feed) is added
//! alongside it — `NotificationDispatcher::register` takes any number of
//! handlers, so that's additive, not a change to this one.

use gw_protocol::notification::{
    CustomPayload, MappingEventPayload, QuotaWarningPayload, SystemMessagePayload,
    TunnelClosedPayload, TunnelErrorPayload, TunnelOpenedPayload,
};
use gw_protocol::GatewayError;
use gw_dispatch::NotificationHandler;
use tracing::{info, warn};

pub struct LoggingNotificationHandler;

impl NotificationHandler for LoggingNotificationHandler {
    fn on_system_message(&self, payload: &SystemMessagePayload) -> Result<(), GatewayError> {
        match payload.severity.as_str() {
            "error" | "critical" => warn!(message = %payload.message, "system message"),
            _ => info!(message = %payload.message, "system message"),
        }
        Ok(())
    }

    fn on_quota_warning(&self, payload: &QuotaWarningPayload) -> Result<(), GatewayError> {
        warn!(
            kind = %payload.quota_kind,
            used = payload.used,
            limit = payload.limit,
            "quota warning"
        );
        Ok(())
    }

    fn on_mapping_event(&self, payload: &MappingEventPayload) -> Result<(), GatewayError> {
        info!(mapping_id = %payload.mapping_id, event = %payload.event, "mapping event");
        Ok(())
    }

    fn on_tunnel_opened(&self, payload: &TunnelOpenedPayload) -> Result<(), GatewayError> {
        info!(tunnel_id = %payload.tunnel_id, mapping_id = %payload.mapping_id, "tunnel opened");
        Ok(())
    }

    fn on_tunnel_closed(&self, payload: &TunnelClosedPayload) -> Result<(), GatewayError> {
        info!(
            tunnel_id = %payload.tunnel_id,
            mapping_id = %payload.mapping_id,
            reason = ?payload.reason,
            bytes_sent = payload.bytes_sent,
            bytes_recv = payload.bytes_recv,
            duration_ms = payload.duration_ms,
            "tunnel closed"
        );
        Ok(())
    }

    fn on_tunnel_error(&self, payload: &TunnelErrorPayload) -> Result<(), GatewayError> {
        warn!(tunnel_id = %payload.tunnel_id, mapping_id = %payload.mapping_id, error = %payload.error, "tunnel error");
        Ok(())
    }

    fn on_custom(&self, payload: &CustomPayload) -> Result<(), GatewayError> {
        info!(sender_id = %payload.sender_id, data = %payload.data, "custom notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_message_handler_accepts_any_severity() {
        let handler = LoggingNotificationHandler;
        let payload = SystemMessagePayload {
            message: "hello".into(),
            severity: "info".into(),
        };
        assert!(handler.on_system_message(&payload).is_ok());
    }
}
