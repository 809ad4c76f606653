//! Trait implemented by anything that wants to observe dispatched
//! notifications. Every method defaults to a no-op so a handler only
//! implements the categories it cares about.

use gw_protocol::notification::{
    CustomPayload, MappingEventPayload, Notification, QuotaWarningPayload, SystemMessagePayload,
    TunnelClosedPayload, TunnelErrorPayload, TunnelOpenedPayload,
};
use gw_protocol::GatewayError;

pub trait NotificationHandler: Send + Sync {
    fn on_system_message(&self, _payload: &SystemMessagePayload) -> Result<(), GatewayError> {
        Ok(())
    }

    fn on_quota_warning(&self, _payload: &QuotaWarningPayload) -> Result<(), GatewayError> {
        Ok(())
    }

    fn on_mapping_event(&self, _payload: &MappingEventPayload) -> Result<(), GatewayError> {
        Ok(())
    }

    fn on_tunnel_opened(&self, _payload: &TunnelOpenedPayload) -> Result<(), GatewayError> {
        Ok(())
    }

    fn on_tunnel_closed(&self, _payload: &TunnelClosedPayload) -> Result<(), GatewayError> {
        Ok(())
    }

    fn on_tunnel_error(&self, _payload: &TunnelErrorPayload) -> Result<(), GatewayError> {
        Ok(())
    }

    fn on_custom(&self, _payload: &CustomPayload) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Anything outside the recognised type-code ranges, or a recognised
    /// range whose payload didn't decode into its expected shape.
    fn on_unrecognized(&self, _notification: &Notification) -> Result<(), GatewayError> {
        Ok(())
    }
}
