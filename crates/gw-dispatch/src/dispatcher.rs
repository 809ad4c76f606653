//! The notification dispatcher: classify, decode, fan out.
//!
//! `dispatch` does three things in order: (1) classify the notification's
//! type code into a category, (2) decode its JSON payload into the typed
//! struct that category expects, (3) call every registered handler's
//! matching method. A handler that returns an error only logs — it never
//! stops the remaining handlers from seeing the notification, and it never
//! propagates back to whatever produced the notification in the first
//! place.

use std::sync::Arc;

use tokio::sync::RwLock;

use gw_protocol::notification::{
    self, CustomPayload, MappingEventPayload, Notification, NotificationCategory,
    QuotaWarningPayload, SystemMessagePayload, TunnelClosedPayload, TunnelErrorPayload,
    TunnelOpenedPayload,
};
use gw_protocol::GatewayError;

use crate::handler::NotificationHandler;

pub struct NotificationDispatcher {
    handlers: RwLock<Vec<Arc<dyn NotificationHandler>>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(&self, handler: Arc<dyn NotificationHandler>) {
        self.handlers.write().await.push(handler);
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn dispatch(&self, notification: Notification) {
        let category = notification.category();
        let handlers = self.handlers.read().await;

        for handler in handlers.iter() {
            let result = Self::deliver(handler.as_ref(), category, &notification);
            if let Err(err) = result {
                tracing::warn!(
                    type_code = notification.type_code,
                    error = %err,
                    "notification handler failed"
                );
            }
        }
    }

    fn deliver(
        handler: &dyn NotificationHandler,
        category: NotificationCategory,
        notification: &Notification,
    ) -> Result<(), GatewayError> {
        let decode_err = |e: serde_json::Error| {
            GatewayError::ValidationError(format!("undecodable notification payload: {e}"))
        };

        match category {
            NotificationCategory::System => match notification.type_code {
                notification::SYSTEM_MESSAGE => {
                    let payload: SystemMessagePayload =
                        serde_json::from_value(notification.payload.clone()).map_err(decode_err)?;
                    handler.on_system_message(&payload)
                }
                notification::QUOTA_WARNING => {
                    let payload: QuotaWarningPayload =
                        serde_json::from_value(notification.payload.clone()).map_err(decode_err)?;
                    handler.on_quota_warning(&payload)
                }
                _ => handler.on_unrecognized(notification),
            },
            NotificationCategory::Mapping => {
                let payload: MappingEventPayload =
                    serde_json::from_value(notification.payload.clone()).map_err(decode_err)?;
                handler.on_mapping_event(&payload)
            }
            NotificationCategory::Tunnel => match notification.type_code {
                notification::TUNNEL_OPENED => {
                    let payload: TunnelOpenedPayload =
                        serde_json::from_value(notification.payload.clone()).map_err(decode_err)?;
                    handler.on_tunnel_opened(&payload)
                }
                notification::TUNNEL_CLOSED => {
                    let payload: TunnelClosedPayload =
                        serde_json::from_value(notification.payload.clone()).map_err(decode_err)?;
                    handler.on_tunnel_closed(&payload)
                }
                notification::TUNNEL_ERROR => {
                    let payload: TunnelErrorPayload =
                        serde_json::from_value(notification.payload.clone()).map_err(decode_err)?;
                    handler.on_tunnel_error(&payload)
                }
                _ => handler.on_unrecognized(notification),
            },
            NotificationCategory::Custom => {
                let payload: CustomPayload =
                    serde_json::from_value(notification.payload.clone()).map_err(decode_err)?;
                handler.on_custom(&payload)
            }
            NotificationCategory::Generic => handler.on_unrecognized(notification),
        }
    }
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingHandler {
        tunnel_closed: AtomicUsize,
        last_reason: Mutex<Option<String>>,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                tunnel_closed: AtomicUsize::new(0),
                last_reason: Mutex::new(None),
            }
        }
    }

    impl NotificationHandler for RecordingHandler {
        fn on_tunnel_closed(&self, payload: &TunnelClosedPayload) -> Result<(), GatewayError> {
            self.tunnel_closed.fetch_add(1, Ordering::SeqCst);
            *self.last_reason.lock().unwrap() = Some(format!("{:?}", payload.reason));
            Ok(())
        }
    }

    struct FailingHandler;
    impl NotificationHandler for FailingHandler {
        fn on_tunnel_closed(&self, _payload: &TunnelClosedPayload) -> Result<(), GatewayError> {
            Err(GatewayError::Internal("boom".into()))
        }
    }

    #[tokio::test]
    async fn dispatch_routes_tunnel_closed_to_handler() {
        let dispatcher = NotificationDispatcher::new();
        let handler = Arc::new(RecordingHandler::new());
        dispatcher.register(handler.clone()).await;

        let payload = TunnelClosedPayload {
            tunnel_id: "t1".into(),
            mapping_id: "m1".into(),
            reason: notification::CloseReason::Normal,
            bytes_sent: 10,
            bytes_recv: 20,
            duration_ms: 5,
        };
        let notification = Notification::new(
            notification::TUNNEL_CLOSED,
            serde_json::to_value(&payload).unwrap(),
        );
        dispatcher.dispatch(notification).await;

        assert_eq!(handler.tunnel_closed.load(Ordering::SeqCst), 1);
        assert_eq!(
            handler.last_reason.lock().unwrap().as_deref(),
            Some("Normal")
        );
    }

    #[tokio::test]
    async fn a_failing_handler_does_not_block_others() {
        let dispatcher = NotificationDispatcher::new();
        dispatcher.register(Arc::new(FailingHandler)).await;
        let recording = Arc::new(RecordingHandler::new());
        dispatcher.register(recording.clone()).await;

        let payload = TunnelClosedPayload {
            tunnel_id: "t1".into(),
            mapping_id: "m1".into(),
            reason: notification::CloseReason::Timeout,
            bytes_sent: 0,
            bytes_recv: 0,
            duration_ms: 0,
        };
        let notification = Notification::new(
            notification::TUNNEL_CLOSED,
            serde_json::to_value(&payload).unwrap(),
        );
        dispatcher.dispatch(notification).await;

        assert_eq!(recording.tunnel_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unrecognized_type_code_falls_through() {
        let dispatcher = NotificationDispatcher::new();
        struct CatchAll(AtomicUsize);
        impl NotificationHandler for CatchAll {
            fn on_unrecognized(&self, _n: &Notification) -> Result<(), GatewayError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        let handler = Arc::new(CatchAll(AtomicUsize::new(0)));
        dispatcher.register(handler.clone()).await;
        dispatcher
            .dispatch(Notification::new(75, serde_json::json!({})))
            .await;
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    }
}
