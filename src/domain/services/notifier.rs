use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::{
    entities::notification::{NotificationPayload, SubscriptionEvent},
    repositories::notification_repository::{DeviceTokenLookup, NotificationSender},
};

/// Notifications raised by the ledger itself rather than by another user.
const SYSTEM_ACTOR: &str = "system";

/// Best-effort push notifications. Delivery failures are logged and dropped so
/// they never fail the subscription operation that raised them.
#[derive(Clone)]
pub struct Notifier {
    sender: Arc<dyn NotificationSender>,
    tokens: Arc<dyn DeviceTokenLookup>,
}

impl Notifier {
    pub fn new(sender: Arc<dyn NotificationSender>, tokens: Arc<dyn DeviceTokenLookup>) -> Self {
        Self { sender, tokens }
    }

    pub async fn notify(&self, user_id: &str, event: SubscriptionEvent, plan_name: &str) {
        self.send(user_id, NotificationPayload::for_event(event, plan_name))
            .await
    }

    pub async fn send(&self, user_id: &str, payload: NotificationPayload) {
        let tokens = self.tokens.get_device_tokens(user_id).await;
        match self
            .sender
            .send_custom_notification(user_id, SYSTEM_ACTOR, &tokens, &payload)
            .await
        {
            Ok(()) => debug!(user_id, action = %payload.action, "notification dispatched"),
            Err(e) => warn!(
                user_id,
                action = %payload.action,
                error = %e,
                "notification delivery failed"
            ),
        }
    }
}
