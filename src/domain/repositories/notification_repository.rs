use async_trait::async_trait;

use crate::{domain::entities::notification::NotificationPayload, errors::StorefrontError};

/// Push delivery to a user's devices.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_custom_notification(
        &self,
        recipient_id: &str,
        actor_id: &str,
        device_tokens: &[String],
        payload: &NotificationPayload,
    ) -> Result<(), StorefrontError>;
}

/// Where a user's push tokens live.
#[async_trait]
pub trait DeviceTokenLookup: Send + Sync {
    /// Empty when the user has none or cannot be found.
    async fn get_device_tokens(&self, user_id: &str) -> Vec<String>;
}
