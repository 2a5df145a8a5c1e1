use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use tracing::{debug, info, warn};

use crate::{
    constants::FIREBASE_MESSAGING_API_URL,
    data::models::firebase_messaging_api::send_message_request_model::{
        MessageModel, NotificationModel, SendMessageRequestModel,
    },
    domain::{
        entities::notification::NotificationPayload,
        repositories::notification_repository::NotificationSender,
    },
    errors::{StorefrontApi, StorefrontError},
};

use super::{google_auth::GoogleAccessToken, utils::HTTP_CLIENT};

const API: StorefrontApi = StorefrontApi::FirebaseMessagingApi;

/// Push delivery through Firebase Cloud Messaging HTTP v1:
/// https://firebase.google.com/docs/reference/fcm/rest/v1/projects.messages/send
///
/// One request per device token. The send only fails when every token
/// failed.
pub(crate) struct FirebaseMessagingDatasourceImpl {
    base_url: String,
    project_id: String,
    access_token: GoogleAccessToken,
}

#[async_trait]
impl NotificationSender for FirebaseMessagingDatasourceImpl {
    async fn send_custom_notification(
        &self,
        recipient_id: &str,
        actor_id: &str,
        device_tokens: &[String],
        payload: &NotificationPayload,
    ) -> Result<(), StorefrontError> {
        if device_tokens.is_empty() {
            debug!(recipient_id, action = %payload.action, "no device tokens; skipping push");
            return Ok(());
        }

        let mut data = payload.data.clone();
        data.insert("type".to_owned(), payload.kind.clone());
        data.insert("action".to_owned(), payload.action.clone());
        data.insert("receiverUserId".to_owned(), recipient_id.to_owned());
        data.insert("senderUserId".to_owned(), actor_id.to_owned());

        let mut last_error = None;
        let mut delivered = 0usize;
        for token in device_tokens {
            let body = SendMessageRequestModel {
                message: MessageModel {
                    token,
                    notification: NotificationModel {
                        title: &payload.title,
                        body: &payload.body,
                    },
                    data: &data,
                },
            };
            match self.send_message(&body).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(recipient_id, error = %e, "push delivery to one device failed");
                    last_error = Some(e);
                }
            }
        }

        info!(
            recipient_id,
            action = %payload.action,
            delivered,
            token_count = device_tokens.len(),
            "push notification sent"
        );
        match last_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(()),
        }
    }
}

impl FirebaseMessagingDatasourceImpl {
    pub(crate) fn new(project_id: String, access_token: GoogleAccessToken) -> Self {
        Self::with_base_url(FIREBASE_MESSAGING_API_URL.to_owned(), project_id, access_token)
    }

    pub(crate) fn with_base_url(
        base_url: String,
        project_id: String,
        access_token: GoogleAccessToken,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            project_id,
            access_token,
        }
    }

    async fn send_message(&self, body: &SendMessageRequestModel<'_>) -> Result<(), StorefrontError> {
        let function_name = "projects.messages.send";
        let url = format!("{}/projects/{}/messages:send", self.base_url, self.project_id);
        let response = HTTP_CLIENT
            .post(url)
            .header(
                AUTHORIZATION,
                format!("Bearer {}", self.access_token.bearer().await?),
            )
            .json(body)
            .send()
            .await
            .map_err(|e| {
                StorefrontError::callout_with_debug(API, function_name, "callout failed to send", &e)
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(StorefrontError::status(
                API,
                function_name,
                status,
                response.text().await.unwrap_or_default(),
            ));
        }
        Ok(())
    }
}

/// Stand-in sender for deployments without Firebase credentials.
pub(crate) struct LoggingNotificationSender;

#[async_trait]
impl NotificationSender for LoggingNotificationSender {
    async fn send_custom_notification(
        &self,
        recipient_id: &str,
        _actor_id: &str,
        device_tokens: &[String],
        payload: &NotificationPayload,
    ) -> Result<(), StorefrontError> {
        info!(
            recipient_id,
            action = %payload.action,
            title = %payload.title,
            token_count = device_tokens.len(),
            "push delivery not configured; notification logged only"
        );
        Ok(())
    }
}
