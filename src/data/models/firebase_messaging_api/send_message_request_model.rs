use std::collections::BTreeMap;

use serde::Serialize;

/// Body of projects.messages.send.
///
/// https://firebase.google.com/docs/reference/fcm/rest/v1/projects.messages/send
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SendMessageRequestModel<'a> {
    /// Message to send.
    pub(crate) message: MessageModel<'a>,
}

/// https://firebase.google.com/docs/reference/fcm/rest/v1/projects.messages#Message
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessageModel<'a> {
    /// Registration token to send a message to.
    pub(crate) token: &'a str,
    /// Basic notification template to use across all platforms.
    pub(crate) notification: NotificationModel<'a>,
    /// Arbitrary key/value payload, which must be UTF-8 encoded. Values must
    /// be strings.
    pub(crate) data: &'a BTreeMap<String, String>,
}

/// https://firebase.google.com/docs/reference/fcm/rest/v1/projects.messages#Notification
#[derive(Debug, Serialize)]
pub(crate) struct NotificationModel<'a> {
    /// The notification's title.
    pub(crate) title: &'a str,
    /// The notification's body text.
    pub(crate) body: &'a str,
}
