#![allow(dead_code)]

use serde::Deserialize;
use serde_repr::Deserialize_repr;

use super::common::Environment;

/// Get All Subscription Statuses response.
///
/// https://developer.apple.com/documentation/appstoreserverapi/statusresponse
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusResponseModel {
    /// One entry per subscription group.
    #[serde(default)]
    pub(crate) data: Vec<SubscriptionGroupIdentifierItem>,
    pub(crate) environment: Option<Environment>,
    pub(crate) bundle_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubscriptionGroupIdentifierItem {
    pub(crate) subscription_group_identifier: String,
    #[serde(default)]
    pub(crate) last_transactions: Vec<LastTransactionsItem>,
}

/// Latest signed transaction and renewal info of one subscription.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastTransactionsItem {
    pub(crate) original_transaction_id: String,
    pub(crate) status: AutoRenewableSubscriptionStatus,
    pub(crate) signed_renewal_info: Option<String>,
    pub(crate) signed_transaction_info: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize_repr)]
#[repr(u8)]
pub(crate) enum AutoRenewableSubscriptionStatus {
    Active = 1,
    Expired = 2,
    /// Apple is still retrying the charge.
    BillingRetry = 3,
    BillingGracePeriod = 4,
    /// Refunded or revoked from Family Sharing.
    Revoked = 5,
}
