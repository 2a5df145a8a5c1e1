#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// `purchases.subscriptionsv2.get` response, reduced to what reconciliation
/// and verification read.
///
/// https://developers.google.com/android-publisher/api-ref/rest/v3/purchases.subscriptionsv2#SubscriptionPurchaseV2
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubscriptionPurchaseV2Model {
    /// All auto-renewing or all prepaid.
    #[serde(default)]
    pub(crate) line_items: Vec<SubscriptionPurchaseLineItem>,
    pub(crate) subscription_state: SubscriptionState,
    pub(crate) latest_order_id: Option<String>,
    /// Only set in the canceled and expired states.
    pub(crate) canceled_state_context: Option<CanceledStateContext>,
    /// Present only for license-tester purchases.
    pub(crate) test_purchase: Option<TestPurchase>,
    #[serde(default)]
    pub(crate) acknowledgement_state: AcknowledgementState,
}

impl SubscriptionPurchaseV2Model {
    /// Latest expiry across line items.
    pub(crate) fn expiry_time(&self) -> Option<DateTime<Utc>> {
        self.line_items
            .iter()
            .filter_map(|item| item.expiry_time)
            .max()
    }

    pub(crate) fn auto_renew_enabled(&self) -> bool {
        self.line_items.iter().any(|item| {
            item.auto_renewing_plan
                .as_ref()
                .is_some_and(|plan| plan.auto_renew_enabled)
        })
    }

    pub(crate) fn product_id(&self) -> Option<&str> {
        self.line_items.first().map(|item| item.product_id.as_str())
    }
}

/// A pending payment shows up as `SubscriptionStatePending`; there is no
/// separate payment state in v2.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum SubscriptionState {
    SubscriptionStateUnspecified,
    SubscriptionStatePending,
    SubscriptionStateActive,
    SubscriptionStatePaused,
    SubscriptionStateInGracePeriod,
    SubscriptionStateOnHold,
    /// Renewal is off; items have not expired yet.
    SubscriptionStateCanceled,
    SubscriptionStateExpired,
    SubscriptionStatePendingPurchaseCanceled,
    #[serde(untagged)]
    Unknown(String),
}

/// Exactly one of the fields is set.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CanceledStateContext {
    pub(crate) user_initiated_cancellation: Option<UserInitiatedCancellation>,
    /// Billing problem and the like.
    pub(crate) system_initiated_cancellation: Option<EmptyContext>,
    pub(crate) developer_initiated_cancellation: Option<EmptyContext>,
    pub(crate) replacement_cancellation: Option<EmptyContext>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UserInitiatedCancellation {
    /// Access may continue past this; `expiry_time` decides.
    pub(crate) cancel_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct EmptyContext {}

#[derive(Deserialize, Debug)]
pub(crate) struct TestPurchase {}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum AcknowledgementState {
    #[default]
    AcknowledgementStateUnspecified,
    /// Unacknowledged purchases are refunded by Google after three days.
    AcknowledgementStatePending,
    AcknowledgementStateAcknowledged,
    #[serde(untagged)]
    Unknown(String),
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubscriptionPurchaseLineItem {
    pub(crate) product_id: String,
    pub(crate) expiry_time: Option<DateTime<Utc>>,
    /// Absent for prepaid items.
    pub(crate) auto_renewing_plan: Option<AutoRenewingPlan>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AutoRenewingPlan {
    /// False once the user turned off renewal.
    #[serde(default)]
    pub(crate) auto_renew_enabled: bool,
}
