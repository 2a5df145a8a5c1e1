#![allow(dead_code)]

use chrono::{serde::ts_milliseconds, DateTime, Utc};
use serde::Deserialize;
use serde_repr::Deserialize_repr;

/// Decoded `signedRenewalInfo` from a subscription status lookup.
///
/// https://developer.apple.com/documentation/appstoreserverapi/jwsrenewalinfodecodedpayload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JwsRenewalInfoDecodedPayloadModel {
    pub(crate) auto_renew_status: AutoRenewStatus,
    /// Set once the subscription has lapsed.
    pub(crate) expiration_intent: Option<ExpirationIntent>,
    pub(crate) original_transaction_id: Option<String>,
    pub(crate) product_id: String,
    /// Apple re-signs renewal info when the customer turns renewal off, so
    /// with renewal off this approximates the cancellation time.
    #[serde(with = "ts_milliseconds")]
    pub(crate) signed_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize_repr)]
#[repr(u8)]
pub(crate) enum AutoRenewStatus {
    Off = 0,
    On = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize_repr)]
#[repr(u8)]
pub(crate) enum ExpirationIntent {
    VoluntaryCancellation = 1,
    BillingError = 2,
    /// Price increase needing consent was not accepted.
    PriceIncreaseDecline = 3,
    ProductUnavailable = 4,
    Other = 5,
}
