#![allow(dead_code)]

use chrono::{serde::ts_milliseconds_option, DateTime, Utc};
use serde::Deserialize;
use serde_repr::Deserialize_repr;

/// Decoded JWS transaction. Arrives either from a status lookup or straight
/// from StoreKit 2 as the client's receipt.
///
/// https://developer.apple.com/documentation/appstoreserverapi/jwstransactiondecodedpayload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JwsTransactionDecodedPayloadModel {
    pub(crate) bundle_id: Option<String>,
    /// Absent for products that never expire.
    #[serde(default, with = "ts_milliseconds_option")]
    pub(crate) expires_date: Option<DateTime<Utc>>,
    pub(crate) original_transaction_id: String,
    pub(crate) product_id: String,
    /// Refunded, or revoked from Family Sharing.
    #[serde(default, with = "ts_milliseconds_option")]
    pub(crate) revocation_date: Option<DateTime<Utc>>,
    /// Only present for refunds.
    pub(crate) revocation_reason: Option<RevocationReason>,
    pub(crate) transaction_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize_repr)]
#[repr(u8)]
pub(crate) enum RevocationReason {
    Other = 0,
    /// Refunded over a problem in the app.
    Issue = 1,
}
