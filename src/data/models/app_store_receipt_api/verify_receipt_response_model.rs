#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

/// Request body of the (deprecated) verifyReceipt endpoint.
///
/// https://developer.apple.com/documentation/appstorereceipts/requestbody
#[derive(Debug, Serialize)]
pub(crate) struct VerifyReceiptRequestModel<'a> {
    /// The Base64-encoded receipt data.
    #[serde(rename = "receipt-data")]
    pub(crate) receipt_data: &'a str,
    /// Your app's shared secret, which is a hexadecimal string.
    pub(crate) password: &'a str,
    /// Set this value to true for the response to include only the latest
    /// renewal transaction for any subscriptions.
    #[serde(rename = "exclude-old-transactions")]
    pub(crate) exclude_old_transactions: bool,
}

/// Response body of verifyReceipt.
///
/// https://developer.apple.com/documentation/appstorereceipts/responsebody
#[derive(Debug, Deserialize)]
pub(crate) struct VerifyReceiptResponseModel {
    /// Either 0 if the receipt is valid, or a status code if there is an
    /// error.
    pub(crate) status: i32,
    /// The environment for which the receipt was generated. Possible values:
    /// Sandbox, Production.
    pub(crate) environment: Option<String>,
    /// An array that contains all in-app purchase transactions.
    #[serde(default)]
    pub(crate) latest_receipt_info: Vec<ReceiptTransactionModel>,
    /// An indicator that an error occurred during the request. A value of 1
    /// indicates a temporary issue; retry validation for this receipt at a
    /// later time.
    #[serde(rename = "is-retryable", default)]
    pub(crate) is_retryable: bool,
}

impl VerifyReceiptResponseModel {
    pub(crate) const STATUS_VALID: i32 = 0;
    /// This receipt is from the test environment, but it was sent to the
    /// production environment for verification.
    pub(crate) const STATUS_SANDBOX_RECEIPT_IN_PRODUCTION: i32 = 21007;
}

/// One in-app purchase transaction from `latest_receipt_info`.
///
/// https://developer.apple.com/documentation/appstorereceipts/responsebody/latest_receipt_info
#[serde_as]
#[derive(Debug, Deserialize)]
pub(crate) struct ReceiptTransactionModel {
    /// The unique identifier of the product purchased.
    pub(crate) product_id: String,
    /// A unique identifier for a transaction such as a purchase, restore, or
    /// renewal.
    pub(crate) transaction_id: String,
    /// The transaction identifier of the original purchase.
    pub(crate) original_transaction_id: Option<String>,
    /// The time a subscription expires or when it will renew, in UNIX epoch
    /// time format, in milliseconds.
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub(crate) expires_date_ms: Option<i64>,
    /// The time the App Store refunded a transaction or revoked it from family
    /// sharing, in UNIX epoch time format, in milliseconds.
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    pub(crate) cancellation_date_ms: Option<i64>,
}

impl ReceiptTransactionModel {
    pub(crate) fn expires_date(&self) -> Option<DateTime<Utc>> {
        self.expires_date_ms.and_then(DateTime::from_timestamp_millis)
    }

    pub(crate) fn is_revoked(&self) -> bool {
        self.cancellation_date_ms.is_some()
    }
}
