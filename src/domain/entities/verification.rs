use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payment_record::PaymentMethod;

/// What the client hands over to prove a purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "paymentMethod", rename_all = "snake_case")]
pub enum VerificationRequest {
    #[serde(rename_all = "camelCase")]
    Stripe { payment_intent_id: String },
    #[serde(rename_all = "camelCase")]
    GooglePlay {
        purchase_token: String,
        product_id: String,
        /// Play order id, used as the transaction id when present.
        #[serde(default)]
        order_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Apple {
        /// Either a signed JWS transaction or a legacy base64 receipt.
        receipt_data: String,
        product_id: String,
        #[serde(default)]
        transaction_id: Option<String>,
        #[serde(default)]
        original_transaction_id: Option<String>,
    },
}

impl VerificationRequest {
    pub fn payment_method(&self) -> PaymentMethod {
        match self {
            Self::Stripe { .. } => PaymentMethod::Stripe,
            Self::GooglePlay { .. } => PaymentMethod::GooglePlay,
            Self::Apple { .. } => PaymentMethod::Apple,
        }
    }

    /// The opaque proof stored on the payment record.
    pub fn receipt_data(&self) -> &str {
        match self {
            Self::Stripe { payment_intent_id } => payment_intent_id,
            Self::GooglePlay { purchase_token, .. } => purchase_token,
            Self::Apple { receipt_data, .. } => receipt_data,
        }
    }

    pub fn product_id(&self) -> Option<&str> {
        match self {
            Self::Stripe { .. } => None,
            Self::GooglePlay { product_id, .. } | Self::Apple { product_id, .. } => {
                Some(product_id)
            }
        }
    }

    /// Transaction id as claimed by the client, before verification.
    pub fn claimed_transaction_id(&self) -> Option<&str> {
        match self {
            Self::Stripe { payment_intent_id } => Some(payment_intent_id),
            Self::GooglePlay {
                order_id,
                purchase_token,
                ..
            } => Some(order_id.as_deref().unwrap_or(purchase_token)),
            Self::Apple {
                transaction_id,
                original_transaction_id,
                ..
            } => transaction_id
                .as_deref()
                .or(original_transaction_id.as_deref()),
        }
    }
}

/// Platform-independent verification outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub success: bool,
    pub transaction_id: Option<String>,
    pub original_transaction_id: Option<String>,
    pub product_id: Option<String>,
    pub expires_date: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// Stripe only: amount charged, in cents.
    pub amount_cents: Option<i64>,
    /// Stripe only: the `planId` the PaymentIntent was created for.
    pub plan_id: Option<String>,
}

impl VerificationResult {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            failure_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn verified(transaction_id: impl Into<String>) -> Self {
        Self {
            success: true,
            transaction_id: Some(transaction_id.into()),
            ..Self::default()
        }
    }
}
