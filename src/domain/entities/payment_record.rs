use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    plan::{PlanId, PlanSnapshot},
    storefront_status::CancellationType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentRecordId(pub Uuid);

impl PaymentRecordId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for PaymentRecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Ios,
    Android,
    Stripe,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Stripe => "stripe",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Stripe,
    GooglePlay,
    Apple,
}

impl PaymentMethod {
    pub fn platform(self) -> Platform {
        match self {
            PaymentMethod::Stripe => Platform::Stripe,
            PaymentMethod::GooglePlay => Platform::Android,
            PaymentMethod::Apple => Platform::Ios,
        }
    }

    /// Storefront-billed methods renew on the platform's side; the ledger
    /// only mirrors them.
    pub fn is_storefront_billed(self) -> bool {
        matches!(self, PaymentMethod::GooglePlay | PaymentMethod::Apple)
    }
}

impl From<Platform> for PaymentMethod {
    fn from(platform: Platform) -> Self {
        match platform {
            Platform::Ios => PaymentMethod::Apple,
            Platform::Android => PaymentMethod::GooglePlay,
            Platform::Stripe => PaymentMethod::Stripe,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Completed,
    Cancelled,
    GracePeriod,
}

/// One verified purchase. Created once, then only touched by reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub id: PaymentRecordId,
    pub user_id: String,
    pub plan_id: PlanId,
    pub payment_method: PaymentMethod,
    pub platform: Platform,
    pub transaction_id: String,
    pub original_transaction_id: Option<String>,
    /// Stripe PaymentIntent id, App Store receipt, or Play purchase token.
    pub receipt_data: String,
    pub product_id: Option<String>,
    pub status: PaymentStatus,
    pub amount: f64,
    pub plan_snapshot: PlanSnapshot,
    pub expiry_date: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_type: Option<CancellationType>,
    pub last_checked: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    /// Completed or in grace: the purchase still entitles the user.
    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            PaymentStatus::Completed | PaymentStatus::GracePeriod
        )
    }

    /// Records sharing this key describe the same purchase.
    pub(crate) fn dedupe_key(&self) -> &str {
        if !self.transaction_id.is_empty() {
            &self.transaction_id
        } else if let Some(original) = self
            .original_transaction_id
            .as_deref()
            .filter(|id| !id.is_empty())
        {
            original
        } else {
            &self.receipt_data
        }
    }
}
