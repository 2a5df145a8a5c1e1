use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    payment_record::PaymentMethod,
    plan::{PlanId, PlanSnapshot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a subscription record.
///
/// ```text
///   Active{auto_renew} ──cancel(deferred)──▶ PendingCancellation
///         │                                        │ end_date passes
///         │                                        ▼
///         │                                   GracePeriod ──end_date + 7d──▶ Cancelled
///         └──cancel(immediate) / expiry / storefront says expired ─────────▶ Cancelled
/// ```
///
/// Every state except `Cancelled` keeps the user on the subscribed plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubscriptionState {
    Active {
        auto_renew: bool,
    },
    /// Cancelled by the user; serves until `end_date`.
    PendingCancellation {
        cancelled_at: DateTime<Utc>,
    },
    /// Past `end_date` (or reported in grace by the storefront); serves until
    /// the grace window closes.
    GracePeriod {
        cancelled_at: DateTime<Utc>,
    },
    Cancelled {
        cancelled_at: DateTime<Utc>,
    },
}

/// The externally reported status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    GracePeriod,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::GracePeriod => "grace_period",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

impl SubscriptionState {
    pub fn is_active(&self) -> bool {
        !matches!(self, SubscriptionState::Cancelled { .. })
    }

    pub fn auto_renew(&self) -> bool {
        matches!(self, SubscriptionState::Active { auto_renew: true })
    }

    pub fn status(&self) -> SubscriptionStatus {
        match self {
            SubscriptionState::Active { .. } | SubscriptionState::PendingCancellation { .. } => {
                SubscriptionStatus::Active
            }
            SubscriptionState::GracePeriod { .. } => SubscriptionStatus::GracePeriod,
            SubscriptionState::Cancelled { .. } => SubscriptionStatus::Cancelled,
        }
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        match self {
            SubscriptionState::Active { .. } => None,
            SubscriptionState::PendingCancellation { cancelled_at }
            | SubscriptionState::GracePeriod { cancelled_at }
            | SubscriptionState::Cancelled { cancelled_at } => Some(*cancelled_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSubscription {
    pub id: SubscriptionId,
    pub user_id: String,
    pub plan_id: PlanId,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub is_trial: bool,
    pub payment_method: PaymentMethod,
    pub state: SubscriptionState,
    pub plan_snapshot: PlanSnapshot,
    /// `end_date` a renewal reminder was last sent for.
    pub renewal_reminder_sent_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserSubscription {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn auto_renew(&self) -> bool {
        self.state.auto_renew()
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.state.status()
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.state.cancelled_at()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn pending_cancellation_still_serves() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let state = SubscriptionState::PendingCancellation { cancelled_at: at };
        assert!(state.is_active());
        assert!(!state.auto_renew());
        assert_eq!(state.status(), SubscriptionStatus::Active);
        assert_eq!(state.cancelled_at(), Some(at));
    }

    #[test]
    fn cancelled_is_the_only_inactive_state() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert!(SubscriptionState::GracePeriod { cancelled_at: at }.is_active());
        assert!(!SubscriptionState::Cancelled { cancelled_at: at }.is_active());
        assert_eq!(
            SubscriptionState::Cancelled { cancelled_at: at }.status(),
            SubscriptionStatus::Cancelled
        );
    }

    #[test]
    fn state_serializes_with_tag() {
        let json = serde_json::to_value(SubscriptionState::Active { auto_renew: true }).unwrap();
        assert_eq!(json["state"], "active");
        assert_eq!(json["auto_renew"], true);
    }
}
