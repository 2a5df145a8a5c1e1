use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{not_found_age_threshold, not_found_expiry_threshold};

/// What a storefront reports about one subscription at poll time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorefrontSubscription {
    pub product_id: Option<String>,
    pub expiry_time: Option<DateTime<Utc>>,
    pub auto_renewing: bool,
    /// Set when the customer turned off renewal themselves.
    pub user_cancellation_time: Option<DateTime<Utc>>,
    pub refunded: bool,
    pub revoked: bool,
    /// Non-user cancellation (billing problem, replaced by another purchase).
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorefrontLookup {
    Found(StorefrontSubscription),
    /// The storefront does not know the purchase. Possibly transient.
    NotFound,
    /// The storefront no longer serves the purchase because it lapsed long
    /// ago.
    ExpiredTooLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationType {
    Active,
    UserCancelled,
    SystemCancelled,
    Expired,
    Refunded,
    Revoked,
    GracePeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Active,
    GracePeriod,
    Cancelled,
}

/// A storefront report, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorefrontStatus {
    pub cancellation_type: CancellationType,
    pub final_status: FinalStatus,
    pub is_expired: bool,
    pub expiry_time: Option<DateTime<Utc>>,
    pub auto_renewing: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl StorefrontStatus {
    fn new(
        cancellation_type: CancellationType,
        final_status: FinalStatus,
        is_expired: bool,
        subscription: &StorefrontSubscription,
    ) -> Self {
        Self {
            cancellation_type,
            final_status,
            is_expired,
            expiry_time: subscription.expiry_time,
            auto_renewing: subscription.auto_renewing,
            cancelled_at: subscription.user_cancellation_time,
        }
    }

    /// Definitive expiry, e.g. when the storefront has dropped the purchase.
    pub fn expired(expiry_time: Option<DateTime<Utc>>) -> Self {
        Self {
            cancellation_type: CancellationType::Expired,
            final_status: FinalStatus::Cancelled,
            is_expired: true,
            expiry_time,
            auto_renewing: false,
            cancelled_at: None,
        }
    }
}

impl StorefrontSubscription {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_time.is_some_and(|expiry| expiry < now)
    }

    /// Maps a storefront report onto the ledger's view of it.
    ///
    /// Refunds and revocations end access immediately. A user cancellation
    /// that has not reached its expiry yet is a grace period.
    pub fn classify(&self, now: DateTime<Utc>) -> StorefrontStatus {
        let is_expired = self.is_expired(now);

        if self.revoked {
            return StorefrontStatus::new(
                CancellationType::Revoked,
                FinalStatus::Cancelled,
                true,
                self,
            );
        }
        if self.refunded {
            return StorefrontStatus::new(
                CancellationType::Refunded,
                FinalStatus::Cancelled,
                true,
                self,
            );
        }
        if self.auto_renewing && !is_expired {
            return StorefrontStatus::new(
                CancellationType::Active,
                FinalStatus::Active,
                false,
                self,
            );
        }
        if is_expired {
            return StorefrontStatus::new(
                CancellationType::Expired,
                FinalStatus::Cancelled,
                true,
                self,
            );
        }
        // Not expired here, so a user cancellation is still serving.
        if self.user_cancellation_time.is_some() {
            return StorefrontStatus::new(
                CancellationType::UserCancelled,
                FinalStatus::GracePeriod,
                false,
                self,
            );
        }
        if self.cancel_reason.is_some() {
            return StorefrontStatus::new(
                CancellationType::SystemCancelled,
                FinalStatus::Cancelled,
                false,
                self,
            );
        }
        // Not renewing but nobody cancelled it: a prepaid purchase running
        // out its term.
        StorefrontStatus::new(CancellationType::Active, FinalStatus::Active, false, self)
    }
}

/// Decides whether a purchase the storefront cannot find should be treated as
/// expired. `None` means "leave it alone this round".
pub fn classify_not_found(
    local_expiry: Option<DateTime<Utc>>,
    record_created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<StorefrontStatus> {
    let likely_expired = match local_expiry {
        Some(expiry) => expiry < now && now - expiry > not_found_expiry_threshold(),
        None => now - record_created_at > not_found_age_threshold(),
    };
    likely_expired.then(|| StorefrontStatus::expired(local_expiry))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn report() -> StorefrontSubscription {
        StorefrontSubscription {
            expiry_time: Some(now() + Duration::days(10)),
            auto_renewing: true,
            ..StorefrontSubscription::default()
        }
    }

    #[test]
    fn renewing_unexpired_is_active() {
        let status = report().classify(now());
        assert_eq!(status.final_status, FinalStatus::Active);
        assert!(!status.is_expired);
    }

    #[test]
    fn user_cancelled_before_expiry_is_grace_period() {
        let status = StorefrontSubscription {
            auto_renewing: false,
            user_cancellation_time: Some(now() - Duration::days(1)),
            ..report()
        }
        .classify(now());
        assert_eq!(status.cancellation_type, CancellationType::UserCancelled);
        assert_eq!(status.final_status, FinalStatus::GracePeriod);
    }

    #[test]
    fn user_cancelled_without_expiry_is_grace_period() {
        let status = StorefrontSubscription {
            expiry_time: None,
            auto_renewing: false,
            user_cancellation_time: Some(now() - Duration::days(40)),
            ..report()
        }
        .classify(now());
        assert_eq!(status.final_status, FinalStatus::GracePeriod);
        assert!(!status.is_expired);
    }

    #[test]
    fn expired_wins_over_cancellation_details() {
        let status = StorefrontSubscription {
            expiry_time: Some(now() - Duration::minutes(1)),
            auto_renewing: false,
            user_cancellation_time: Some(now() - Duration::days(20)),
            ..report()
        }
        .classify(now());
        assert_eq!(status.cancellation_type, CancellationType::Expired);
        assert_eq!(status.final_status, FinalStatus::Cancelled);
        assert!(status.is_expired);
    }

    #[test]
    fn refund_ends_access_immediately() {
        let status = StorefrontSubscription {
            refunded: true,
            ..report()
        }
        .classify(now());
        assert_eq!(status.cancellation_type, CancellationType::Refunded);
        assert!(status.is_expired);
    }

    #[test]
    fn system_cancellation_serves_until_expiry() {
        let status = StorefrontSubscription {
            auto_renewing: false,
            cancel_reason: Some("billing_issue".into()),
            ..report()
        }
        .classify(now());
        assert_eq!(status.final_status, FinalStatus::Cancelled);
        assert!(!status.is_expired);
    }

    #[test]
    fn not_found_uses_age_heuristic() {
        // Expired locally, but only recently: could be a lookup blip.
        assert!(classify_not_found(
            Some(now() - Duration::days(5)),
            now() - Duration::days(100),
            now()
        )
        .is_none());
        assert!(classify_not_found(
            Some(now() - Duration::days(31)),
            now() - Duration::days(100),
            now()
        )
        .is_some());
        // No local expiry: go by record age.
        assert!(classify_not_found(None, now() - Duration::days(59), now()).is_none());
        assert!(classify_not_found(None, now() - Duration::days(61), now()).is_some());
    }
}
