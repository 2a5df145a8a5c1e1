use std::collections::BTreeMap;

use serde::Serialize;

/// Subscription and credit events users are told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionEvent {
    New,
    TrialStarted,
    Upgraded,
    Cancelled,
    PendingCancellation,
    RenewalReminder,
    Renewed,
    PaymentFailed,
    Expired,
    TrialExpired,
    GracePeriodEnded,
    CreditsExhausted,
    RewardGranted,
    BonusAwarded,
}

impl SubscriptionEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::TrialStarted => "trial_started",
            Self::Upgraded => "upgraded",
            Self::Cancelled => "cancelled",
            Self::PendingCancellation => "pending_cancellation",
            Self::RenewalReminder => "renewal_reminder",
            Self::Renewed => "renewed",
            Self::PaymentFailed => "payment_failed",
            Self::Expired => "expired",
            Self::TrialExpired => "trial_expired",
            Self::GracePeriodEnded => "grace_period_ended",
            Self::CreditsExhausted => "credits_exhausted",
            Self::RewardGranted => "reward_granted",
            Self::BonusAwarded => "bonus_awarded",
        }
    }

    /// Client-side action the notification opens.
    pub fn action(self) -> &'static str {
        match self {
            Self::New => "subscription_activated",
            Self::TrialStarted => "trial_started",
            Self::Upgraded => "plan_upgraded",
            Self::Cancelled => "subscription_cancelled",
            Self::PendingCancellation => "pending_cancellation",
            Self::RenewalReminder => "renewal_reminder",
            Self::Renewed => "subscription_renewed",
            Self::PaymentFailed => "payment_failed",
            Self::Expired | Self::TrialExpired => "subscription_expired",
            Self::GracePeriodEnded => "grace_period_ended",
            Self::CreditsExhausted => "open_plans",
            Self::RewardGranted | Self::BonusAwarded => "credits_added",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::New => "🎉 Subscription Activated!",
            Self::TrialStarted => "🎉 Free Trial Started!",
            Self::Upgraded => "🚀 Plan Upgraded!",
            Self::Cancelled => "Subscription Cancelled",
            Self::PendingCancellation => "Subscription Update",
            Self::RenewalReminder => "Subscription Renewal Reminder",
            Self::Renewed => "Subscription Renewed",
            Self::PaymentFailed => "Payment Failed",
            Self::Expired => "Subscription Expired",
            Self::TrialExpired => "Free Trial Ended",
            Self::GracePeriodEnded => "Subscription Ended",
            Self::CreditsExhausted => "Out of Credits",
            Self::RewardGranted => "Credits Earned",
            Self::BonusAwarded => "🎁 Bonus Credits!",
        }
    }

    pub fn body(self, plan_name: &str) -> String {
        match self {
            Self::New => format!(
                "Your {plan_name} subscription has started. Enjoy your premium features!"
            ),
            Self::TrialStarted => format!(
                "Your {plan_name} trial has started. Enjoy premium features for 7 days!"
            ),
            Self::Upgraded => format!(
                "Your subscription has been upgraded to {plan_name}. Your unused credits have been carried over!"
            ),
            Self::Cancelled => {
                "Your subscription has been cancelled. You've been downgraded to the free plan."
                    .to_owned()
            }
            Self::PendingCancellation => {
                "Your subscription will not renew at the end of the current period.".to_owned()
            }
            Self::RenewalReminder => {
                format!("Your {plan_name} subscription will renew in 3 days.")
            }
            Self::Renewed => {
                format!("Your {plan_name} subscription has been renewed. Thank you!")
            }
            Self::PaymentFailed => "We couldn't process your subscription payment. You've been downgraded to the free plan.".to_owned(),
            Self::Expired => {
                "Your subscription has expired. You've been downgraded to the free plan."
                    .to_owned()
            }
            Self::TrialExpired => {
                "Your free trial has ended. Subscribe to keep your premium features.".to_owned()
            }
            Self::GracePeriodEnded => {
                "Your grace period has ended. You've been moved to the free plan.".to_owned()
            }
            Self::CreditsExhausted => {
                "You've used all your credits. Upgrade your plan to keep creating.".to_owned()
            }
            Self::RewardGranted => "Thanks for watching! Credits have been added.".to_owned(),
            Self::BonusAwarded => {
                "Thanks for being with us from the start. We've added bonus credits to your account.".to_owned()
            }
        }
    }
}

/// What gets handed to the notification sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    pub data: BTreeMap<String, String>,
}

impl NotificationPayload {
    pub fn for_event(event: SubscriptionEvent, plan_name: &str) -> Self {
        let mut data = BTreeMap::new();
        data.insert("eventType".to_owned(), event.as_str().to_owned());
        data.insert("action".to_owned(), event.action().to_owned());
        data.insert("planName".to_owned(), plan_name.to_owned());
        Self {
            title: event.title().to_owned(),
            body: event.body(plan_name),
            kind: "user".to_owned(),
            action: event.action().to_owned(),
            data,
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(key.to_owned(), value.into());
        self
    }
}
