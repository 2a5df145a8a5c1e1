use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{
    FREE_DAILY_CREDITS, FREE_IMAGE_CREDITS, FREE_PROMPT_CREDITS, FREE_TOTAL_CREDITS,
};

use super::{plan::PlanType, user_subscription::SubscriptionStatus};

/// Generation credits. Written only by the credit ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditBalance {
    pub total_credits: i64,
    pub daily_credits: i64,
    pub image_generation_credits: i64,
    pub prompt_generation_credits: i64,
    pub used_image_credits: i64,
    pub used_prompt_credits: i64,
    pub last_credit_reset: Option<DateTime<Utc>>,
}

impl CreditBalance {
    pub fn free() -> Self {
        Self {
            total_credits: FREE_TOTAL_CREDITS,
            daily_credits: FREE_DAILY_CREDITS,
            image_generation_credits: FREE_IMAGE_CREDITS,
            prompt_generation_credits: FREE_PROMPT_CREDITS,
            used_image_credits: 0,
            used_prompt_credits: 0,
            last_credit_reset: None,
        }
    }

    pub fn remaining_image(&self) -> i64 {
        (self.image_generation_credits - self.used_image_credits).max(0)
    }

    pub fn remaining_prompt(&self) -> i64 {
        (self.prompt_generation_credits - self.used_prompt_credits).max(0)
    }

    pub fn remaining_total(&self) -> i64 {
        (self.total_credits - (self.used_image_credits + self.used_prompt_credits)).max(0)
    }
}

/// Plan-derived flags. Written only by the subscription state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub is_subscribed: bool,
    pub subscription_status: Option<SubscriptionStatus>,
    pub plan_name: String,
    pub plan_type: PlanType,
    pub has_active_trial: bool,
    pub watermark_enabled: bool,
    pub plan_downgraded_at: Option<DateTime<Utc>>,
}

impl Membership {
    pub fn free() -> Self {
        Self {
            is_subscribed: false,
            subscription_status: None,
            plan_name: PlanType::Free.display_name().to_owned(),
            plan_type: PlanType::Free,
            has_active_trial: false,
            watermark_enabled: true,
            plan_downgraded_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardCounters {
    pub daily_count: u32,
    pub total_count: u32,
    pub last_reward_date: Option<DateTime<Utc>>,
    pub legacy_bonus_awarded: bool,
}

/// The monetization-relevant part of a user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub id: String,
    pub username: String,
    pub credits: CreditBalance,
    pub membership: Membership,
    #[serde(default)]
    pub rewards: RewardCounters,
    #[serde(default)]
    pub device_tokens: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl UserAccount {
    pub fn new(id: impl Into<String>, username: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            credits: CreditBalance::free(),
            membership: Membership::free(),
            rewards: RewardCounters::default(),
            device_tokens: Vec::new(),
            created_at: now,
        }
    }

    pub fn is_on_free_plan(&self) -> bool {
        self.membership.plan_type.is_free()
    }
}
