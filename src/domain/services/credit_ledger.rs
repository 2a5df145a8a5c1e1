use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    clock::{same_utc_day, start_of_day, Clock},
    constants::{AD_REWARDS_PER_DAY, AD_REWARD_CREDITS, LEGACY_BONUS_CREDITS},
    domain::{
        entities::{
            generation::{GenerationLimit, GenerationType},
            notification::{NotificationPayload, SubscriptionEvent},
            plan::{PlanSnapshot, PlanType},
            user_account::{CreditBalance, UserAccount},
        },
        repositories::ledger_store::LedgerStore,
    },
    errors::{LedgerError, LedgerResult},
};

use super::notifier::Notifier;

/// Where a user stands with rewarded ads today.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdRewardStatus {
    pub can_watch_ad: bool,
    pub rewards_today: u32,
    pub remaining_today: u32,
    pub total_rewards: u32,
}

impl AdRewardStatus {
    fn of(user: &UserAccount, now: DateTime<Utc>) -> Self {
        let rewards_today = match user.rewards.last_reward_date {
            Some(last) if same_utc_day(last, now) => user.rewards.daily_count,
            _ => 0,
        };
        let remaining_today = AD_REWARDS_PER_DAY.saturating_sub(rewards_today);
        Self {
            can_watch_ad: remaining_today > 0,
            rewards_today,
            remaining_today,
            total_rewards: user.rewards.total_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdReward {
    pub credits_granted: i64,
    pub balance: CreditBalance,
    pub status: AdRewardStatus,
}

/// Owns the credit fields of every user account.
pub struct CreditLedger<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    legacy_bonus_cutoff: Option<DateTime<Utc>>,
}

impl<S> Clone for CreditLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            notifier: self.notifier.clone(),
            legacy_bonus_cutoff: self.legacy_bonus_cutoff,
        }
    }
}

impl<S: LedgerStore> CreditLedger<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        legacy_bonus_cutoff: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            legacy_bonus_cutoff,
        }
    }

    /// Recomputes `credits` for a newly assigned plan.
    ///
    /// With `carry_over`, what is left of a paid plan (never less than zero)
    /// is added on top of the new allotment. Coming from Free there is nothing
    /// to carry.
    pub fn apply_plan(
        credits: &mut CreditBalance,
        previous: PlanType,
        plan: &PlanSnapshot,
        carry_over: bool,
        now: DateTime<Utc>,
    ) {
        if plan.plan_type.is_free() {
            *credits = CreditBalance {
                last_credit_reset: Some(now),
                ..CreditBalance::free()
            };
            return;
        }

        let allotment = plan.allotment();
        let (image, prompt, total) = if carry_over && !previous.is_free() {
            (
                credits.remaining_image() + allotment.image,
                credits.remaining_prompt() + allotment.prompt,
                credits.remaining_total() + allotment.total,
            )
        } else {
            (allotment.image, allotment.prompt, allotment.total)
        };
        *credits = CreditBalance {
            total_credits: total,
            daily_credits: 0,
            image_generation_credits: image,
            prompt_generation_credits: prompt,
            used_image_credits: 0,
            used_prompt_credits: 0,
            last_credit_reset: Some(now),
        };
    }

    async fn load_user(&self, user_id: &str) -> LedgerResult<UserAccount> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_owned()))
    }

    /// Tops Free users back up to the daily allowance. Users already reset
    /// today are left alone, so running this twice a day is harmless.
    pub async fn reset_daily_free_credits(&self) -> LedgerResult<usize> {
        let now = self.clock.now();
        let today = start_of_day(now);
        let mut reset = 0;
        for mut user in self.store.list_users().await? {
            if !user.is_on_free_plan() {
                continue;
            }
            if user
                .credits
                .last_credit_reset
                .is_some_and(|last| last >= today)
            {
                continue;
            }
            user.credits = CreditBalance {
                last_credit_reset: Some(now),
                ..CreditBalance::free()
            };
            self.store.save_user(&user).await?;
            reset += 1;
        }
        info!(reset, "daily free credits reset");
        Ok(reset)
    }

    fn remaining(user: &UserAccount, kind: GenerationType) -> i64 {
        match kind {
            GenerationType::Image => {
                let remaining = user.credits.remaining_image();
                if remaining == 0 && user.is_on_free_plan() {
                    user.credits.daily_credits.max(0)
                } else {
                    remaining
                }
            }
            GenerationType::Prompt => user.credits.remaining_prompt(),
        }
    }

    /// Whether the user may run one more generation of `kind`. Tells the user
    /// when they have run out.
    pub async fn check_generation_limits(
        &self,
        user_id: &str,
        kind: GenerationType,
    ) -> LedgerResult<GenerationLimit> {
        let user = self.load_user(user_id).await?;
        let limit = GenerationLimit::from_remaining(Self::remaining(&user, kind));
        if !limit.allowed {
            debug!(user_id, kind = kind.as_str(), "credits exhausted");
            self.notifier
                .send(
                    user_id,
                    NotificationPayload::for_event(
                        SubscriptionEvent::CreditsExhausted,
                        &user.membership.plan_name,
                    )
                    .with_data("generationType", kind.as_str()),
                )
                .await;
        }
        Ok(limit)
    }

    /// Books `amount` credits of `kind` against the user's balance.
    pub async fn record_generation_usage(
        &self,
        user_id: &str,
        kind: GenerationType,
        amount: i64,
    ) -> LedgerResult<CreditBalance> {
        if amount <= 0 {
            return Err(LedgerError::InvalidRequest(format!(
                "usage amount must be positive, got {amount}"
            )));
        }
        let mut user = self.load_user(user_id).await?;
        let remaining = Self::remaining(&user, kind);
        if amount > remaining {
            return Err(LedgerError::InsufficientCredits {
                kind: kind.as_str(),
                remaining,
                requested: amount,
            });
        }

        match kind {
            GenerationType::Image if user.credits.remaining_image() >= amount => {
                user.credits.used_image_credits += amount;
            }
            // Free accounts have no image allotment and spend their daily
            // credits instead.
            GenerationType::Image => user.credits.daily_credits -= amount,
            GenerationType::Prompt => user.credits.used_prompt_credits += amount,
        }
        self.store.save_user(&user).await?;
        debug!(user_id, kind = kind.as_str(), amount, "generation usage recorded");
        Ok(user.credits)
    }

    pub async fn can_watch_ad(&self, user_id: &str) -> LedgerResult<AdRewardStatus> {
        let user = self.load_user(user_id).await?;
        Ok(AdRewardStatus::of(&user, self.clock.now()))
    }

    /// Credits a watched rewarded ad. Free users get daily credits, paid
    /// users image credits; both see the total go up.
    pub async fn grant_ad_reward(&self, user_id: &str) -> LedgerResult<AdReward> {
        let now = self.clock.now();
        let mut user = self.load_user(user_id).await?;
        let status = AdRewardStatus::of(&user, now);
        if !status.can_watch_ad {
            return Err(LedgerError::RewardLimitReached);
        }

        if user.is_on_free_plan() {
            user.credits.daily_credits += AD_REWARD_CREDITS;
        } else {
            user.credits.image_generation_credits += AD_REWARD_CREDITS;
        }
        user.credits.total_credits += AD_REWARD_CREDITS;
        user.rewards.daily_count = status.rewards_today + 1;
        user.rewards.total_count += 1;
        user.rewards.last_reward_date = Some(now);
        self.store.save_user(&user).await?;

        info!(
            user_id,
            rewards_today = user.rewards.daily_count,
            "ad reward granted"
        );
        self.notifier
            .send(
                user_id,
                NotificationPayload::for_event(
                    SubscriptionEvent::RewardGranted,
                    &user.membership.plan_name,
                )
                .with_data("credits", AD_REWARD_CREDITS.to_string()),
            )
            .await;

        Ok(AdReward {
            credits_granted: AD_REWARD_CREDITS,
            status: AdRewardStatus::of(&user, now),
            balance: user.credits,
        })
    }

    fn qualifies_for_legacy_bonus(&self, user: &UserAccount) -> bool {
        let Some(cutoff) = self.legacy_bonus_cutoff else {
            return false;
        };
        user.is_on_free_plan() && user.created_at < cutoff && !user.rewards.legacy_bonus_awarded
    }

    /// One-time bonus for Free users who signed up before the cutoff. Returns
    /// whether it was awarded now.
    pub async fn award_legacy_bonus(&self, user_id: &str) -> LedgerResult<bool> {
        let mut user = self.load_user(user_id).await?;
        if !self.qualifies_for_legacy_bonus(&user) {
            return Ok(false);
        }
        self.award(&mut user).await?;
        Ok(true)
    }

    /// Awards the legacy bonus to every qualifying user.
    pub async fn award_legacy_bonuses(&self) -> LedgerResult<usize> {
        if self.legacy_bonus_cutoff.is_none() {
            return Ok(0);
        }
        let mut awarded = 0;
        for mut user in self.store.list_users().await? {
            if self.qualifies_for_legacy_bonus(&user) {
                self.award(&mut user).await?;
                awarded += 1;
            }
        }
        info!(awarded, "legacy bonus sweep finished");
        Ok(awarded)
    }

    async fn award(&self, user: &mut UserAccount) -> LedgerResult<()> {
        user.credits.daily_credits += LEGACY_BONUS_CREDITS;
        user.credits.total_credits += LEGACY_BONUS_CREDITS;
        user.rewards.legacy_bonus_awarded = true;
        self.store.save_user(user).await?;
        info!(user_id = %user.id, credits = LEGACY_BONUS_CREDITS, "legacy bonus awarded");
        self.notifier
            .send(
                &user.id,
                NotificationPayload::for_event(
                    SubscriptionEvent::BonusAwarded,
                    &user.membership.plan_name,
                )
                .with_data("credits", LEGACY_BONUS_CREDITS.to_string()),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::{
        clock::ManualClock,
        data::repositories::in_memory_ledger_store::InMemoryLedgerStore,
        domain::{
            entities::plan::{CreditAllotment, Plan},
            repositories::notification_repository::NotificationSender,
        },
        errors::StorefrontError,
    };

    #[derive(Default)]
    struct Outbox(Mutex<Vec<String>>);

    #[async_trait]
    impl NotificationSender for Outbox {
        async fn send_custom_notification(
            &self,
            _recipient_id: &str,
            _actor_id: &str,
            _device_tokens: &[String],
            payload: &NotificationPayload,
        ) -> Result<(), StorefrontError> {
            self.0.lock().unwrap().push(payload.data["eventType"].clone());
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 3, 15, 0, 0).unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryLedgerStore>,
        clock: Arc<ManualClock>,
        outbox: Arc<Outbox>,
        ledger: CreditLedger<InMemoryLedgerStore>,
    }

    fn fixture(cutoff: Option<DateTime<Utc>>) -> Fixture {
        let store = Arc::new(InMemoryLedgerStore::new());
        let clock = Arc::new(ManualClock::new(now()));
        let outbox = Arc::new(Outbox::default());
        let notifier = Notifier::new(outbox.clone(), store.clone());
        let ledger = CreditLedger::new(store.clone(), clock.clone(), notifier, cutoff);
        Fixture {
            store,
            clock,
            outbox,
            ledger,
        }
    }

    fn snapshot(plan_type: PlanType, total: i64) -> PlanSnapshot {
        Plan::new(plan_type.display_name(), plan_type, 9.99, CreditAllotment::split(total), now())
            .snapshot()
    }

    #[test]
    fn carry_over_adds_unused_paid_credits() {
        let mut credits = CreditBalance::free();
        CreditLedger::<InMemoryLedgerStore>::apply_plan(
            &mut credits,
            PlanType::Free,
            &snapshot(PlanType::Premium, 100),
            false,
            now(),
        );
        assert_eq!(credits.total_credits, 100);

        credits.used_image_credits = 20;
        credits.used_prompt_credits = 10;
        CreditLedger::<InMemoryLedgerStore>::apply_plan(
            &mut credits,
            PlanType::Premium,
            &snapshot(PlanType::Premium, 200),
            true,
            now(),
        );
        assert_eq!(credits.total_credits, 270);
        assert_eq!(credits.image_generation_credits, 30 + 100);
        assert_eq!(credits.prompt_generation_credits, 40 + 100);
        assert_eq!(credits.used_image_credits, 0);
    }

    #[test]
    fn overdrawn_balances_carry_nothing() {
        let mut credits = CreditBalance {
            total_credits: 10,
            image_generation_credits: 5,
            prompt_generation_credits: 5,
            used_image_credits: 8,
            used_prompt_credits: 9,
            ..CreditBalance::free()
        };
        CreditLedger::<InMemoryLedgerStore>::apply_plan(
            &mut credits,
            PlanType::Basic,
            &snapshot(PlanType::Standard, 150),
            true,
            now(),
        );
        assert_eq!(credits.total_credits, 150);
        assert_eq!(credits.image_generation_credits, 75);
        assert_eq!(credits.prompt_generation_credits, 75);
    }

    #[test]
    fn carry_over_from_free_is_a_fresh_grant() {
        let mut credits = CreditBalance::free();
        CreditLedger::<InMemoryLedgerStore>::apply_plan(
            &mut credits,
            PlanType::Free,
            &snapshot(PlanType::Basic, 50),
            true,
            now(),
        );
        assert_eq!(credits.total_credits, 50);
        assert_eq!(credits.daily_credits, 0);
    }

    #[tokio::test]
    async fn daily_reset_runs_once_per_day() {
        let f = fixture(None);
        let mut user = UserAccount::new("u1", "ana", now() - Duration::days(3));
        user.credits.used_prompt_credits = 4;
        user.credits.last_credit_reset = Some(now() - Duration::days(1));
        f.store.save_user(&user).await.unwrap();

        assert_eq!(f.ledger.reset_daily_free_credits().await.unwrap(), 1);
        f.ledger
            .record_generation_usage("u1", GenerationType::Prompt, 1)
            .await
            .unwrap();
        assert_eq!(f.ledger.reset_daily_free_credits().await.unwrap(), 0);
        let user = f.store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.credits.used_prompt_credits, 1);

        f.clock.advance(Duration::days(1));
        assert_eq!(f.ledger.reset_daily_free_credits().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn free_image_generation_draws_on_daily_credits() {
        let f = fixture(None);
        f.store
            .save_user(&UserAccount::new("u1", "ana", now()))
            .await
            .unwrap();

        let limit = f
            .ledger
            .check_generation_limits("u1", GenerationType::Image)
            .await
            .unwrap();
        assert!(limit.allowed);
        assert_eq!(limit.remaining, 4);

        f.ledger
            .record_generation_usage("u1", GenerationType::Image, 4)
            .await
            .unwrap();
        let limit = f
            .ledger
            .check_generation_limits("u1", GenerationType::Image)
            .await
            .unwrap();
        assert!(!limit.allowed);
        assert_eq!(*f.outbox.0.lock().unwrap(), vec!["credits_exhausted".to_owned()]);

        let err = f
            .ledger
            .record_generation_usage("u1", GenerationType::Image, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCredits { remaining: 0, .. }));
    }

    #[tokio::test]
    async fn ad_rewards_are_capped_per_day() {
        let f = fixture(None);
        f.store
            .save_user(&UserAccount::new("u1", "ana", now()))
            .await
            .unwrap();

        let first = f.ledger.grant_ad_reward("u1").await.unwrap();
        assert_eq!(first.balance.daily_credits, 6);
        assert_eq!(first.balance.total_credits, 6);
        f.ledger.grant_ad_reward("u1").await.unwrap();
        assert!(matches!(
            f.ledger.grant_ad_reward("u1").await,
            Err(LedgerError::RewardLimitReached)
        ));
        assert!(!f.ledger.can_watch_ad("u1").await.unwrap().can_watch_ad);

        f.clock.advance(Duration::days(1));
        let status = f.ledger.can_watch_ad("u1").await.unwrap();
        assert!(status.can_watch_ad);
        assert_eq!(status.total_rewards, 2);
    }

    #[tokio::test]
    async fn legacy_bonus_is_awarded_once() {
        let f = fixture(Some(now() - Duration::days(30)));
        f.store
            .save_user(&UserAccount::new("old", "early", now() - Duration::days(90)))
            .await
            .unwrap();
        f.store
            .save_user(&UserAccount::new("new", "late", now() - Duration::days(1)))
            .await
            .unwrap();

        assert_eq!(f.ledger.award_legacy_bonuses().await.unwrap(), 1);
        assert!(!f.ledger.award_legacy_bonus("old").await.unwrap());
        let user = f.store.get_user("old").await.unwrap().unwrap();
        assert_eq!(user.credits.total_credits, 14);
        assert_eq!(user.credits.daily_credits, 14);
    }
}
