use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    clock::{same_utc_day, Clock},
    constants::{credit_refresh_interval, grace_period, renewal_reminder_window},
    domain::{
        entities::{
            notification::SubscriptionEvent,
            payment_record::PaymentMethod,
            plan::{Plan, PlanSnapshot, PlanType},
            user_account::{Membership, UserAccount},
            user_subscription::{
                SubscriptionId, SubscriptionState, SubscriptionStatus, UserSubscription,
            },
        },
        repositories::ledger_store::LedgerStore,
    },
    errors::{LedgerError, LedgerResult},
};

use super::{credit_ledger::CreditLedger, notifier::Notifier, plan_catalog::PlanCatalog};

/// How a subscribe call changed the user's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionChange {
    Created,
    TrialStarted,
    Upgraded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeOutcome {
    pub subscription: UserSubscription,
    pub change: SubscriptionChange,
}

/// Counts from one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpirySweep {
    pub renewed: usize,
    pub expired: usize,
    pub trials_expired: usize,
    pub payment_failed: usize,
    pub entered_grace: usize,
    pub errors: usize,
}

/// Result of mirroring an active storefront subscription locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveMirror {
    /// The local record changed (dates, renewal flag, or it was created).
    pub updated: bool,
    /// Credits were granted afresh.
    pub credits_refreshed: bool,
}

/// The user-facing view of a user's subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSummary {
    pub user_id: String,
    pub is_subscribed: bool,
    pub status: Option<SubscriptionStatus>,
    pub plan_name: String,
    pub plan_type: PlanType,
    pub is_trial: bool,
    pub auto_renew: bool,
    pub end_date: Option<DateTime<Utc>>,
}

/// Owns every user's subscription record and the plan-derived membership
/// flags on the user account.
///
/// One record per user is re-pointed across plans; upgrades rewrite it rather
/// than opening a second one.
pub struct SubscriptionStateMachine<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    catalog: PlanCatalog<S>,
    notifier: Notifier,
}

impl<S> Clone for SubscriptionStateMachine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            catalog: self.catalog.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

fn membership_for(subscription: &UserSubscription, previous: &Membership) -> Membership {
    Membership {
        is_subscribed: true,
        subscription_status: Some(subscription.status()),
        plan_name: subscription.plan_snapshot.name.clone(),
        plan_type: subscription.plan_snapshot.plan_type,
        has_active_trial: subscription.is_trial,
        watermark_enabled: subscription.plan_snapshot.plan_type.is_free(),
        plan_downgraded_at: previous.plan_downgraded_at,
    }
}

impl<S: LedgerStore> SubscriptionStateMachine<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        catalog: PlanCatalog<S>,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            clock,
            catalog,
            notifier,
        }
    }

    async fn load_user(&self, user_id: &str) -> LedgerResult<UserAccount> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_owned()))
    }

    /// The user's serving subscription, newest first if there are several.
    pub async fn active_subscription(
        &self,
        user_id: &str,
    ) -> LedgerResult<Option<UserSubscription>> {
        Ok(self
            .store
            .subscriptions_for_user(user_id)
            .await?
            .into_iter()
            .find(UserSubscription::is_active))
    }

    async fn has_used_trial(&self, user_id: &str) -> LedgerResult<bool> {
        Ok(self
            .store
            .subscriptions_for_user(user_id)
            .await?
            .iter()
            .any(|subscription| {
                subscription.is_trial || subscription.plan_snapshot.plan_type == PlanType::Trial
            }))
    }

    /// Puts the user on `plan`.
    ///
    /// With a serving subscription in place this is an upgrade: the same
    /// record is re-pointed and unused credits carry over. Otherwise a new
    /// record is created. `expires_at` overrides the plan's billing period
    /// when the storefront reports the expiry.
    pub async fn subscribe(
        &self,
        user_id: &str,
        plan: &Plan,
        payment_method: PaymentMethod,
        is_trial: bool,
        expires_at: Option<DateTime<Utc>>,
    ) -> LedgerResult<SubscribeOutcome> {
        let now = self.clock.now();
        let mut user = self.load_user(user_id).await?;
        if !plan.is_active {
            return Err(LedgerError::InvalidRequest(format!(
                "plan '{}' is no longer offered",
                plan.name
            )));
        }
        if is_trial != (plan.plan_type == PlanType::Trial) {
            return Err(LedgerError::InvalidRequest(
                "only the trial plan can be started as a trial".to_owned(),
            ));
        }
        if plan.plan_type.is_free() {
            return Err(LedgerError::InvalidRequest(
                "the free plan cannot be purchased".to_owned(),
            ));
        }

        let existing = self.active_subscription(user_id).await?;
        if is_trial {
            if existing.is_some() {
                return Err(LedgerError::TrialUnavailable(
                    "user already has an active subscription".to_owned(),
                ));
            }
            if self.has_used_trial(user_id).await? {
                return Err(LedgerError::TrialUnavailable(
                    "trial already used".to_owned(),
                ));
            }
        }

        let end_date = expires_at
            .filter(|expiry| *expiry > now)
            .unwrap_or_else(|| plan.plan_type.period_end(now));
        let snapshot = plan.snapshot();
        let previous_type = user.membership.plan_type;

        let (subscription, change) = match existing {
            Some(mut subscription) => {
                subscription.plan_id = plan.id.clone();
                subscription.plan_snapshot = snapshot;
                subscription.start_date = now;
                subscription.end_date = end_date;
                subscription.is_trial = false;
                subscription.payment_method = payment_method;
                subscription.state = SubscriptionState::Active { auto_renew: true };
                subscription.renewal_reminder_sent_for = None;
                subscription.updated_at = now;
                (subscription, SubscriptionChange::Upgraded)
            }
            None => {
                let subscription = UserSubscription {
                    id: SubscriptionId::generate(),
                    user_id: user_id.to_owned(),
                    plan_id: plan.id.clone(),
                    start_date: now,
                    end_date,
                    is_trial,
                    payment_method,
                    state: SubscriptionState::Active {
                        auto_renew: !is_trial,
                    },
                    plan_snapshot: snapshot,
                    renewal_reminder_sent_for: None,
                    created_at: now,
                    updated_at: now,
                };
                let change = if is_trial {
                    SubscriptionChange::TrialStarted
                } else {
                    SubscriptionChange::Created
                };
                (subscription, change)
            }
        };

        self.store.save_subscription(&subscription).await?;
        CreditLedger::<S>::apply_plan(
            &mut user.credits,
            previous_type,
            &subscription.plan_snapshot,
            change == SubscriptionChange::Upgraded,
            now,
        );
        user.membership = membership_for(&subscription, &user.membership);
        self.store.save_user(&user).await?;

        info!(
            user_id,
            subscription_id = %subscription.id,
            plan_id = %plan.id,
            change = ?change,
            "subscription updated"
        );
        let event = match change {
            SubscriptionChange::Created => SubscriptionEvent::New,
            SubscriptionChange::TrialStarted => SubscriptionEvent::TrialStarted,
            SubscriptionChange::Upgraded => SubscriptionEvent::Upgraded,
        };
        self.notifier.notify(user_id, event, &plan.name).await;

        Ok(SubscribeOutcome {
            subscription,
            change,
        })
    }

    /// Cancels the user's subscription, either right away or at the end of
    /// the paid period. Cancelling what is already cancelled returns the
    /// current record unchanged.
    pub async fn cancel(&self, user_id: &str, immediate: bool) -> LedgerResult<UserSubscription> {
        let now = self.clock.now();
        let Some(mut subscription) = self.active_subscription(user_id).await? else {
            return self
                .store
                .subscriptions_for_user(user_id)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| LedgerError::SubscriptionNotFound(user_id.to_owned()));
        };

        if immediate {
            self.end_subscription(&mut subscription, now).await?;
            self.downgrade_to_free(user_id, Some(SubscriptionEvent::Cancelled))
                .await?;
            info!(user_id, subscription_id = %subscription.id, "subscription cancelled");
            return Ok(subscription);
        }

        if let SubscriptionState::Active { .. } = subscription.state {
            subscription.state = SubscriptionState::PendingCancellation { cancelled_at: now };
            subscription.updated_at = now;
            self.store.save_subscription(&subscription).await?;
            info!(
                user_id,
                subscription_id = %subscription.id,
                end_date = %subscription.end_date,
                "subscription will not renew"
            );
            self.notifier
                .notify(
                    user_id,
                    SubscriptionEvent::PendingCancellation,
                    &subscription.plan_snapshot.name,
                )
                .await;
        }
        Ok(subscription)
    }

    /// Marks the record cancelled and re-points it at the Free plan.
    async fn end_subscription(
        &self,
        subscription: &mut UserSubscription,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let free = self.catalog.free_plan().await?;
        let cancelled_at = subscription.cancelled_at().unwrap_or(now);
        subscription.state = SubscriptionState::Cancelled { cancelled_at };
        subscription.plan_id = free.id.clone();
        subscription.plan_snapshot = free.snapshot();
        subscription.updated_at = now;
        self.store.save_subscription(subscription).await?;
        Ok(())
    }

    /// Moves the user to Free: every serving subscription is ended, credits
    /// reset, membership cleared. Skipped when the user was already
    /// downgraded today. Returns whether anything changed.
    pub async fn downgrade_to_free(
        &self,
        user_id: &str,
        event: Option<SubscriptionEvent>,
    ) -> LedgerResult<bool> {
        let now = self.clock.now();
        let mut user = self.load_user(user_id).await?;
        let mut serving: Vec<_> = self
            .store
            .subscriptions_for_user(user_id)
            .await?
            .into_iter()
            .filter(UserSubscription::is_active)
            .collect();

        let downgraded_today = user
            .membership
            .plan_downgraded_at
            .is_some_and(|at| same_utc_day(at, now));
        if serving.is_empty() && user.is_on_free_plan() && downgraded_today {
            debug!(user_id, "already downgraded today");
            return Ok(false);
        }

        let previous_plan = user.membership.plan_name.clone();
        for subscription in serving.iter_mut() {
            self.end_subscription(subscription, now).await?;
        }
        let free = self.catalog.free_plan().await?;
        CreditLedger::<S>::apply_plan(
            &mut user.credits,
            user.membership.plan_type,
            &free.snapshot(),
            false,
            now,
        );
        user.membership = Membership {
            subscription_status: Some(SubscriptionStatus::Cancelled),
            plan_downgraded_at: Some(now),
            ..Membership::free()
        };
        self.store.save_user(&user).await?;
        info!(user_id, previous_plan = %previous_plan, "user downgraded to free");

        if let Some(event) = event {
            self.notifier.notify(user_id, event, &previous_plan).await;
        }
        Ok(true)
    }

    /// Cancels one subscription and, unless the user still has another
    /// serving one, downgrades them.
    async fn expire(
        &self,
        subscription: &mut UserSubscription,
        event: SubscriptionEvent,
    ) -> LedgerResult<()> {
        let now = self.clock.now();
        let plan_name = subscription.plan_snapshot.name.clone();
        self.end_subscription(subscription, now).await?;
        let still_serving = self.active_subscription(&subscription.user_id).await?;
        if still_serving.is_none() {
            self.downgrade_to_free(&subscription.user_id, None).await?;
        }
        self.notifier
            .notify(&subscription.user_id, event, &plan_name)
            .await;
        info!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.id,
            event = event.as_str(),
            "subscription ended"
        );
        Ok(())
    }

    /// Extends an auto-renewing subscription by one billing period of its
    /// current plan. Returns false when the plan can no longer be bought.
    async fn renew(&self, subscription: &mut UserSubscription) -> LedgerResult<bool> {
        let now = self.clock.now();
        let plan = match self.store.get_plan(&subscription.plan_id).await? {
            Some(plan) if plan.is_active => plan,
            _ => return Ok(false),
        };

        let mut end_date = plan.plan_type.period_end(subscription.end_date);
        if end_date <= now {
            end_date = plan.plan_type.period_end(now);
        }
        subscription.end_date = end_date;
        subscription.plan_snapshot = plan.snapshot();
        subscription.renewal_reminder_sent_for = None;
        subscription.updated_at = now;
        self.store.save_subscription(subscription).await?;

        let mut user = self.load_user(&subscription.user_id).await?;
        CreditLedger::<S>::apply_plan(
            &mut user.credits,
            user.membership.plan_type,
            &subscription.plan_snapshot,
            false,
            now,
        );
        user.membership = membership_for(subscription, &user.membership);
        self.store.save_user(&user).await?;

        info!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.id,
            end_date = %end_date,
            "subscription renewed"
        );
        self.notifier
            .notify(&subscription.user_id, SubscriptionEvent::Renewed, &plan.name)
            .await;
        Ok(true)
    }

    async fn process_expired(
        &self,
        subscription: &mut UserSubscription,
        sweep: &mut ExpirySweep,
    ) -> LedgerResult<()> {
        if subscription.is_trial {
            self.expire(subscription, SubscriptionEvent::TrialExpired)
                .await?;
            sweep.trials_expired += 1;
            return Ok(());
        }
        match subscription.state {
            SubscriptionState::Active { auto_renew: false } => {
                self.expire(subscription, SubscriptionEvent::Expired).await?;
                sweep.expired += 1;
            }
            // Google Play and the App Store renew on their side; the
            // reconciler moves `end_date` when they do. Only a subscription
            // they have stayed silent about past the grace window is ended.
            SubscriptionState::Active { auto_renew: true }
                if subscription.payment_method.is_storefront_billed() =>
            {
                if self.clock.now() > subscription.end_date + grace_period() {
                    self.expire(subscription, SubscriptionEvent::PaymentFailed)
                        .await?;
                    sweep.payment_failed += 1;
                } else {
                    debug!(
                        user_id = %subscription.user_id,
                        subscription_id = %subscription.id,
                        "awaiting storefront renewal"
                    );
                }
            }
            SubscriptionState::Active { auto_renew: true } => {
                if self.renew(subscription).await? {
                    sweep.renewed += 1;
                } else {
                    self.expire(subscription, SubscriptionEvent::PaymentFailed)
                        .await?;
                    sweep.payment_failed += 1;
                }
            }
            SubscriptionState::PendingCancellation { cancelled_at } => {
                subscription.state = SubscriptionState::GracePeriod { cancelled_at };
                subscription.updated_at = self.clock.now();
                self.store.save_subscription(subscription).await?;
                self.sync_membership(&subscription.user_id).await?;
                sweep.entered_grace += 1;
            }
            SubscriptionState::GracePeriod { .. } | SubscriptionState::Cancelled { .. } => {}
        }
        Ok(())
    }

    /// Handles every serving subscription past its `end_date`: trials and
    /// non-renewing purchases end, auto-renewing ones renew, user-cancelled
    /// ones enter their grace period.
    pub async fn process_expired_subscriptions(&self) -> LedgerResult<ExpirySweep> {
        let now = self.clock.now();
        let mut sweep = ExpirySweep::default();
        for mut subscription in self.store.list_subscriptions().await? {
            if !subscription.is_active() || subscription.end_date >= now {
                continue;
            }
            if let Err(e) = self.process_expired(&mut subscription, &mut sweep).await {
                warn!(
                    user_id = %subscription.user_id,
                    subscription_id = %subscription.id,
                    error = %e,
                    "failed to process expired subscription"
                );
                sweep.errors += 1;
            }
        }
        info!(
            renewed = sweep.renewed,
            expired = sweep.expired,
            trials_expired = sweep.trials_expired,
            payment_failed = sweep.payment_failed,
            entered_grace = sweep.entered_grace,
            errors = sweep.errors,
            "expiry sweep finished"
        );
        Ok(sweep)
    }

    /// Ends cancelled subscriptions whose grace window (`end_date` + 7 days)
    /// has closed.
    pub async fn process_grace_period_subscriptions(&self) -> LedgerResult<usize> {
        let now = self.clock.now();
        let mut ended = 0;
        for mut subscription in self.store.list_subscriptions().await? {
            let cancelled = matches!(
                subscription.state,
                SubscriptionState::PendingCancellation { .. }
                    | SubscriptionState::GracePeriod { .. }
            );
            if !cancelled || now <= subscription.end_date + grace_period() {
                continue;
            }
            match self
                .expire(&mut subscription, SubscriptionEvent::GracePeriodEnded)
                .await
            {
                Ok(()) => ended += 1,
                Err(e) => warn!(
                    user_id = %subscription.user_id,
                    error = %e,
                    "failed to end grace period"
                ),
            }
        }
        info!(ended, "grace period sweep finished");
        Ok(ended)
    }

    /// Reminds users whose subscription renews within three days, once per
    /// billing period.
    pub async fn send_renewal_reminders(&self) -> LedgerResult<usize> {
        let now = self.clock.now();
        let mut sent = 0;
        for mut subscription in self.store.list_subscriptions().await? {
            let due = subscription.auto_renew()
                && !subscription.is_trial
                && subscription.end_date > now
                && subscription.end_date <= now + renewal_reminder_window()
                && subscription.renewal_reminder_sent_for != Some(subscription.end_date);
            if !due {
                continue;
            }
            subscription.renewal_reminder_sent_for = Some(subscription.end_date);
            self.store.save_subscription(&subscription).await?;
            self.notifier
                .notify(
                    &subscription.user_id,
                    SubscriptionEvent::RenewalReminder,
                    &subscription.plan_snapshot.name,
                )
                .await;
            sent += 1;
        }
        debug!(sent, "renewal reminders sent");
        Ok(sent)
    }

    /// Where a user has several serving subscriptions, keeps the newest and
    /// cancels the rest without touching credits.
    pub async fn repair_duplicate_subscriptions(&self) -> LedgerResult<usize> {
        let now = self.clock.now();
        let mut by_user: HashMap<String, Vec<UserSubscription>> = HashMap::new();
        for subscription in self.store.list_subscriptions().await? {
            if subscription.is_active() {
                by_user
                    .entry(subscription.user_id.clone())
                    .or_default()
                    .push(subscription);
            }
        }

        let mut repaired = 0;
        for (user_id, mut subscriptions) in by_user {
            if subscriptions.len() < 2 {
                continue;
            }
            subscriptions.sort_by(|a, b| {
                b.start_date
                    .cmp(&a.start_date)
                    .then(b.created_at.cmp(&a.created_at))
            });
            for mut stale in subscriptions.into_iter().skip(1) {
                stale.state = SubscriptionState::Cancelled {
                    cancelled_at: stale.cancelled_at().unwrap_or(now),
                };
                stale.updated_at = now;
                self.store.save_subscription(&stale).await?;
                repaired += 1;
            }
            warn!(user_id = %user_id, "duplicate active subscriptions repaired");
        }
        Ok(repaired)
    }

    /// Removes subscriptions whose user no longer exists.
    pub async fn cleanup_orphans(&self, user_ids: &HashSet<String>) -> LedgerResult<usize> {
        let orphans: Vec<_> = self
            .store
            .list_subscriptions()
            .await?
            .into_iter()
            .filter(|subscription| !user_ids.contains(&subscription.user_id))
            .map(|subscription| subscription.id)
            .collect();
        if orphans.is_empty() {
            return Ok(0);
        }
        let deleted = self.store.delete_subscriptions(&orphans).await?;
        info!(deleted, "orphaned subscriptions removed");
        Ok(deleted)
    }

    /// Re-derives a user's membership flags from their subscription. A user
    /// left on a paid plan with nothing serving is downgraded. Returns whether
    /// anything changed.
    pub async fn sync_membership(&self, user_id: &str) -> LedgerResult<bool> {
        let mut user = self.load_user(user_id).await?;
        match self.active_subscription(user_id).await? {
            Some(subscription) => {
                let membership = membership_for(&subscription, &user.membership);
                if membership == user.membership {
                    return Ok(false);
                }
                user.membership = membership;
                self.store.save_user(&user).await?;
                Ok(true)
            }
            None if !user.is_on_free_plan() => self.downgrade_to_free(user_id, None).await,
            None if user.membership.is_subscribed => {
                user.membership = Membership {
                    subscription_status: Some(SubscriptionStatus::Cancelled),
                    plan_downgraded_at: user.membership.plan_downgraded_at,
                    ..Membership::free()
                };
                self.store.save_user(&user).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Runs [`Self::sync_membership`] for every user.
    pub async fn sync_all_membership(&self) -> LedgerResult<usize> {
        let mut updated = 0;
        for user in self.store.list_users().await? {
            match self.sync_membership(&user.id).await {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(e) => warn!(user_id = %user.id, error = %e, "status sync failed"),
            }
        }
        info!(updated, "subscription status sync finished");
        Ok(updated)
    }

    /// Brings one user's subscription up to date with the clock and reports
    /// where it stands.
    pub async fn verify_user_subscription_status(
        &self,
        user_id: &str,
    ) -> LedgerResult<SubscriptionSummary> {
        let now = self.clock.now();
        if let Some(mut subscription) = self.active_subscription(user_id).await? {
            let past_grace = matches!(
                subscription.state,
                SubscriptionState::PendingCancellation { .. }
                    | SubscriptionState::GracePeriod { .. }
            ) && now > subscription.end_date + grace_period();
            if past_grace {
                self.expire(&mut subscription, SubscriptionEvent::GracePeriodEnded)
                    .await?;
            } else if subscription.end_date < now {
                self.process_expired(&mut subscription, &mut ExpirySweep::default())
                    .await?;
            }
        }
        self.sync_membership(user_id).await?;

        let user = self.load_user(user_id).await?;
        let active = self.active_subscription(user_id).await?;
        Ok(SubscriptionSummary {
            user_id: user_id.to_owned(),
            is_subscribed: user.membership.is_subscribed,
            status: user.membership.subscription_status,
            plan_name: user.membership.plan_name.clone(),
            plan_type: user.membership.plan_type,
            is_trial: active.as_ref().is_some_and(|s| s.is_trial),
            auto_renew: active.as_ref().is_some_and(UserSubscription::auto_renew),
            end_date: active.map(|s| s.end_date),
        })
    }

    /// Mirrors a storefront subscription that is serving. Creates the local
    /// record if it went missing. Credits are granted again only when the
    /// expiry moved and the last grant is a day old; an existing record also
    /// requires a paid plan. Repeated polls of the same period never re-grant.
    pub async fn mirror_active(
        &self,
        user_id: &str,
        plan: &PlanSnapshot,
        payment_method: PaymentMethod,
        expiry: Option<DateTime<Utc>>,
        auto_renew: bool,
    ) -> LedgerResult<ActiveMirror> {
        let now = self.clock.now();
        let mut user = self.load_user(user_id).await?;

        let grant_is_stale = user
            .credits
            .last_credit_reset
            .map_or(true, |last| now - last >= credit_refresh_interval());

        let Some(mut subscription) = self.active_subscription(user_id).await? else {
            let end_date = expiry.unwrap_or_else(|| plan.plan_type.period_end(now));
            // An ended record with the same end date means this period was
            // already granted.
            let last_period_end = self
                .store
                .subscriptions_for_user(user_id)
                .await?
                .into_iter()
                .next()
                .map(|previous| previous.end_date);
            let credits_refreshed = last_period_end != Some(end_date) && grant_is_stale;
            let subscription = UserSubscription {
                id: SubscriptionId::generate(),
                user_id: user_id.to_owned(),
                plan_id: plan.plan_id.clone(),
                start_date: now,
                end_date,
                is_trial: false,
                payment_method,
                state: SubscriptionState::Active { auto_renew },
                plan_snapshot: plan.clone(),
                renewal_reminder_sent_for: None,
                created_at: now,
                updated_at: now,
            };
            self.store.save_subscription(&subscription).await?;
            if credits_refreshed {
                CreditLedger::<S>::apply_plan(
                    &mut user.credits,
                    user.membership.plan_type,
                    plan,
                    false,
                    now,
                );
            }
            user.membership = membership_for(&subscription, &user.membership);
            self.store.save_user(&user).await?;
            info!(user_id, credits_refreshed, "subscription restored from storefront");
            return Ok(ActiveMirror {
                updated: true,
                credits_refreshed,
            });
        };

        let expiry_changed = expiry.is_some_and(|expiry| expiry != subscription.end_date);
        let state = match subscription.state {
            SubscriptionState::PendingCancellation { .. } | SubscriptionState::GracePeriod { .. }
                if auto_renew =>
            {
                SubscriptionState::Active { auto_renew: true }
            }
            SubscriptionState::Active { .. } => SubscriptionState::Active { auto_renew },
            SubscriptionState::GracePeriod { cancelled_at } => {
                SubscriptionState::PendingCancellation { cancelled_at }
            }
            other => other,
        };
        let updated = expiry_changed || state != subscription.state;
        if updated {
            if let Some(expiry) = expiry {
                subscription.end_date = expiry;
            }
            subscription.state = state;
            subscription.updated_at = now;
            self.store.save_subscription(&subscription).await?;
        }

        let credits_refreshed = expiry_changed && grant_is_stale && !user.is_on_free_plan();
        if credits_refreshed {
            CreditLedger::<S>::apply_plan(
                &mut user.credits,
                user.membership.plan_type,
                &subscription.plan_snapshot,
                false,
                now,
            );
            info!(user_id, "credits refreshed for storefront renewal");
        }
        let membership = membership_for(&subscription, &user.membership);
        if credits_refreshed || membership != user.membership {
            user.membership = membership;
            self.store.save_user(&user).await?;
        }
        Ok(ActiveMirror {
            updated: updated || credits_refreshed,
            credits_refreshed,
        })
    }

    /// The storefront says the user turned off renewal but the period has not
    /// run out: keep serving, stop renewing. An existing cancellation time is
    /// kept.
    pub async fn mirror_pending_cancellation(
        &self,
        user_id: &str,
        cancelled_at: Option<DateTime<Utc>>,
    ) -> LedgerResult<bool> {
        let now = self.clock.now();
        let Some(mut subscription) = self.active_subscription(user_id).await? else {
            return Ok(false);
        };
        let SubscriptionState::Active { .. } = subscription.state else {
            return Ok(false);
        };
        subscription.state = SubscriptionState::PendingCancellation {
            cancelled_at: cancelled_at.unwrap_or(now),
        };
        subscription.updated_at = now;
        self.store.save_subscription(&subscription).await?;
        info!(user_id, "renewal turned off on storefront");
        Ok(true)
    }

    /// Mirrors a storefront grace period. Credits stay as they are.
    pub async fn mirror_grace_period(
        &self,
        user_id: &str,
        cancelled_at: Option<DateTime<Utc>>,
        expiry: Option<DateTime<Utc>>,
    ) -> LedgerResult<bool> {
        let now = self.clock.now();
        let Some(mut subscription) = self.active_subscription(user_id).await? else {
            return Ok(false);
        };
        let expiry_changed = expiry.is_some_and(|expiry| expiry != subscription.end_date);
        if matches!(subscription.state, SubscriptionState::GracePeriod { .. }) && !expiry_changed
        {
            return Ok(false);
        }
        let cancelled_at = subscription.cancelled_at().or(cancelled_at).unwrap_or(now);
        subscription.state = SubscriptionState::GracePeriod { cancelled_at };
        if let Some(expiry) = expiry {
            subscription.end_date = expiry;
        }
        subscription.updated_at = now;
        self.store.save_subscription(&subscription).await?;
        self.sync_membership(user_id).await?;
        info!(user_id, "subscription in grace period");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::{
        clock::ManualClock,
        data::{
            datasources::firebase_messaging_datasource::LoggingNotificationSender,
            repositories::in_memory_ledger_store::InMemoryLedgerStore,
        },
        domain::entities::plan::CreditAllotment,
    };

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryLedgerStore>,
        clock: Arc<ManualClock>,
        machine: SubscriptionStateMachine<InMemoryLedgerStore>,
        basic: Plan,
        premium: Plan,
        trial: Plan,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryLedgerStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let catalog = PlanCatalog::new(store.clone(), clock.clone());
        catalog.ensure_default_plans().await.unwrap();
        let basic = Plan::new("Basic", PlanType::Basic, 4.99, CreditAllotment::split(50), start());
        let premium =
            Plan::new("Premium", PlanType::Premium, 49.99, CreditAllotment::split(100), start());
        store
            .save_plans(vec![basic.clone(), premium.clone()])
            .await
            .unwrap();
        let trial = catalog.get_by_type(PlanType::Trial).await.unwrap().unwrap();
        store
            .save_user(&UserAccount::new("u1", "ana", start()))
            .await
            .unwrap();
        let notifier = Notifier::new(Arc::new(LoggingNotificationSender), store.clone());
        let machine = SubscriptionStateMachine::new(store.clone(), clock.clone(), catalog, notifier);
        Fixture {
            store,
            clock,
            machine,
            basic,
            premium,
            trial,
        }
    }

    async fn user(f: &Fixture) -> UserAccount {
        f.store.get_user("u1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn upgrades_reuse_the_serving_record() {
        let f = fixture().await;
        let first = f
            .machine
            .subscribe("u1", &f.basic, PaymentMethod::Stripe, false, None)
            .await
            .unwrap();
        assert_eq!(first.change, SubscriptionChange::Created);

        let second = f
            .machine
            .subscribe("u1", &f.premium, PaymentMethod::Stripe, false, None)
            .await
            .unwrap();
        assert_eq!(second.change, SubscriptionChange::Upgraded);
        assert_eq!(second.subscription.id, first.subscription.id);
        assert_eq!(second.subscription.plan_id, f.premium.id);

        let user = user(&f).await;
        assert_eq!(user.credits.total_credits, 150);
        assert_eq!(user.membership.plan_type, PlanType::Premium);
        assert!(!user.membership.watermark_enabled);
    }

    #[tokio::test]
    async fn trial_is_available_once_and_never_while_subscribed() {
        let f = fixture().await;
        f.machine
            .subscribe("u1", &f.trial, PaymentMethod::Stripe, true, None)
            .await
            .unwrap();
        let err = f
            .machine
            .subscribe("u1", &f.trial, PaymentMethod::Stripe, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::TrialUnavailable(_)));

        f.machine.cancel("u1", true).await.unwrap();
        let err = f
            .machine
            .subscribe("u1", &f.trial, PaymentMethod::Stripe, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::TrialUnavailable(_)));
    }

    #[tokio::test]
    async fn deferred_cancel_serves_until_grace_closes() {
        let f = fixture().await;
        let outcome = f
            .machine
            .subscribe("u1", &f.basic, PaymentMethod::Stripe, false, None)
            .await
            .unwrap();
        let end = outcome.subscription.end_date;

        let pending = f.machine.cancel("u1", false).await.unwrap();
        assert!(matches!(
            pending.state,
            SubscriptionState::PendingCancellation { .. }
        ));
        assert_eq!(pending.end_date, end);
        // Cancelling again changes nothing.
        assert_eq!(f.machine.cancel("u1", false).await.unwrap(), pending);

        f.clock.set(end + Duration::minutes(1));
        let sweep = f.machine.process_expired_subscriptions().await.unwrap();
        assert_eq!(sweep.entered_grace, 1);
        assert_eq!(
            user(&f).await.membership.subscription_status,
            Some(SubscriptionStatus::GracePeriod)
        );

        f.clock.set(end + grace_period());
        assert_eq!(f.machine.process_grace_period_subscriptions().await.unwrap(), 0);
        let serving = f.machine.active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(serving.plan_id, f.basic.id);

        f.clock.advance(Duration::seconds(1));
        assert_eq!(f.machine.process_grace_period_subscriptions().await.unwrap(), 1);
        assert!(f.machine.active_subscription("u1").await.unwrap().is_none());
        let user = user(&f).await;
        assert_eq!(user.credits.total_credits, 4);
        assert_eq!(user.credits.image_generation_credits, 0);
        assert!(!user.membership.is_subscribed);
    }

    #[tokio::test]
    async fn auto_renewing_subscription_renews_and_trial_expires() {
        let f = fixture().await;
        let outcome = f
            .machine
            .subscribe("u1", &f.basic, PaymentMethod::Stripe, false, None)
            .await
            .unwrap();
        f.clock.set(outcome.subscription.end_date + Duration::hours(1));
        let sweep = f.machine.process_expired_subscriptions().await.unwrap();
        assert_eq!(sweep.renewed, 1);
        let renewed = f.machine.active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(
            renewed.end_date,
            outcome.subscription.end_date + Duration::days(7)
        );

        f.store
            .save_user(&UserAccount::new("u2", "ben", start()))
            .await
            .unwrap();
        f.machine
            .subscribe("u2", &f.trial, PaymentMethod::Stripe, true, None)
            .await
            .unwrap();
        f.clock.advance(Duration::days(8));
        let sweep = f.machine.process_expired_subscriptions().await.unwrap();
        assert_eq!(sweep.trials_expired, 1);
        assert!(f.machine.active_subscription("u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn withdrawn_plan_fails_renewal() {
        let f = fixture().await;
        let outcome = f
            .machine
            .subscribe("u1", &f.premium, PaymentMethod::Stripe, false, None)
            .await
            .unwrap();
        let mut withdrawn = f.premium.clone();
        withdrawn.is_active = false;
        f.store.save_plans(vec![withdrawn]).await.unwrap();

        f.clock.set(outcome.subscription.end_date + Duration::hours(1));
        let sweep = f.machine.process_expired_subscriptions().await.unwrap();
        assert_eq!(sweep.payment_failed, 1);
        assert!(user(&f).await.is_on_free_plan());
    }

    #[tokio::test]
    async fn downgrade_is_skipped_when_done_today() {
        let f = fixture().await;
        f.machine
            .subscribe("u1", &f.basic, PaymentMethod::Stripe, false, None)
            .await
            .unwrap();
        assert!(f.machine.downgrade_to_free("u1", None).await.unwrap());
        assert!(!f.machine.downgrade_to_free("u1", None).await.unwrap());
        f.clock.advance(Duration::days(1));
        assert!(f.machine.downgrade_to_free("u1", None).await.unwrap());
    }

    #[tokio::test]
    async fn reminder_is_sent_once_per_period() {
        let f = fixture().await;
        let outcome = f
            .machine
            .subscribe("u1", &f.basic, PaymentMethod::Stripe, false, None)
            .await
            .unwrap();
        f.clock
            .set(outcome.subscription.end_date - Duration::days(2));
        assert_eq!(f.machine.send_renewal_reminders().await.unwrap(), 1);
        assert_eq!(f.machine.send_renewal_reminders().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_serving_records_collapse_to_newest() {
        let f = fixture().await;
        let outcome = f
            .machine
            .subscribe("u1", &f.basic, PaymentMethod::Stripe, false, None)
            .await
            .unwrap();
        let mut newer = outcome.subscription.clone();
        newer.id = SubscriptionId::generate();
        newer.start_date = start() + Duration::hours(1);
        f.store.save_subscription(&newer).await.unwrap();

        assert_eq!(f.machine.repair_duplicate_subscriptions().await.unwrap(), 1);
        let serving: Vec<_> = f
            .store
            .subscriptions_for_user("u1")
            .await
            .unwrap()
            .into_iter()
            .filter(UserSubscription::is_active)
            .collect();
        assert_eq!(serving.len(), 1);
        assert_eq!(serving[0].id, newer.id);
    }

    #[tokio::test]
    async fn storefront_poll_only_regrants_on_new_period() {
        let f = fixture().await;
        let outcome = f
            .machine
            .subscribe("u1", &f.basic, PaymentMethod::GooglePlay, false, None)
            .await
            .unwrap();
        let mut account = user(&f).await;
        account.credits.used_prompt_credits = 10;
        f.store.save_user(&account).await.unwrap();

        // Same period reported again.
        let snapshot = f.basic.snapshot();
        let mirror = f
            .machine
            .mirror_active(
                "u1",
                &snapshot,
                PaymentMethod::GooglePlay,
                Some(outcome.subscription.end_date),
                true,
            )
            .await
            .unwrap();
        assert!(!mirror.credits_refreshed);

        // Renewed on the storefront a day later.
        f.clock.advance(Duration::days(1));
        let mirror = f
            .machine
            .mirror_active(
                "u1",
                &snapshot,
                PaymentMethod::GooglePlay,
                Some(outcome.subscription.end_date + Duration::days(7)),
                true,
            )
            .await
            .unwrap();
        assert!(mirror.credits_refreshed);
        assert_eq!(user(&f).await.credits.used_prompt_credits, 0);
    }

    #[tokio::test]
    async fn storefront_billed_subscription_waits_for_the_storefront() {
        let f = fixture().await;
        let outcome = f
            .machine
            .subscribe("u1", &f.basic, PaymentMethod::Apple, false, None)
            .await
            .unwrap();

        f.clock.set(outcome.subscription.end_date + Duration::days(1));
        let sweep = f.machine.process_expired_subscriptions().await.unwrap();
        assert_eq!(sweep, ExpirySweep::default());
        let waiting = f.machine.active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(waiting.end_date, outcome.subscription.end_date);

        f.clock
            .set(outcome.subscription.end_date + grace_period() + Duration::minutes(1));
        let sweep = f.machine.process_expired_subscriptions().await.unwrap();
        assert_eq!(sweep.payment_failed, 1);
        assert!(f.machine.active_subscription("u1").await.unwrap().is_none());
        assert!(user(&f).await.is_on_free_plan());
    }
}
