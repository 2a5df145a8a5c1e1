use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    constants::APPLE_TRANSACTION_ID_MIN_LEN,
    domain::{
        entities::{
            notification::SubscriptionEvent,
            payment_record::{PaymentRecord, PaymentStatus, Platform},
            storefront_status::{
                classify_not_found, CancellationType, FinalStatus, StorefrontLookup,
                StorefrontStatus,
            },
        },
        repositories::{ledger_store::LedgerStore, storefront_repository::StorefrontRepository},
    },
    errors::{LedgerError, LedgerResult},
};

use super::{
    payment_ledger::PaymentLedger, subscription_state_machine::SubscriptionStateMachine,
};

/// What reconciliation did for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "reason", rename_all = "snake_case")]
pub enum SyncAction {
    Downgraded,
    PendingCancellation,
    GracePeriod,
    Refreshed,
    Unchanged,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDetail {
    pub user_id: String,
    pub transaction_id: String,
    #[serde(flatten)]
    pub action: SyncAction,
}

/// Outcome of one reconciliation pass over a storefront.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub platform: Platform,
    pub processed: usize,
    pub updated: usize,
    pub errors: usize,
    pub skipped: usize,
    pub details: Vec<SyncDetail>,
}

impl SyncResult {
    fn new(platform: Platform) -> Self {
        Self {
            platform,
            processed: 0,
            updated: 0,
            errors: 0,
            skipped: 0,
            details: Vec::new(),
        }
    }

    fn push(&mut self, record: &PaymentRecord, action: SyncAction) {
        match &action {
            SyncAction::Downgraded
            | SyncAction::PendingCancellation
            | SyncAction::GracePeriod
            | SyncAction::Refreshed => self.updated += 1,
            SyncAction::Skipped(_) => self.skipped += 1,
            SyncAction::Failed(_) => self.errors += 1,
            SyncAction::Unchanged => {}
        }
        self.details.push(SyncDetail {
            user_id: record.user_id.clone(),
            transaction_id: record.transaction_id.clone(),
            action,
        });
    }
}

/// Polls Google Play and the App Store for the authoritative state of every
/// recorded purchase and converges local subscriptions and credits to it.
///
/// Users are handled one after another with a short pause between storefront
/// calls. One user's failure is counted and the pass moves on, except for an
/// App Store auth failure, which would fail for everyone and aborts.
pub struct CancellationReconciler<S, R: ?Sized> {
    store: Arc<S>,
    storefront: Arc<R>,
    clock: Arc<dyn Clock>,
    payments: PaymentLedger<S>,
    machine: SubscriptionStateMachine<S>,
    google_poll_delay: Duration,
    apple_poll_delay: Duration,
}

fn is_valid_apple_transaction_id(id: &str) -> bool {
    id.len() >= APPLE_TRANSACTION_ID_MIN_LEN && id.bytes().all(|b| b.is_ascii_digit())
}

impl<S: LedgerStore, R: StorefrontRepository + ?Sized> CancellationReconciler<S, R> {
    pub fn new(
        store: Arc<S>,
        storefront: Arc<R>,
        clock: Arc<dyn Clock>,
        payments: PaymentLedger<S>,
        machine: SubscriptionStateMachine<S>,
    ) -> Self {
        Self {
            store,
            storefront,
            clock,
            payments,
            machine,
            google_poll_delay: Duration::from_millis(50),
            apple_poll_delay: Duration::from_millis(100),
        }
    }

    pub fn with_poll_delays(mut self, google: Duration, apple: Duration) -> Self {
        self.google_poll_delay = google;
        self.apple_poll_delay = apple;
        self
    }

    pub async fn sync_google(&self) -> LedgerResult<SyncResult> {
        self.sync(Platform::Android).await
    }

    pub async fn sync_apple(&self) -> LedgerResult<SyncResult> {
        self.sync(Platform::Ios).await
    }

    /// The identifier the storefront knows the purchase by, or why there is
    /// none worth asking about.
    fn lookup_key<'a>(platform: Platform, record: &'a PaymentRecord) -> Result<&'a str, String> {
        match platform {
            Platform::Android => Some(record.receipt_data.as_str())
                .filter(|token| !token.is_empty())
                .ok_or_else(|| "missing purchase token".to_owned()),
            Platform::Ios => {
                let id = record
                    .original_transaction_id
                    .as_deref()
                    .filter(|id| !id.is_empty())
                    .unwrap_or(record.transaction_id.as_str());
                if is_valid_apple_transaction_id(id) {
                    Ok(id)
                } else {
                    Err(format!("invalid transaction id '{id}'"))
                }
            }
            Platform::Stripe => Err("stripe purchases are not reconciled".to_owned()),
        }
    }

    async fn sync(&self, platform: Platform) -> LedgerResult<SyncResult> {
        let delay = match platform {
            Platform::Android => self.google_poll_delay,
            _ => self.apple_poll_delay,
        };
        let records = self.payments.latest_per_user(platform).await?;
        let mut result = SyncResult::new(platform);
        info!(%platform, users = records.len(), "reconciliation pass started");

        for (index, record) in records.iter().enumerate() {
            result.processed += 1;
            let key = match Self::lookup_key(platform, record) {
                Ok(key) => key,
                Err(reason) => {
                    debug!(user_id = %record.user_id, reason = %reason, "record skipped");
                    result.push(record, SyncAction::Skipped(reason));
                    continue;
                }
            };
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let lookup = match platform {
                Platform::Android => self.storefront.google_subscription_status(key).await,
                _ => self.storefront.apple_subscription_status(key).await,
            };
            let lookup = match lookup {
                Ok(lookup) => lookup,
                Err(e) if platform == Platform::Ios && e.is_unauthorized() => {
                    error!(error = %e, "App Store rejected our credentials; aborting pass");
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(user_id = %record.user_id, %platform, error = %e, "status lookup failed");
                    result.push(record, SyncAction::Failed(e.to_string()));
                    continue;
                }
            };

            let now = self.clock.now();
            let status = match lookup {
                StorefrontLookup::Found(subscription) => subscription.classify(now),
                StorefrontLookup::ExpiredTooLong => StorefrontStatus::expired(record.expiry_date),
                StorefrontLookup::NotFound => {
                    match classify_not_found(record.expiry_date, record.created_at, now) {
                        Some(status) => status,
                        None => {
                            result.push(
                                record,
                                SyncAction::Skipped("not found; too recent to expire".to_owned()),
                            );
                            continue;
                        }
                    }
                }
            };

            match self.converge(platform, record, &status).await {
                Ok(action) => result.push(record, action),
                Err(e) => {
                    warn!(user_id = %record.user_id, %platform, error = %e, "convergence failed");
                    result.push(record, SyncAction::Failed(e.to_string()));
                }
            }
        }

        info!(
            %platform,
            processed = result.processed,
            updated = result.updated,
            errors = result.errors,
            skipped = result.skipped,
            "reconciliation pass finished"
        );
        Ok(result)
    }

    /// Writes the storefront's verdict to the payment record, then moves the
    /// user's subscription and credits to match it.
    async fn converge(
        &self,
        platform: Platform,
        record: &PaymentRecord,
        status: &StorefrontStatus,
    ) -> LedgerResult<SyncAction> {
        let now = self.clock.now();
        let user_id = record.user_id.as_str();

        let mut updated_record = record.clone();
        updated_record.status = match status.final_status {
            FinalStatus::Active => PaymentStatus::Completed,
            FinalStatus::GracePeriod => PaymentStatus::GracePeriod,
            FinalStatus::Cancelled => PaymentStatus::Cancelled,
        };
        updated_record.cancellation_type = Some(status.cancellation_type);
        if status.expiry_time.is_some() {
            updated_record.expiry_date = status.expiry_time;
        }
        if status.final_status != FinalStatus::Active {
            updated_record.cancelled_at = record.cancelled_at.or(status.cancelled_at).or(Some(now));
        }
        updated_record.last_checked = Some(now);
        updated_record.updated_at = now;
        self.payments.save(&updated_record).await?;

        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_owned()))?;
        let serving = self.machine.active_subscription(user_id).await?;
        if let Some(subscription) = &serving {
            if subscription.payment_method.platform() != platform {
                return Ok(SyncAction::Skipped(format!(
                    "serving subscription is billed through {}",
                    subscription.payment_method.platform()
                )));
            }
        }

        let action = match (status.final_status, status.is_expired) {
            (FinalStatus::Cancelled, true) => {
                if serving.is_none() && user.is_on_free_plan() {
                    return Ok(SyncAction::Unchanged);
                }
                if self
                    .payments
                    .has_other_live_record(user_id, platform, record.id, now)
                    .await?
                {
                    return Ok(SyncAction::Skipped(
                        "another live purchase exists".to_owned(),
                    ));
                }
                let event = match status.cancellation_type {
                    CancellationType::Refunded | CancellationType::Revoked => {
                        SubscriptionEvent::Cancelled
                    }
                    _ => SubscriptionEvent::Expired,
                };
                if self.machine.downgrade_to_free(user_id, Some(event)).await? {
                    SyncAction::Downgraded
                } else {
                    SyncAction::Unchanged
                }
            }
            (FinalStatus::Cancelled, false) => {
                if self
                    .machine
                    .mirror_pending_cancellation(user_id, status.cancelled_at)
                    .await?
                {
                    SyncAction::PendingCancellation
                } else {
                    SyncAction::Unchanged
                }
            }
            (FinalStatus::GracePeriod, _) => {
                if self
                    .machine
                    .mirror_grace_period(user_id, status.cancelled_at, status.expiry_time)
                    .await?
                {
                    SyncAction::GracePeriod
                } else {
                    SyncAction::Unchanged
                }
            }
            (FinalStatus::Active, _) => {
                let plan = match self.store.get_plan(&record.plan_id).await? {
                    Some(plan) => plan.snapshot(),
                    None => record.plan_snapshot.clone(),
                };
                let mirror = self
                    .machine
                    .mirror_active(
                        user_id,
                        &plan,
                        record.payment_method,
                        status.expiry_time,
                        status.auto_renewing,
                    )
                    .await?;
                if mirror.updated {
                    SyncAction::Refreshed
                } else {
                    SyncAction::Unchanged
                }
            }
        };
        debug!(user_id, %platform, action = ?action, "user reconciled");
        Ok(action)
    }
}
