use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    clock::{Clock, SystemClock},
    config::LedgerConfig,
    constants::{FIREBASE_MESSAGING_SCOPE, GOOGLE_PLAY_SCOPE},
    data::{
        datasources::{
            app_store_auth::AppleToken,
            app_store_connect_api_datasource::AppStoreConnectApiDatasourceImpl,
            app_store_receipt_datasource::AppStoreReceiptDatasourceImpl,
            app_store_server_api_datasource::AppStoreServerApiDatasourceImpl,
            firebase_messaging_datasource::{
                FirebaseMessagingDatasourceImpl, LoggingNotificationSender,
            },
            google_auth::GoogleAccessToken,
            google_play_developer_api_datasource::GooglePlayDeveloperApiDatasourceImpl,
            stripe_api_datasource::StripeApiDatasourceImpl,
        },
        repositories::{
            in_memory_ledger_store::InMemoryLedgerStore,
            storefront_repository_impl::StorefrontRepositoryImpl,
        },
    },
    domain::{
        entities::{
            generation::{GenerationLimit, GenerationType},
            payment_record::{PaymentMethod, PaymentStatus, Platform},
            plan::{Plan, PlanId, PlanType},
            user_account::CreditBalance,
            user_subscription::UserSubscription,
            verification::VerificationRequest,
        },
        repositories::{
            ledger_store::LedgerStore,
            notification_repository::{DeviceTokenLookup, NotificationSender},
            storefront_repository::StorefrontRepository,
        },
        services::{
            credit_ledger::{AdReward, AdRewardStatus, CreditLedger},
            notifier::Notifier,
            payment_ledger::{new_payment_record, PaymentLedger, RecordOutcome},
            plan_catalog::{PlanCatalog, PlanSyncReport},
            purchase_verifier::PurchaseVerifier,
            reconciler::{CancellationReconciler, SyncResult},
            subscription_state_machine::{
                ExpirySweep, SubscriptionChange, SubscriptionStateMachine, SubscriptionSummary,
            },
        },
    },
    errors::{LedgerError, LedgerResult, StorefrontApi},
    secrets::LedgerSecrets,
};

const SUBSCRIBED: &str = "Subscribed";
const ALREADY_SUBSCRIBED: &str = "Already subscribed";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    pub message: String,
    pub subscription: UserSubscription,
    /// `None` when the purchase had already been applied.
    pub change: Option<SubscriptionChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StripeCheckout {
    pub client_secret: String,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub orphaned_subscriptions: usize,
    pub orphaned_payment_records: usize,
    pub duplicate_payment_records: usize,
    pub duplicate_subscriptions: usize,
}

/// Everything one scheduler tick did. Failed tasks are listed in `failures`;
/// the tasks after them still ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunReport {
    pub plan_syncs: Vec<(Platform, PlanSyncReport)>,
    pub reconciliations: Vec<SyncResult>,
    pub expiry: Option<ExpirySweep>,
    pub grace_periods_ended: usize,
    pub reminders_sent: usize,
    pub statuses_synced: usize,
    pub cleanup: Option<CleanupReport>,
    pub free_credit_resets: usize,
    pub legacy_bonuses: usize,
    pub failures: Vec<String>,
}

impl TaskRunReport {
    fn fail(&mut self, task: &str, e: LedgerError) {
        error!(task, error = %e, "scheduled task failed");
        self.failures.push(format!("{task}: {e}"));
    }
}

/// Entry point for the rest of the backend: purchases, cancellations, credit
/// checks and the scheduled sweeps, over one document store and the three
/// billing platforms.
pub struct SubscriptionUtil<S, R: ?Sized = dyn StorefrontRepository> {
    store: Arc<S>,
    storefront: Arc<R>,
    clock: Arc<dyn Clock>,
    catalog: PlanCatalog<S>,
    payments: PaymentLedger<S>,
    verifier: PurchaseVerifier<R>,
    credits: CreditLedger<S>,
    machine: SubscriptionStateMachine<S>,
    reconciler: CancellationReconciler<S, R>,
}

impl<S, R> SubscriptionUtil<S, R>
where
    S: LedgerStore + DeviceTokenLookup + 'static,
    R: StorefrontRepository + ?Sized,
{
    /// Wires the services over caller-provided collaborators. Default plans
    /// are not created here; see [`Self::ensure_default_plans`].
    pub fn with_components(
        store: Arc<S>,
        storefront: Arc<R>,
        sender: Arc<dyn NotificationSender>,
        clock: Arc<dyn Clock>,
        config: &LedgerConfig,
    ) -> Self {
        let notifier = Notifier::new(sender, store.clone());
        let catalog = PlanCatalog::new(store.clone(), clock.clone());
        let payments = PaymentLedger::new(store.clone());
        let verifier = PurchaseVerifier::new(storefront.clone(), clock.clone());
        let credits = CreditLedger::new(
            store.clone(),
            clock.clone(),
            notifier.clone(),
            config.legacy_bonus_cutoff,
        );
        let machine =
            SubscriptionStateMachine::new(store.clone(), clock.clone(), catalog.clone(), notifier);
        let reconciler = CancellationReconciler::new(
            store.clone(),
            storefront.clone(),
            clock.clone(),
            payments.clone(),
            machine.clone(),
        )
        .with_poll_delays(config.google_poll_delay, config.apple_poll_delay);
        Self {
            store,
            storefront,
            clock,
            catalog,
            payments,
            verifier,
            credits,
            machine,
            reconciler,
        }
    }

    pub async fn ensure_default_plans(&self) -> LedgerResult<usize> {
        self.catalog.ensure_default_plans().await
    }

    pub async fn list_plans(&self) -> LedgerResult<Vec<Plan>> {
        self.catalog.list_active().await
    }

    /// Validates, verifies and applies a purchase of `plan_id`.
    ///
    /// Replaying a purchase that was already applied returns the user's
    /// subscription with "Already subscribed" and changes nothing. If the
    /// purchase verifies but cannot be stored, the payment is reversed and
    /// [`LedgerError::PersistenceFailed`] carries the reversal outcome.
    pub async fn subscribe(
        &self,
        user_id: &str,
        plan_id: &PlanId,
        request: &VerificationRequest,
    ) -> LedgerResult<SubscribeResponse> {
        if self.store.get_user(user_id).await?.is_none() {
            return Err(LedgerError::UserNotFound(user_id.to_owned()));
        }
        let plan = self.catalog.get_by_id(plan_id).await?;
        if !plan.is_active || plan.plan_type.is_free() || plan.plan_type == PlanType::Trial {
            return Err(LedgerError::InvalidRequest(format!(
                "plan '{}' cannot be purchased",
                plan.name
            )));
        }

        if let Some(claimed) = request.claimed_transaction_id() {
            if let Some(existing) = self.payments.find(claimed, &plan.id).await? {
                return self.already_subscribed(user_id, &existing.user_id).await;
            }
        }
        if let VerificationRequest::GooglePlay { purchase_token, .. } = request {
            if let Some(existing) = self
                .payments
                .find_by_receipt(Platform::Android, purchase_token, &plan.id)
                .await?
            {
                return self.already_subscribed(user_id, &existing.user_id).await;
            }
        }

        let verification = self.verifier.verify_for_plan(request, &plan).await?;
        let record = new_payment_record(user_id, &plan, request, &verification, self.clock.now());
        let record = match self.payments.record(record).await {
            Ok(RecordOutcome::Inserted(record)) => record,
            Ok(RecordOutcome::Existing(existing)) => {
                return self.already_subscribed(user_id, &existing.user_id).await;
            }
            Err(e) => return Err(self.reverse(request, e).await),
        };

        match self
            .machine
            .subscribe(
                user_id,
                &plan,
                request.payment_method(),
                false,
                verification.expires_date,
            )
            .await
        {
            Ok(outcome) => Ok(SubscribeResponse {
                message: SUBSCRIBED.to_owned(),
                subscription: outcome.subscription,
                change: Some(outcome.change),
            }),
            Err(e) => {
                let mut record = record;
                record.status = PaymentStatus::Cancelled;
                record.updated_at = self.clock.now();
                if let Err(mark_err) = self.payments.save(&record).await {
                    warn!(
                        transaction_id = %record.transaction_id,
                        error = %mark_err,
                        "could not mark unapplied payment as cancelled"
                    );
                }
                Err(self.reverse(request, e).await)
            }
        }
    }

    async fn already_subscribed(
        &self,
        user_id: &str,
        owner_id: &str,
    ) -> LedgerResult<SubscribeResponse> {
        if owner_id != user_id {
            warn!(user_id, owner_id, "purchase replayed by another account");
            return Err(LedgerError::VerificationFailed(
                "purchase belongs to another account".to_owned(),
            ));
        }
        let subscription = match self.machine.active_subscription(user_id).await? {
            Some(subscription) => subscription,
            None => self
                .store
                .subscriptions_for_user(user_id)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| LedgerError::SubscriptionNotFound(user_id.to_owned()))?,
        };
        info!(user_id, subscription_id = %subscription.id, "purchase already applied");
        Ok(SubscribeResponse {
            message: ALREADY_SUBSCRIBED.to_owned(),
            subscription,
            change: None,
        })
    }

    async fn reverse(&self, request: &VerificationRequest, source: LedgerError) -> LedgerError {
        error!(
            payment_method = ?request.payment_method(),
            error = %source,
            "verified payment could not be applied; reversing"
        );
        let reversal = self.verifier.reverse(request).await;
        LedgerError::PersistenceFailed {
            source: Box::new(source),
            reversal,
        }
    }

    /// Starts the one free trial a user gets.
    pub async fn start_free_trial(&self, user_id: &str) -> LedgerResult<UserSubscription> {
        let trial = match self.catalog.get_by_type(PlanType::Trial).await? {
            Some(plan) => plan,
            None => {
                self.catalog.ensure_default_plans().await?;
                self.catalog
                    .get_by_type(PlanType::Trial)
                    .await?
                    .ok_or_else(|| LedgerError::PlanNotFound(PlanType::Trial.to_string()))?
            }
        };
        // Trials are not billed anywhere; the local expiry sweep ends them.
        let outcome = self
            .machine
            .subscribe(user_id, &trial, PaymentMethod::Stripe, true, None)
            .await?;
        Ok(outcome.subscription)
    }

    pub async fn cancel_subscription(
        &self,
        user_id: &str,
        immediate: bool,
    ) -> LedgerResult<UserSubscription> {
        self.machine.cancel(user_id, immediate).await
    }

    pub async fn subscription_status(&self, user_id: &str) -> LedgerResult<SubscriptionSummary> {
        self.machine.verify_user_subscription_status(user_id).await
    }

    /// Creates the PaymentIntent a client confirms to buy `plan_id` with a
    /// card.
    pub async fn create_stripe_payment_intent(
        &self,
        user_id: &str,
        plan_id: &PlanId,
    ) -> LedgerResult<StripeCheckout> {
        if self.store.get_user(user_id).await?.is_none() {
            return Err(LedgerError::UserNotFound(user_id.to_owned()));
        }
        let plan = self.catalog.get_by_id(plan_id).await?;
        if !plan.is_active || plan.price <= 0.0 {
            return Err(LedgerError::InvalidRequest(format!(
                "plan '{}' cannot be purchased",
                plan.name
            )));
        }
        let amount_cents = plan.price_cents();
        let metadata = BTreeMap::from([
            ("userId".to_owned(), user_id.to_owned()),
            ("planId".to_owned(), plan.id.to_string()),
        ]);
        let client_secret = self
            .storefront
            .create_payment_intent(amount_cents, metadata)
            .await?;
        info!(user_id, plan_id = %plan.id, amount_cents, "payment intent created");
        Ok(StripeCheckout {
            client_secret,
            amount_cents,
            currency: plan.currency,
        })
    }

    pub async fn check_generation_limits(
        &self,
        user_id: &str,
        kind: GenerationType,
    ) -> LedgerResult<GenerationLimit> {
        self.credits.check_generation_limits(user_id, kind).await
    }

    pub async fn record_generation_usage(
        &self,
        user_id: &str,
        kind: GenerationType,
        amount: i64,
    ) -> LedgerResult<CreditBalance> {
        self.credits
            .record_generation_usage(user_id, kind, amount)
            .await
    }

    pub async fn can_watch_ad(&self, user_id: &str) -> LedgerResult<AdRewardStatus> {
        self.credits.can_watch_ad(user_id).await
    }

    pub async fn grant_ad_reward(&self, user_id: &str) -> LedgerResult<AdReward> {
        self.credits.grant_ad_reward(user_id).await
    }

    pub async fn award_legacy_bonus(&self, user_id: &str) -> LedgerResult<bool> {
        self.credits.award_legacy_bonus(user_id).await
    }

    pub async fn reset_daily_free_credits(&self) -> LedgerResult<usize> {
        self.credits.reset_daily_free_credits().await
    }

    pub async fn sync_plans(&self, platform: Platform) -> LedgerResult<PlanSyncReport> {
        self.catalog
            .sync_from_storefront(self.storefront.as_ref(), platform)
            .await
    }

    pub async fn sync_google(&self) -> LedgerResult<SyncResult> {
        self.reconciler.sync_google().await
    }

    pub async fn sync_apple(&self) -> LedgerResult<SyncResult> {
        self.reconciler.sync_apple().await
    }

    pub async fn process_expired_subscriptions(&self) -> LedgerResult<ExpirySweep> {
        self.machine.process_expired_subscriptions().await
    }

    pub async fn process_grace_period_subscriptions(&self) -> LedgerResult<usize> {
        self.machine.process_grace_period_subscriptions().await
    }

    /// Drops records of deleted users and collapses duplicates.
    pub async fn cleanup(&self) -> LedgerResult<CleanupReport> {
        let user_ids: HashSet<String> = self
            .store
            .list_users()
            .await?
            .into_iter()
            .map(|user| user.id)
            .collect();
        let report = CleanupReport {
            orphaned_subscriptions: self.machine.cleanup_orphans(&user_ids).await?,
            orphaned_payment_records: self.payments.cleanup_orphans(&user_ids).await?,
            duplicate_payment_records: self.payments.cleanup_duplicates().await?,
            duplicate_subscriptions: self.machine.repair_duplicate_subscriptions().await?,
        };
        info!(?report, "cleanup finished");
        Ok(report)
    }

    /// One scheduler tick: plan sync, storefront reconciliation, local
    /// expiry and grace sweeps, reminders, status sync, cleanup and the
    /// free-credit reset, in that order.
    pub async fn run_all_tasks(&self) -> TaskRunReport {
        let mut report = TaskRunReport::default();

        for platform in [Platform::Android, Platform::Ios] {
            match self.sync_plans(platform).await {
                Ok(sync) => report.plan_syncs.push((platform, sync)),
                Err(e) => report.fail("plan sync", e),
            }
        }
        match self.sync_google().await {
            Ok(result) => report.reconciliations.push(result),
            Err(e) => report.fail("google reconciliation", e),
        }
        match self.sync_apple().await {
            Ok(result) => report.reconciliations.push(result),
            Err(e) => report.fail("apple reconciliation", e),
        }
        match self.process_expired_subscriptions().await {
            Ok(sweep) => report.expiry = Some(sweep),
            Err(e) => report.fail("expiry sweep", e),
        }
        match self.process_grace_period_subscriptions().await {
            Ok(ended) => report.grace_periods_ended = ended,
            Err(e) => report.fail("grace period sweep", e),
        }
        match self.machine.send_renewal_reminders().await {
            Ok(sent) => report.reminders_sent = sent,
            Err(e) => report.fail("renewal reminders", e),
        }
        match self.machine.sync_all_membership().await {
            Ok(synced) => report.statuses_synced = synced,
            Err(e) => report.fail("status sync", e),
        }
        match self.cleanup().await {
            Ok(cleanup) => report.cleanup = Some(cleanup),
            Err(e) => report.fail("cleanup", e),
        }
        match self.reset_daily_free_credits().await {
            Ok(reset) => report.free_credit_resets = reset,
            Err(e) => report.fail("free credit reset", e),
        }
        match self.credits.award_legacy_bonuses().await {
            Ok(awarded) => report.legacy_bonuses = awarded,
            Err(e) => report.fail("legacy bonus", e),
        }

        info!(failures = report.failures.len(), "scheduled tasks finished");
        report
    }

    /// Flushes and releases the store.
    pub async fn shutdown(&self) -> LedgerResult<()> {
        Ok(self.store.close().await?)
    }
}

impl SubscriptionUtil<InMemoryLedgerStore> {
    /// Production wiring: live storefront clients, Firebase delivery when a
    /// key is configured, and the in-memory store (persisted to
    /// `config.snapshot_path` when set).
    pub async fn new(secrets: &LedgerSecrets, config: &LedgerConfig) -> LedgerResult<Self> {
        let server_token = AppleToken::signing_key(
            StorefrontApi::AppStoreServerApi,
            &secrets.apple_api_private_key,
            &secrets.apple_api_key_id,
            &secrets.apple_api_issuer_id,
            Some(&secrets.apple_bundle_id),
        )?;
        let connect_token = AppleToken::signing_key(
            StorefrontApi::AppStoreConnectApi,
            &secrets.apple_api_private_key,
            &secrets.apple_api_key_id,
            &secrets.apple_api_issuer_id,
            None,
        )?;
        let google_token = GoogleAccessToken::service_account(
            StorefrontApi::GooglePlayDeveloperApi,
            &secrets.google_service_account_key,
            GOOGLE_PLAY_SCOPE,
        )?;
        let storefront: Arc<dyn StorefrontRepository> = Arc::new(StorefrontRepositoryImpl::new(
            AppStoreServerApiDatasourceImpl::new(server_token),
            AppStoreConnectApiDatasourceImpl::new(connect_token),
            AppStoreReceiptDatasourceImpl::new(
                secrets.apple_shared_secret.clone(),
                config.apple_use_sandbox,
            ),
            GooglePlayDeveloperApiDatasourceImpl::new(
                secrets.google_play_package_name.clone(),
                google_token,
            ),
            StripeApiDatasourceImpl::new(&secrets.stripe_secret_key),
            secrets.apple_app_id.clone(),
        ));

        let sender: Arc<dyn NotificationSender> = match &secrets.firebase_service_account_key {
            Some(key) => Arc::new(FirebaseMessagingDatasourceImpl::new(
                secrets.firebase_project_id.clone(),
                GoogleAccessToken::service_account(
                    StorefrontApi::FirebaseMessagingApi,
                    key,
                    FIREBASE_MESSAGING_SCOPE,
                )?,
            )),
            None => {
                warn!("FIREBASE_SERVICE_ACCOUNT_KEY not set; notifications will only be logged");
                Arc::new(LoggingNotificationSender)
            }
        };

        let store = Arc::new(match &config.snapshot_path {
            Some(path) => InMemoryLedgerStore::open(path).await?,
            None => InMemoryLedgerStore::new(),
        });

        let util = Self::with_components(store, storefront, sender, Arc::new(SystemClock), config);
        util.ensure_default_plans().await?;
        Ok(util)
    }
}
