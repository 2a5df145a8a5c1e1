#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use iap_ledger::{
    clock::{Clock, ManualClock},
    config::LedgerConfig,
    domain::{
        entities::{
            notification::NotificationPayload,
            payment_record::Platform,
            plan::{CreditAllotment, Plan, PlanType, StorefrontProduct},
            storefront_status::StorefrontLookup,
            user_account::UserAccount,
            verification::{VerificationRequest, VerificationResult},
        },
        repositories::{
            ledger_store::LedgerStore, notification_repository::NotificationSender,
            storefront_repository::StorefrontRepository,
        },
    },
    errors::{ReversalStatus, StorefrontApi, StorefrontError},
    util::SubscriptionUtil,
    InMemoryLedgerStore,
};

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap()
}

pub fn server_error(api: StorefrontApi, status: u16) -> StorefrontError {
    StorefrontError::Callout {
        api,
        operation: "scripted".to_owned(),
        status: Some(status),
        message: format!("callout returned with {status} status code"),
        debug: None,
    }
}

/// Storefront whose answers are set by the test. Status lookups answer from
/// a queue per key; the last answer repeats once the queue is drained, so a
/// test can script a sequence of stale or conflicting polls.
#[derive(Default)]
pub struct ScriptedStorefront {
    verdicts: Mutex<HashMap<String, VerificationResult>>,
    google: Mutex<HashMap<String, VecDeque<Result<StorefrontLookup, u16>>>>,
    apple: Mutex<HashMap<String, VecDeque<Result<StorefrontLookup, u16>>>>,
    products: Mutex<HashMap<Platform, Result<Vec<StorefrontProduct>, u16>>>,
    reversal: Mutex<Option<ReversalStatus>>,
    stripe_intents: Mutex<HashMap<String, (i64, String)>>,
    pub reversals: Mutex<Vec<VerificationRequest>>,
    pub payment_intents: Mutex<Vec<(i64, BTreeMap<String, String>)>>,
}

impl ScriptedStorefront {
    /// Purchases verify by default; this overrides the verdict for one
    /// receipt.
    pub fn verdict(&self, receipt: &str, result: VerificationResult) {
        self.verdicts
            .lock()
            .unwrap()
            .insert(receipt.to_owned(), result);
    }

    /// Registers a succeeded PaymentIntent paying `amount_cents` for
    /// `plan_id`.
    pub fn stripe_intent(&self, payment_intent_id: &str, amount_cents: i64, plan_id: &str) {
        self.stripe_intents.lock().unwrap().insert(
            payment_intent_id.to_owned(),
            (amount_cents, plan_id.to_owned()),
        );
    }

    pub fn apple_polls(&self, id: &str, answers: Vec<Result<StorefrontLookup, u16>>) {
        self.apple
            .lock()
            .unwrap()
            .insert(id.to_owned(), answers.into());
    }

    pub fn google_polls(&self, token: &str, answers: Vec<Result<StorefrontLookup, u16>>) {
        self.google
            .lock()
            .unwrap()
            .insert(token.to_owned(), answers.into());
    }

    pub fn products(&self, platform: Platform, products: Result<Vec<StorefrontProduct>, u16>) {
        self.products.lock().unwrap().insert(platform, products);
    }

    pub fn reversal_outcome(&self, status: ReversalStatus) {
        *self.reversal.lock().unwrap() = Some(status);
    }

    fn next(
        polls: &Mutex<HashMap<String, VecDeque<Result<StorefrontLookup, u16>>>>,
        key: &str,
        api: StorefrontApi,
    ) -> Result<StorefrontLookup, StorefrontError> {
        let mut polls = polls.lock().unwrap();
        let answer = match polls.get_mut(key) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        match answer {
            Some(Ok(lookup)) => Ok(lookup),
            Some(Err(status)) => Err(server_error(api, status)),
            None => Ok(StorefrontLookup::NotFound),
        }
    }
}

#[async_trait]
impl StorefrontRepository for ScriptedStorefront {
    async fn verify_purchase(
        &self,
        request: &VerificationRequest,
        _now: DateTime<Utc>,
    ) -> Result<VerificationResult, StorefrontError> {
        if let Some(result) = self.verdicts.lock().unwrap().get(request.receipt_data()) {
            return Ok(result.clone());
        }
        if let VerificationRequest::Stripe { payment_intent_id } = request {
            let intent = self.stripe_intents.lock().unwrap().get(payment_intent_id).cloned();
            return Ok(match intent {
                Some((amount_cents, plan_id)) => VerificationResult {
                    amount_cents: Some(amount_cents),
                    plan_id: Some(plan_id),
                    ..VerificationResult::verified(payment_intent_id)
                },
                None => VerificationResult::verified(payment_intent_id),
            });
        }
        let transaction_id = request
            .claimed_transaction_id()
            .unwrap_or(request.receipt_data());
        Ok(VerificationResult {
            product_id: request.product_id().map(str::to_owned),
            ..VerificationResult::verified(transaction_id)
        })
    }

    async fn google_subscription_status(
        &self,
        purchase_token: &str,
    ) -> Result<StorefrontLookup, StorefrontError> {
        Self::next(
            &self.google,
            purchase_token,
            StorefrontApi::GooglePlayDeveloperApi,
        )
    }

    async fn apple_subscription_status(
        &self,
        original_transaction_id: &str,
    ) -> Result<StorefrontLookup, StorefrontError> {
        Self::next(
            &self.apple,
            original_transaction_id,
            StorefrontApi::AppStoreServerApi,
        )
    }

    async fn list_products(
        &self,
        platform: Platform,
    ) -> Result<Vec<StorefrontProduct>, StorefrontError> {
        match self.products.lock().unwrap().get(&platform).cloned() {
            Some(Ok(products)) => Ok(products),
            Some(Err(status)) => Err(server_error(StorefrontApi::AppStoreConnectApi, status)),
            None => Ok(Vec::new()),
        }
    }

    async fn reverse_payment(&self, request: &VerificationRequest) -> ReversalStatus {
        self.reversals.lock().unwrap().push(request.clone());
        self.reversal
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(ReversalStatus::Reversed {
                reference: "re_scripted".to_owned(),
            })
    }

    async fn create_payment_intent(
        &self,
        amount_cents: i64,
        metadata: BTreeMap<String, String>,
    ) -> Result<String, StorefrontError> {
        self.payment_intents
            .lock()
            .unwrap()
            .push((amount_cents, metadata));
        Ok("pi_scripted_secret".to_owned())
    }
}

/// Keeps every notification so tests can assert on what users were told.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(String, NotificationPayload)>>,
}

impl RecordingSender {
    /// `eventType` of every notification sent to `user_id`, oldest first.
    pub fn events_for(&self, user_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(recipient, _)| recipient == user_id)
            .filter_map(|(_, payload)| payload.data.get("eventType").cloned())
            .collect()
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send_custom_notification(
        &self,
        recipient_id: &str,
        _actor_id: &str,
        _device_tokens: &[String],
        payload: &NotificationPayload,
    ) -> Result<(), StorefrontError> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient_id.to_owned(), payload.clone()));
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<InMemoryLedgerStore>,
    pub storefront: Arc<ScriptedStorefront>,
    pub sender: Arc<RecordingSender>,
    pub clock: Arc<ManualClock>,
    pub util: SubscriptionUtil<InMemoryLedgerStore, ScriptedStorefront>,
}

pub async fn harness() -> Harness {
    harness_with(LedgerConfig::without_delays()).await
}

pub async fn harness_with(config: LedgerConfig) -> Harness {
    let store = Arc::new(InMemoryLedgerStore::new());
    let storefront = Arc::new(ScriptedStorefront::default());
    let sender = Arc::new(RecordingSender::default());
    let clock = Arc::new(ManualClock::new(start()));
    let util = SubscriptionUtil::with_components(
        store.clone(),
        storefront.clone(),
        sender.clone() as Arc<dyn NotificationSender>,
        clock.clone() as Arc<dyn Clock>,
        &config,
    );
    util.ensure_default_plans().await.unwrap();
    Harness {
        store,
        storefront,
        sender,
        clock,
        util,
    }
}

impl Harness {
    pub async fn add_user(&self, id: &str) -> UserAccount {
        let user = UserAccount::new(id, id, self.clock.now());
        self.store.save_user(&user).await.unwrap();
        user
    }

    pub async fn user(&self, id: &str) -> UserAccount {
        self.store.get_user(id).await.unwrap().unwrap()
    }

    pub async fn add_plan(&self, name: &str, plan_type: PlanType, price: f64, credits: i64) -> Plan {
        let mut plan = Plan::new(
            name,
            plan_type,
            price,
            CreditAllotment::split(credits),
            self.clock.now(),
        );
        let slug = name.to_ascii_lowercase().replace(' ', "_");
        plan.google_product_id = Some(format!("{slug}_google"));
        plan.apple_product_id = Some(format!("com.app.{slug}"));
        self.store.save_plans(vec![plan.clone()]).await.unwrap();
        plan
    }

    /// A card payment for `plan` at its listed price.
    pub fn paid(&self, plan: &Plan, payment_intent_id: &str) -> VerificationRequest {
        self.storefront
            .stripe_intent(payment_intent_id, plan.price_cents(), &plan.id.to_string());
        stripe(payment_intent_id)
    }
}

pub fn stripe(payment_intent_id: &str) -> VerificationRequest {
    VerificationRequest::Stripe {
        payment_intent_id: payment_intent_id.to_owned(),
    }
}

pub fn apple(plan: &Plan, original_transaction_id: &str) -> VerificationRequest {
    VerificationRequest::Apple {
        receipt_data: format!("eyJ.{original_transaction_id}.sig"),
        product_id: plan.apple_product_id.clone().unwrap_or_default(),
        transaction_id: Some(original_transaction_id.to_owned()),
        original_transaction_id: Some(original_transaction_id.to_owned()),
    }
}

pub fn google(plan: &Plan, purchase_token: &str) -> VerificationRequest {
    VerificationRequest::GooglePlay {
        purchase_token: purchase_token.to_owned(),
        product_id: plan.google_product_id.clone().unwrap_or_default(),
        order_id: None,
    }
}
