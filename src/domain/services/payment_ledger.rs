use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::{
    domain::{
        entities::{
            payment_record::{PaymentRecord, PaymentRecordId, PaymentStatus, Platform},
            plan::{Plan, PlanId},
            verification::{VerificationRequest, VerificationResult},
        },
        repositories::ledger_store::LedgerStore,
    },
    errors::{LedgerResult, StoreError},
};

/// Result of recording a verified purchase.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Inserted(PaymentRecord),
    /// The `(transaction_id, plan_id)` pair was already recorded.
    Existing(PaymentRecord),
}

impl RecordOutcome {
    pub fn record(&self) -> &PaymentRecord {
        match self {
            RecordOutcome::Inserted(record) | RecordOutcome::Existing(record) => record,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, RecordOutcome::Inserted(_))
    }
}

/// Append-mostly log of verified purchases; the idempotency source for
/// subscribe.
pub struct PaymentLedger<S> {
    store: Arc<S>,
}

impl<S> Clone for PaymentLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LedgerStore> PaymentLedger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn find(
        &self,
        transaction_id: &str,
        plan_id: &PlanId,
    ) -> LedgerResult<Option<PaymentRecord>> {
        Ok(self.store.find_payment_record(transaction_id, plan_id).await?)
    }

    /// Record of `plan` bought with this receipt. Google renewals mint new
    /// order ids under the same purchase token, so a token replay only
    /// matches here.
    pub async fn find_by_receipt(
        &self,
        platform: Platform,
        receipt_data: &str,
        plan_id: &PlanId,
    ) -> LedgerResult<Option<PaymentRecord>> {
        Ok(self
            .store
            .list_payment_records(Some(platform))
            .await?
            .into_iter()
            .find(|record| record.receipt_data == receipt_data && &record.plan_id == plan_id))
    }

    /// Inserts the record unless its `(transaction_id, plan_id)` is already
    /// known, in which case the stored record is returned untouched.
    pub async fn record(&self, record: PaymentRecord) -> LedgerResult<RecordOutcome> {
        match self.store.insert_payment_record(&record).await {
            Ok(()) => {
                info!(
                    user_id = %record.user_id,
                    platform = %record.platform,
                    transaction_id = %record.transaction_id,
                    plan_id = %record.plan_id,
                    "payment recorded"
                );
                Ok(RecordOutcome::Inserted(record))
            }
            Err(StoreError::Duplicate { .. }) => {
                let existing = self
                    .store
                    .find_payment_record(&record.transaction_id, &record.plan_id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound {
                        collection: "payment_records",
                        id: record.transaction_id.clone(),
                    })?;
                debug!(
                    transaction_id = %record.transaction_id,
                    "payment already recorded"
                );
                Ok(RecordOutcome::Existing(existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, record: &PaymentRecord) -> LedgerResult<()> {
        Ok(self.store.save_payment_record(record).await?)
    }

    /// The newest record of every user who bought through `platform`.
    pub async fn latest_per_user(&self, platform: Platform) -> LedgerResult<Vec<PaymentRecord>> {
        let mut latest: HashMap<String, PaymentRecord> = HashMap::new();
        for record in self.store.list_payment_records(Some(platform)).await? {
            match latest.get(&record.user_id) {
                Some(current) if current.created_at >= record.created_at => {}
                _ => {
                    latest.insert(record.user_id.clone(), record);
                }
            }
        }
        let mut records: Vec<_> = latest.into_values().collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(records)
    }

    /// Whether the user holds another purchase on `platform` that is live and
    /// runs past `now`.
    pub async fn has_other_live_record(
        &self,
        user_id: &str,
        platform: Platform,
        except: PaymentRecordId,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        Ok(self
            .store
            .payment_records_for_user(user_id)
            .await?
            .iter()
            .any(|record| {
                record.platform == platform
                    && record.id != except
                    && record.is_live()
                    && record.expiry_date.is_some_and(|expiry| expiry > now)
            }))
    }

    /// Removes records whose user no longer exists.
    pub async fn cleanup_orphans(&self, user_ids: &HashSet<String>) -> LedgerResult<usize> {
        let orphans: Vec<_> = self
            .store
            .list_payment_records(None)
            .await?
            .into_iter()
            .filter(|record| !user_ids.contains(&record.user_id))
            .map(|record| record.id)
            .collect();
        if orphans.is_empty() {
            return Ok(0);
        }
        let deleted = self.store.delete_payment_records(&orphans).await?;
        info!(deleted, "orphaned payment records removed");
        Ok(deleted)
    }

    /// Collapses records describing the same purchase of the same plan (same
    /// transaction id, original transaction id or receipt), keeping the
    /// newest. Records for different plans are separate idempotency keys and
    /// are never merged.
    pub async fn cleanup_duplicates(&self) -> LedgerResult<usize> {
        let mut groups: HashMap<(String, String, PlanId), Vec<PaymentRecord>> = HashMap::new();
        for record in self.store.list_payment_records(None).await? {
            let key = (
                record.user_id.clone(),
                record.dedupe_key().to_owned(),
                record.plan_id.clone(),
            );
            groups.entry(key).or_default().push(record);
        }

        let mut stale = Vec::new();
        for (_, mut records) in groups {
            if records.len() < 2 {
                continue;
            }
            records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            stale.extend(records.into_iter().skip(1).map(|record| record.id));
        }
        if stale.is_empty() {
            return Ok(0);
        }
        let deleted = self.store.delete_payment_records(&stale).await?;
        info!(deleted, "duplicate payment records removed");
        Ok(deleted)
    }
}

/// Builds the record for a purchase the storefront just confirmed.
pub fn new_payment_record(
    user_id: &str,
    plan: &Plan,
    request: &VerificationRequest,
    verification: &VerificationResult,
    now: DateTime<Utc>,
) -> PaymentRecord {
    let method = request.payment_method();
    let transaction_id = verification
        .transaction_id
        .clone()
        .or_else(|| request.claimed_transaction_id().map(str::to_owned))
        .unwrap_or_else(|| request.receipt_data().to_owned());
    let original_transaction_id = verification.original_transaction_id.clone().or_else(|| {
        match request {
            VerificationRequest::Apple {
                original_transaction_id,
                ..
            } => original_transaction_id.clone(),
            _ => None,
        }
    });
    PaymentRecord {
        id: PaymentRecordId::generate(),
        user_id: user_id.to_owned(),
        plan_id: plan.id.clone(),
        payment_method: method,
        platform: method.platform(),
        transaction_id,
        original_transaction_id,
        receipt_data: request.receipt_data().to_owned(),
        product_id: verification
            .product_id
            .clone()
            .or_else(|| request.product_id().map(str::to_owned)),
        status: PaymentStatus::Completed,
        amount: plan.price,
        plan_snapshot: plan.snapshot(),
        expiry_date: verification.expires_date,
        cancelled_at: None,
        cancellation_type: None,
        last_checked: Some(now),
        created_at: now,
        updated_at: now,
    }
}
