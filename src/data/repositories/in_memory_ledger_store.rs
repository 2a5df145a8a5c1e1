use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    domain::{
        entities::{
            payment_record::{PaymentRecord, PaymentRecordId, Platform},
            plan::{Plan, PlanId, PlanType},
            user_account::UserAccount,
            user_subscription::{SubscriptionId, UserSubscription},
        },
        repositories::{ledger_store::LedgerStore, notification_repository::DeviceTokenLookup},
    },
    errors::StoreError,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Collections {
    plans: BTreeMap<PlanId, Plan>,
    users: BTreeMap<String, UserAccount>,
    subscriptions: BTreeMap<SubscriptionId, UserSubscription>,
    payment_records: BTreeMap<PaymentRecordId, PaymentRecord>,
}

/// Process-local document store. Optionally persists a JSON snapshot so the
/// scheduler survives restarts.
pub struct InMemoryLedgerStore {
    collections: RwLock<Collections>,
    snapshot_path: Option<PathBuf>,
    read_only: AtomicBool,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(Collections::default()),
            snapshot_path: None,
            read_only: AtomicBool::new(false),
        }
    }

    /// Loads the snapshot at `path` if one exists; later flushes write back
    /// to it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let collections = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let collections: Collections = serde_json::from_slice(&bytes)?;
                info!(
                    path = %path.display(),
                    plans = collections.plans.len(),
                    users = collections.users.len(),
                    subscriptions = collections.subscriptions.len(),
                    payment_records = collections.payment_records.len(),
                    "loaded ledger snapshot"
                );
                collections
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Collections::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            collections: RwLock::new(collections),
            snapshot_path: Some(path),
            read_only: AtomicBool::new(false),
        })
    }

    /// Rejects writes while set, e.g. during maintenance.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Writes the snapshot, if a path is configured.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = {
            let collections = self.collections.read().await;
            serde_json::to_vec_pretty(&*collections)?
        };
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "flushed ledger snapshot");
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is read-only".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get_plan(&self, id: &PlanId) -> Result<Option<Plan>, StoreError> {
        Ok(self.collections.read().await.plans.get(id).cloned())
    }

    async fn find_plan_by_type(&self, plan_type: PlanType) -> Result<Option<Plan>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .plans
            .values()
            .filter(|plan| plan.plan_type == plan_type && plan.is_active)
            .min_by_key(|plan| plan.created_at)
            .cloned())
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError> {
        Ok(self.collections.read().await.plans.values().cloned().collect())
    }

    async fn save_plans(&self, plans: Vec<Plan>) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let mut collections = self.collections.write().await;
        for plan in plans {
            collections.plans.insert(plan.id.clone(), plan);
        }
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserAccount>, StoreError> {
        Ok(self.collections.read().await.users.get(id).cloned())
    }

    async fn save_user(&self, user: &UserAccount) -> Result<(), StoreError> {
        self.ensure_writable()?;
        self.collections
            .write()
            .await
            .users
            .insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<UserAccount>, StoreError> {
        Ok(self.collections.read().await.users.values().cloned().collect())
    }

    async fn get_subscription(
        &self,
        id: &SubscriptionId,
    ) -> Result<Option<UserSubscription>, StoreError> {
        Ok(self.collections.read().await.subscriptions.get(id).cloned())
    }

    async fn save_subscription(&self, subscription: &UserSubscription) -> Result<(), StoreError> {
        self.ensure_writable()?;
        self.collections
            .write()
            .await
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn subscriptions_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<UserSubscription>, StoreError> {
        let collections = self.collections.read().await;
        let mut subscriptions: Vec<_> = collections
            .subscriptions
            .values()
            .filter(|subscription| subscription.user_id == user_id)
            .cloned()
            .collect();
        subscriptions.sort_by(|a, b| {
            b.start_date
                .cmp(&a.start_date)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(subscriptions)
    }

    async fn list_subscriptions(&self) -> Result<Vec<UserSubscription>, StoreError> {
        Ok(self
            .collections
            .read()
            .await
            .subscriptions
            .values()
            .cloned()
            .collect())
    }

    async fn delete_subscriptions(&self, ids: &[SubscriptionId]) -> Result<usize, StoreError> {
        self.ensure_writable()?;
        let mut collections = self.collections.write().await;
        Ok(ids
            .iter()
            .filter(|id| collections.subscriptions.remove(*id).is_some())
            .count())
    }

    async fn insert_payment_record(&self, record: &PaymentRecord) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let mut collections = self.collections.write().await;
        let duplicate = collections.payment_records.values().any(|existing| {
            existing.transaction_id == record.transaction_id && existing.plan_id == record.plan_id
        });
        if duplicate {
            return Err(StoreError::Duplicate {
                collection: "payment_records",
                key: format!("{}/{}", record.transaction_id, record.plan_id),
            });
        }
        collections.payment_records.insert(record.id, record.clone());
        Ok(())
    }

    async fn save_payment_record(&self, record: &PaymentRecord) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let mut collections = self.collections.write().await;
        match collections.payment_records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                collection: "payment_records",
                id: record.id.to_string(),
            }),
        }
    }

    async fn find_payment_record(
        &self,
        transaction_id: &str,
        plan_id: &PlanId,
    ) -> Result<Option<PaymentRecord>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .payment_records
            .values()
            .find(|record| record.transaction_id == transaction_id && &record.plan_id == plan_id)
            .cloned())
    }

    async fn payment_records_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<PaymentRecord>, StoreError> {
        let collections = self.collections.read().await;
        let mut records: Vec<_> = collections
            .payment_records
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn list_payment_records(
        &self,
        platform: Option<Platform>,
    ) -> Result<Vec<PaymentRecord>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .payment_records
            .values()
            .filter(|record| platform.map_or(true, |platform| record.platform == platform))
            .cloned()
            .collect())
    }

    async fn delete_payment_records(&self, ids: &[PaymentRecordId]) -> Result<usize, StoreError> {
        self.ensure_writable()?;
        let mut collections = self.collections.write().await;
        Ok(ids
            .iter()
            .filter(|id| collections.payment_records.remove(*id).is_some())
            .count())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.flush().await
    }
}

#[async_trait]
impl DeviceTokenLookup for InMemoryLedgerStore {
    async fn get_device_tokens(&self, user_id: &str) -> Vec<String> {
        self.collections
            .read()
            .await
            .users
            .get(user_id)
            .map(|user| user.device_tokens.clone())
            .unwrap_or_default()
    }
}
