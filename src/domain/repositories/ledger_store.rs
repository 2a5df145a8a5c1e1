use async_trait::async_trait;

use crate::{
    domain::entities::{
        payment_record::{PaymentRecord, PaymentRecordId, Platform},
        plan::{Plan, PlanId, PlanType},
        user_account::UserAccount,
        user_subscription::{SubscriptionId, UserSubscription},
    },
    errors::StoreError,
};

/// Document store holding plans, payment records, subscriptions and users.
///
/// Single-document writes are atomic; nothing spans documents. Callers rely
/// on idempotent re-runs, not rollback, to converge after a partial failure.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Plans.

    async fn get_plan(&self, id: &PlanId) -> Result<Option<Plan>, StoreError>;

    /// Active plan of the given type, if any.
    async fn find_plan_by_type(&self, plan_type: PlanType) -> Result<Option<Plan>, StoreError>;

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError>;

    /// Writes all plans or none of them.
    async fn save_plans(&self, plans: Vec<Plan>) -> Result<(), StoreError>;

    // Users.

    async fn get_user(&self, id: &str) -> Result<Option<UserAccount>, StoreError>;

    async fn save_user(&self, user: &UserAccount) -> Result<(), StoreError>;

    async fn list_users(&self) -> Result<Vec<UserAccount>, StoreError>;

    // Subscriptions.

    async fn get_subscription(
        &self,
        id: &SubscriptionId,
    ) -> Result<Option<UserSubscription>, StoreError>;

    async fn save_subscription(&self, subscription: &UserSubscription) -> Result<(), StoreError>;

    /// All of a user's subscriptions, newest `start_date` first.
    async fn subscriptions_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<UserSubscription>, StoreError>;

    async fn list_subscriptions(&self) -> Result<Vec<UserSubscription>, StoreError>;

    async fn delete_subscriptions(&self, ids: &[SubscriptionId]) -> Result<usize, StoreError>;

    // Payment records.

    /// Fails with [`StoreError::Duplicate`] if a record with the same
    /// `(transaction_id, plan_id)` exists.
    async fn insert_payment_record(&self, record: &PaymentRecord) -> Result<(), StoreError>;

    async fn save_payment_record(&self, record: &PaymentRecord) -> Result<(), StoreError>;

    async fn find_payment_record(
        &self,
        transaction_id: &str,
        plan_id: &PlanId,
    ) -> Result<Option<PaymentRecord>, StoreError>;

    /// A user's records, newest `created_at` first.
    async fn payment_records_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<PaymentRecord>, StoreError>;

    async fn list_payment_records(
        &self,
        platform: Option<Platform>,
    ) -> Result<Vec<PaymentRecord>, StoreError>;

    async fn delete_payment_records(&self, ids: &[PaymentRecordId]) -> Result<usize, StoreError>;

    /// Flushes pending state and releases the store.
    async fn close(&self) -> Result<(), StoreError>;
}
