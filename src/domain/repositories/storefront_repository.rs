use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::entities::{
        payment_record::Platform,
        plan::StorefrontProduct,
        storefront_status::StorefrontLookup,
        verification::{VerificationRequest, VerificationResult},
    },
    errors::{ReversalStatus, StorefrontError},
};

/// Stripe, Google Play and the App Store behind one seam.
#[async_trait]
pub trait StorefrontRepository: Send + Sync {
    /// Confirms a purchase with the platform that processed it. Acknowledges
    /// Google Play purchases that still need it.
    async fn verify_purchase(
        &self,
        request: &VerificationRequest,
        now: DateTime<Utc>,
    ) -> Result<VerificationResult, StorefrontError>;

    /// Current state of a Google Play subscription, by purchase token.
    async fn google_subscription_status(
        &self,
        purchase_token: &str,
    ) -> Result<StorefrontLookup, StorefrontError>;

    /// Current state of an App Store subscription, by original transaction
    /// id.
    async fn apple_subscription_status(
        &self,
        original_transaction_id: &str,
    ) -> Result<StorefrontLookup, StorefrontError>;

    /// Every subscription product the platform currently offers. Follows
    /// pagination to the end and retries transient failures.
    async fn list_products(
        &self,
        platform: Platform,
    ) -> Result<Vec<StorefrontProduct>, StorefrontError>;

    /// Refunds or revokes a verified purchase. Never fails; the outcome is in
    /// the returned status.
    async fn reverse_payment(&self, request: &VerificationRequest) -> ReversalStatus;

    /// Creates a Stripe PaymentIntent and returns its client secret.
    async fn create_payment_intent(
        &self,
        amount_cents: i64,
        metadata: BTreeMap<String, String>,
    ) -> Result<String, StorefrontError>;
}
