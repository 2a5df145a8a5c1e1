use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    clock::Clock,
    domain::{
        entities::{
            payment_record::Platform,
            plan::Plan,
            verification::{VerificationRequest, VerificationResult},
        },
        repositories::storefront_repository::StorefrontRepository,
    },
    errors::{LedgerError, LedgerResult, ReversalStatus},
};

/// Confirms client-claimed purchases with the platform that processed them.
pub struct PurchaseVerifier<R: ?Sized> {
    storefront: Arc<R>,
    clock: Arc<dyn Clock>,
}

impl<R: ?Sized> Clone for PurchaseVerifier<R> {
    fn clone(&self) -> Self {
        Self {
            storefront: Arc::clone(&self.storefront),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<R: StorefrontRepository + ?Sized> PurchaseVerifier<R> {
    pub fn new(storefront: Arc<R>, clock: Arc<dyn Clock>) -> Self {
        Self { storefront, clock }
    }

    /// Never fails: network and parse errors come back as an unsuccessful
    /// result so the caller decides what to do about them.
    pub async fn verify(&self, request: &VerificationRequest) -> VerificationResult {
        let method = request.payment_method();
        if request.receipt_data().trim().is_empty() {
            return VerificationResult::failed("missing purchase proof");
        }
        if request.product_id().is_some_and(|id| id.trim().is_empty()) {
            return VerificationResult::failed("missing product id");
        }

        match self
            .storefront
            .verify_purchase(request, self.clock.now())
            .await
        {
            Ok(result) => {
                if result.success {
                    info!(
                        payment_method = ?method,
                        transaction_id = result.transaction_id.as_deref().unwrap_or_default(),
                        "purchase verified"
                    );
                } else {
                    warn!(
                        payment_method = ?method,
                        reason = result.failure_reason.as_deref().unwrap_or_default(),
                        "purchase rejected by storefront"
                    );
                }
                result
            }
            Err(e) => {
                warn!(payment_method = ?method, error = %e, "purchase verification errored");
                VerificationResult::failed(e.to_string())
            }
        }
    }

    /// Verifies a purchase of `plan`, rejecting anything short of a confirmed
    /// purchase of that plan's product.
    pub async fn verify_for_plan(
        &self,
        request: &VerificationRequest,
        plan: &Plan,
    ) -> LedgerResult<VerificationResult> {
        let platform = request.payment_method().platform();
        if let (Some(expected), Some(claimed)) = (plan.product_id(platform), request.product_id()) {
            if expected != claimed {
                return Err(LedgerError::VerificationFailed(format!(
                    "product '{claimed}' does not belong to plan '{}'",
                    plan.name
                )));
            }
        }

        let result = self.verify(request).await;
        if !result.success {
            return Err(LedgerError::VerificationFailed(
                result
                    .failure_reason
                    .unwrap_or_else(|| "purchase could not be verified".to_owned()),
            ));
        }
        if platform == Platform::Stripe {
            check_stripe_purchase(&result, plan)?;
        }
        Ok(result)
    }

    /// Refunds or revokes a purchase that could not be recorded.
    pub async fn reverse(&self, request: &VerificationRequest) -> ReversalStatus {
        let status = self.storefront.reverse_payment(request).await;
        match &status {
            ReversalStatus::Reversed { reference } => {
                info!(reference = %reference, "payment reversed")
            }
            ReversalStatus::ManualReviewRequired => {
                warn!(payment_method = ?request.payment_method(), "payment needs manual refund")
            }
            ReversalStatus::Failed { message } => {
                warn!(error = %message, "payment reversal failed")
            }
        }
        status
    }
}

/// A PaymentIntent pays for exactly one plan at that plan's price.
fn check_stripe_purchase(result: &VerificationResult, plan: &Plan) -> LedgerResult<()> {
    let plan_id = plan.id.to_string();
    if result.plan_id.as_deref() != Some(plan_id.as_str()) {
        return Err(LedgerError::VerificationFailed(format!(
            "payment was not made for plan '{}'",
            plan.name
        )));
    }
    if result.amount_cents != Some(plan.price_cents()) {
        return Err(LedgerError::VerificationFailed(format!(
            "payment amount {:?} does not match the price of plan '{}'",
            result.amount_cents, plan.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::{
        clock::ManualClock,
        domain::entities::{
            plan::{PlanType, StorefrontProduct},
            storefront_status::StorefrontLookup,
        },
        errors::{StorefrontApi, StorefrontError},
    };

    struct Verdict(Option<bool>);

    #[async_trait]
    impl StorefrontRepository for Verdict {
        async fn verify_purchase(
            &self,
            request: &VerificationRequest,
            _now: DateTime<Utc>,
        ) -> Result<VerificationResult, StorefrontError> {
            match self.0 {
                Some(true) => Ok(VerificationResult::verified(request.receipt_data())),
                Some(false) => Ok(VerificationResult::failed("subscription is not active")),
                None => Err(StorefrontError::status(
                    StorefrontApi::GooglePlayDeveloperApi,
                    "purchases.subscriptionsv2.get",
                    500,
                    String::new(),
                )),
            }
        }

        async fn google_subscription_status(
            &self,
            _purchase_token: &str,
        ) -> Result<StorefrontLookup, StorefrontError> {
            unimplemented!()
        }

        async fn apple_subscription_status(
            &self,
            _original_transaction_id: &str,
        ) -> Result<StorefrontLookup, StorefrontError> {
            unimplemented!()
        }

        async fn list_products(
            &self,
            _platform: Platform,
        ) -> Result<Vec<StorefrontProduct>, StorefrontError> {
            unimplemented!()
        }

        async fn reverse_payment(&self, _request: &VerificationRequest) -> ReversalStatus {
            ReversalStatus::Failed {
                message: "refund rejected".to_owned(),
            }
        }

        async fn create_payment_intent(
            &self,
            _amount_cents: i64,
            _metadata: BTreeMap<String, String>,
        ) -> Result<String, StorefrontError> {
            unimplemented!()
        }
    }

    fn verifier(verdict: Option<bool>) -> PurchaseVerifier<Verdict> {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap());
        PurchaseVerifier::new(Arc::new(Verdict(verdict)), Arc::new(clock))
    }

    fn google(token: &str, product_id: &str) -> VerificationRequest {
        VerificationRequest::GooglePlay {
            purchase_token: token.to_owned(),
            product_id: product_id.to_owned(),
            order_id: None,
        }
    }

    fn plan() -> Plan {
        let mut plan = Plan::new(
            "Premium",
            PlanType::Premium,
            49.99,
            PlanType::Premium.default_allotment(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        plan.google_product_id = Some("premium_yearly".to_owned());
        plan
    }

    #[tokio::test]
    async fn storefront_errors_become_failed_results() {
        let result = verifier(None).verify(&google("tok", "premium_yearly")).await;
        assert!(!result.success);
        assert!(result.failure_reason.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn empty_proof_is_rejected_without_callout() {
        let result = verifier(None).verify(&google("  ", "premium_yearly")).await;
        assert_eq!(result.failure_reason.as_deref(), Some("missing purchase proof"));
    }

    #[tokio::test]
    async fn plan_product_must_match() {
        let err = verifier(Some(true))
            .verify_for_plan(&google("tok", "basic_weekly"), &plan())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::VerificationFailed(_)));

        let ok = verifier(Some(true))
            .verify_for_plan(&google("tok", "premium_yearly"), &plan())
            .await
            .unwrap();
        assert_eq!(ok.transaction_id.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn rejected_purchase_is_verification_failure() {
        let err = verifier(Some(false))
            .verify_for_plan(&google("tok", "premium_yearly"), &plan())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn stripe_payment_must_match_plan_and_price() {
        let plan = plan();
        let paid = VerificationResult {
            amount_cents: Some(4999),
            plan_id: Some(plan.id.to_string()),
            ..VerificationResult::verified("pi_1")
        };
        assert!(check_stripe_purchase(&paid, &plan).is_ok());

        let other_plan = VerificationResult {
            plan_id: Some("another".to_owned()),
            ..paid.clone()
        };
        assert!(check_stripe_purchase(&other_plan, &plan).is_err());

        let underpaid = VerificationResult {
            amount_cents: Some(99),
            ..paid.clone()
        };
        assert!(check_stripe_purchase(&underpaid, &plan).is_err());

        let untagged = VerificationResult {
            plan_id: None,
            ..paid
        };
        assert!(check_stripe_purchase(&untagged, &plan).is_err());
    }
}
