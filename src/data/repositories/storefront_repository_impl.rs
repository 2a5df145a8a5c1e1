use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    constants::{APP_STORE_PRICE_TERRITORY, GOOGLE_PLAY_PRICE_REGION},
    data::{
        datasources::{
            app_store_connect_api_datasource::{
                AppStoreConnectApiDatasource, AppStoreConnectApiDatasourceImpl,
            },
            app_store_receipt_datasource::{
                AppStoreReceiptDatasource, AppStoreReceiptDatasourceImpl,
            },
            app_store_server_api_datasource::{
                AppStoreServerApiDatasource, AppStoreServerApiDatasourceImpl,
            },
            google_play_developer_api_datasource::{
                GooglePlayDeveloperApiDatasource, GooglePlayDeveloperApiDatasourceImpl,
            },
            stripe_api_datasource::{StripeApiDatasource, StripeApiDatasourceImpl},
            utils::{decode_jws_payload, with_retry, RetryPolicy},
        },
        models::{
            app_store_receipt_api::verify_receipt_response_model::VerifyReceiptResponseModel,
            app_store_server_api::{
                jws_renewal_info_decoded_payload_model::{
                    AutoRenewStatus, ExpirationIntent, JwsRenewalInfoDecodedPayloadModel,
                },
                jws_transaction_decoded_payload_model::JwsTransactionDecodedPayloadModel,
                status_response_model::{AutoRenewableSubscriptionStatus, StatusResponseModel},
            },
            google_play_developer_api::subscription_purchase_v2_model::{
                AcknowledgementState, SubscriptionPurchaseV2Model, SubscriptionState,
            },
        },
    },
    domain::{
        entities::{
            payment_record::Platform,
            plan::StorefrontProduct,
            storefront_status::{StorefrontLookup, StorefrontSubscription},
            verification::{VerificationRequest, VerificationResult},
        },
        repositories::storefront_repository::StorefrontRepository,
    },
    errors::{ReversalStatus, StorefrontError},
};

/// Signed StoreKit 2 transactions are compact JWS strings; their base64url
/// header always starts like this.
const JWS_PREFIX: &str = "eyJ";

pub(crate) struct StorefrontRepositoryImpl<
    A: AppStoreServerApiDatasource,
    B: AppStoreConnectApiDatasource,
    C: AppStoreReceiptDatasource,
    D: GooglePlayDeveloperApiDatasource,
    E: StripeApiDatasource,
> {
    app_store_server_api_datasource: A,
    app_store_connect_api_datasource: B,
    app_store_receipt_datasource: C,
    google_play_developer_api_datasource: D,
    stripe_api_datasource: E,
    apple_app_id: String,
    retry_policy: RetryPolicy,
}

#[async_trait]
impl<
        A: AppStoreServerApiDatasource,
        B: AppStoreConnectApiDatasource,
        C: AppStoreReceiptDatasource,
        D: GooglePlayDeveloperApiDatasource,
        E: StripeApiDatasource,
    > StorefrontRepository for StorefrontRepositoryImpl<A, B, C, D, E>
{
    async fn verify_purchase(
        &self,
        request: &VerificationRequest,
        now: DateTime<Utc>,
    ) -> Result<VerificationResult, StorefrontError> {
        match request {
            VerificationRequest::Stripe { payment_intent_id } => {
                self.verify_stripe_payment(payment_intent_id).await
            }
            VerificationRequest::GooglePlay {
                purchase_token,
                product_id,
                order_id,
            } => {
                self.verify_google_purchase(purchase_token, product_id, order_id.as_deref())
                    .await
            }
            VerificationRequest::Apple {
                receipt_data,
                product_id,
                ..
            } => {
                if receipt_data.starts_with(JWS_PREFIX) {
                    verify_apple_signed_transaction(receipt_data, product_id, now)
                } else {
                    self.verify_apple_receipt(receipt_data, product_id, now).await
                }
            }
        }
    }

    async fn google_subscription_status(
        &self,
        purchase_token: &str,
    ) -> Result<StorefrontLookup, StorefrontError> {
        match self
            .google_play_developer_api_datasource
            .get_subscription_purchase_v2(purchase_token)
            .await
        {
            Ok(purchase) => Ok(StorefrontLookup::Found(google_subscription(&purchase))),
            Err(e) => match e.status_code() {
                Some(410) => Ok(StorefrontLookup::ExpiredTooLong),
                Some(404) | Some(400) => Ok(StorefrontLookup::NotFound),
                _ => Err(e),
            },
        }
    }

    async fn apple_subscription_status(
        &self,
        original_transaction_id: &str,
    ) -> Result<StorefrontLookup, StorefrontError> {
        match self
            .app_store_server_api_datasource
            .get_all_subscription_statuses(original_transaction_id)
            .await
        {
            Ok(statuses) => apple_subscription(&statuses, original_transaction_id),
            Err(e) if e.status_code() == Some(404) => Ok(StorefrontLookup::NotFound),
            Err(e) => Err(e),
        }
    }

    async fn list_products(
        &self,
        platform: Platform,
    ) -> Result<Vec<StorefrontProduct>, StorefrontError> {
        match platform {
            Platform::Android => self.list_google_products().await,
            Platform::Ios => self.list_apple_products().await,
            Platform::Stripe => Ok(Vec::new()),
        }
    }

    async fn reverse_payment(&self, request: &VerificationRequest) -> ReversalStatus {
        let outcome = match request {
            VerificationRequest::Stripe { payment_intent_id } => self
                .stripe_api_datasource
                .refund_payment_intent(payment_intent_id)
                .await
                .map(|refund_id| ReversalStatus::Reversed {
                    reference: refund_id,
                }),
            VerificationRequest::GooglePlay {
                purchase_token,
                product_id,
                ..
            } => self
                .google_play_developer_api_datasource
                .revoke_subscription(product_id, purchase_token)
                .await
                .map(|()| ReversalStatus::Reversed {
                    reference: purchase_token.clone(),
                }),
            // The App Store has no server-side refund.
            VerificationRequest::Apple { .. } => Ok(ReversalStatus::ManualReviewRequired),
        };
        match outcome {
            Ok(status) => {
                info!(
                    payment_method = ?request.payment_method(),
                    status = ?status,
                    "payment reversal attempted"
                );
                status
            }
            Err(e) => {
                warn!(payment_method = ?request.payment_method(), error = %e, "payment reversal failed");
                ReversalStatus::Failed {
                    message: e.to_string(),
                }
            }
        }
    }

    async fn create_payment_intent(
        &self,
        amount_cents: i64,
        metadata: BTreeMap<String, String>,
    ) -> Result<String, StorefrontError> {
        let intent = self
            .stripe_api_datasource
            .create_payment_intent(amount_cents, metadata)
            .await?;
        intent.client_secret.ok_or_else(|| {
            StorefrontError::invalid_response(
                crate::errors::StorefrontApi::StripeApi,
                "CreatePaymentIntent",
                "PaymentIntent was created without a client secret",
            )
        })
    }
}

impl<
        A: AppStoreServerApiDatasource,
        B: AppStoreConnectApiDatasource,
        C: AppStoreReceiptDatasource,
        D: GooglePlayDeveloperApiDatasource,
        E: StripeApiDatasource,
    > StorefrontRepositoryImpl<A, B, C, D, E>
{
    pub(crate) fn from_datasources(
        app_store_server_api_datasource: A,
        app_store_connect_api_datasource: B,
        app_store_receipt_datasource: C,
        google_play_developer_api_datasource: D,
        stripe_api_datasource: E,
        apple_app_id: String,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            app_store_server_api_datasource,
            app_store_connect_api_datasource,
            app_store_receipt_datasource,
            google_play_developer_api_datasource,
            stripe_api_datasource,
            apple_app_id,
            retry_policy,
        }
    }

    async fn verify_stripe_payment(
        &self,
        payment_intent_id: &str,
    ) -> Result<VerificationResult, StorefrontError> {
        let intent = self
            .stripe_api_datasource
            .retrieve_payment_intent(payment_intent_id)
            .await?;
        if intent.succeeded {
            Ok(VerificationResult {
                amount_cents: Some(intent.amount),
                plan_id: intent.metadata.get("planId").cloned(),
                ..VerificationResult::verified(intent.id)
            })
        } else {
            warn!(payment_intent_id, status = %intent.status, "payment not verified");
            Ok(VerificationResult::failed(format!(
                "payment intent status is {}",
                intent.status
            )))
        }
    }

    async fn verify_google_purchase(
        &self,
        purchase_token: &str,
        product_id: &str,
        order_id: Option<&str>,
    ) -> Result<VerificationResult, StorefrontError> {
        let purchase = self
            .google_play_developer_api_datasource
            .get_subscription_purchase_v2(purchase_token)
            .await?;

        // v2 has no payment state; ACTIVE implies paid.
        let is_active = purchase.subscription_state == SubscriptionState::SubscriptionStateActive;
        if purchase.test_purchase.is_some() {
            debug!(product_id, "license tester purchase");
        }
        if !is_active {
            warn!(
                product_id,
                state = ?purchase.subscription_state,
                "purchase not verified"
            );
            return Ok(VerificationResult::failed(format!(
                "subscription state is {:?}",
                purchase.subscription_state
            )));
        }

        if purchase.acknowledgement_state == AcknowledgementState::AcknowledgementStatePending {
            self.google_play_developer_api_datasource
                .acknowledge_subscription(product_id, purchase_token)
                .await?;
            debug!(product_id, "purchase acknowledged");
        }

        let transaction_id = purchase
            .latest_order_id
            .as_deref()
            .or(order_id)
            .unwrap_or(purchase_token);
        Ok(VerificationResult {
            product_id: purchase
                .product_id()
                .map(str::to_owned)
                .or_else(|| Some(product_id.to_owned())),
            expires_date: purchase.expiry_time(),
            ..VerificationResult::verified(transaction_id)
        })
    }

    async fn verify_apple_receipt(
        &self,
        receipt_data: &str,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> Result<VerificationResult, StorefrontError> {
        let response = self
            .app_store_receipt_datasource
            .verify_receipt(receipt_data)
            .await?;
        if response.status != VerifyReceiptResponseModel::STATUS_VALID {
            warn!(status = response.status, "receipt validation failed");
            return Ok(VerificationResult::failed(format!(
                "receipt status {}",
                response.status
            )));
        }

        let active = response.latest_receipt_info.iter().find(|transaction| {
            transaction.product_id == product_id
                && !transaction.is_revoked()
                && transaction.expires_date().is_some_and(|expiry| expiry > now)
        });
        Ok(match active {
            Some(transaction) => VerificationResult {
                original_transaction_id: transaction.original_transaction_id.clone(),
                product_id: Some(transaction.product_id.clone()),
                expires_date: transaction.expires_date(),
                ..VerificationResult::verified(&transaction.transaction_id)
            },
            None => VerificationResult::failed("no active transaction for product in receipt"),
        })
    }

    async fn list_google_products(&self) -> Result<Vec<StorefrontProduct>, StorefrontError> {
        let mut products = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = with_retry(
                &self.retry_policy,
                "monetization.subscriptions.list",
                StorefrontError::is_transient,
                || {
                    self.google_play_developer_api_datasource
                        .list_subscriptions(page_token.as_deref())
                },
            )
            .await?;

            for subscription in page.subscriptions {
                if !subscription.is_offered() {
                    debug!(product_id = %subscription.product_id, "skipping product not on offer");
                    continue;
                }
                let listing = subscription.primary_listing();
                let price = subscription.price_in(GOOGLE_PLAY_PRICE_REGION);
                products.push(StorefrontProduct {
                    platform: Platform::Android,
                    product_id: subscription.product_id.clone(),
                    name: listing.and_then(|l| l.title.clone()),
                    description: listing.and_then(|l| l.description.clone()),
                    price: price.map_or(0.0, |money| money.as_f64()),
                    currency: price.map_or_else(|| "USD".to_owned(), |money| money.currency_code.clone()),
                    features: listing.map(|l| l.benefits.clone()).unwrap_or_default(),
                });
            }

            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(products)
    }

    async fn list_apple_products(&self) -> Result<Vec<StorefrontProduct>, StorefrontError> {
        let connect = &self.app_store_connect_api_datasource;
        let policy = &self.retry_policy;
        let retryable = StorefrontError::is_transient;

        let groups = with_retry(policy, "ListSubscriptionGroups", retryable, || {
            connect.list_subscription_groups(&self.apple_app_id)
        })
        .await?;

        let mut products = Vec::new();
        for group in groups {
            let subscriptions = with_retry(policy, "ListSubscriptions", retryable, || {
                connect.list_subscriptions(&group.id)
            })
            .await?;

            for subscription in subscriptions {
                let Some(attributes) = subscription.attributes else {
                    continue;
                };
                if !attributes.state.as_ref().map_or(true, |state| state.is_offered()) {
                    debug!(product_id = %attributes.product_id, "skipping product not on offer");
                    continue;
                }

                let localizations =
                    with_retry(policy, "ListSubscriptionLocalizations", retryable, || {
                        connect.list_subscription_localizations(&subscription.id)
                    })
                    .await?;
                let localization = localizations
                    .iter()
                    .filter_map(|l| l.attributes.as_ref())
                    .find(|l| l.locale.as_deref().is_some_and(|locale| locale.starts_with("en")))
                    .or_else(|| localizations.iter().find_map(|l| l.attributes.as_ref()));

                let price = with_retry(policy, "ListSubscriptionPrices", retryable, || {
                    connect.get_subscription_price(&subscription.id, APP_STORE_PRICE_TERRITORY)
                })
                .await?;
                if price.is_none() {
                    warn!(product_id = %attributes.product_id, "no price point found; using 0");
                }

                products.push(StorefrontProduct {
                    platform: Platform::Ios,
                    product_id: attributes.product_id.clone(),
                    name: localization
                        .and_then(|l| l.name.clone())
                        .or_else(|| attributes.name.clone()),
                    description: localization.and_then(|l| l.description.clone()),
                    price: price.unwrap_or(0.0),
                    currency: "USD".to_owned(),
                    features: Vec::new(),
                });
            }
        }
        Ok(products)
    }
}

impl
    StorefrontRepositoryImpl<
        AppStoreServerApiDatasourceImpl,
        AppStoreConnectApiDatasourceImpl,
        AppStoreReceiptDatasourceImpl,
        GooglePlayDeveloperApiDatasourceImpl,
        StripeApiDatasourceImpl,
    >
{
    pub(crate) fn new(
        app_store_server_api_datasource: AppStoreServerApiDatasourceImpl,
        app_store_connect_api_datasource: AppStoreConnectApiDatasourceImpl,
        app_store_receipt_datasource: AppStoreReceiptDatasourceImpl,
        google_play_developer_api_datasource: GooglePlayDeveloperApiDatasourceImpl,
        stripe_api_datasource: StripeApiDatasourceImpl,
        apple_app_id: String,
    ) -> Self {
        Self::from_datasources(
            app_store_server_api_datasource,
            app_store_connect_api_datasource,
            app_store_receipt_datasource,
            google_play_developer_api_datasource,
            stripe_api_datasource,
            apple_app_id,
            RetryPolicy::default(),
        )
    }
}

/// Signed transactions come straight from StoreKit on the device and are
/// trusted without checking the signature chain.
fn verify_apple_signed_transaction(
    jws: &str,
    product_id: &str,
    now: DateTime<Utc>,
) -> Result<VerificationResult, StorefrontError> {
    let transaction: JwsTransactionDecodedPayloadModel = decode_jws_payload(jws)?;
    let is_active = transaction.revocation_date.is_none()
        && transaction.expires_date.map_or(true, |expiry| expiry > now);
    if transaction.product_id != product_id || !is_active {
        warn!(
            product_id,
            transaction_product_id = %transaction.product_id,
            revoked = transaction.revocation_date.is_some(),
            "signed transaction not verified"
        );
        return Ok(VerificationResult::failed(
            "signed transaction is not an active purchase of the product",
        ));
    }
    Ok(VerificationResult {
        original_transaction_id: Some(transaction.original_transaction_id.clone()),
        product_id: Some(transaction.product_id.clone()),
        expires_date: transaction.expires_date,
        ..VerificationResult::verified(&transaction.transaction_id)
    })
}

fn google_subscription(purchase: &SubscriptionPurchaseV2Model) -> StorefrontSubscription {
    let context = purchase.canceled_state_context.as_ref();
    let cancel_reason = context.and_then(|c| {
        if c.system_initiated_cancellation.is_some() {
            Some("system_initiated")
        } else if c.developer_initiated_cancellation.is_some() {
            Some("developer_initiated")
        } else if c.replacement_cancellation.is_some() {
            Some("replaced")
        } else {
            None
        }
    });
    StorefrontSubscription {
        product_id: purchase.product_id().map(str::to_owned),
        expiry_time: purchase.expiry_time(),
        auto_renewing: purchase.auto_renew_enabled(),
        user_cancellation_time: context
            .and_then(|c| c.user_initiated_cancellation.as_ref())
            .and_then(|u| u.cancel_time),
        refunded: false,
        revoked: false,
        cancel_reason: cancel_reason.map(str::to_owned),
    }
}

fn apple_subscription(
    statuses: &StatusResponseModel,
    original_transaction_id: &str,
) -> Result<StorefrontLookup, StorefrontError> {
    let items: Vec<_> = statuses
        .data
        .iter()
        .flat_map(|group| group.last_transactions.iter())
        .collect();
    let Some(item) = items
        .iter()
        .find(|item| item.original_transaction_id == original_transaction_id)
        .or_else(|| items.first())
    else {
        return Ok(StorefrontLookup::NotFound);
    };

    let transaction: JwsTransactionDecodedPayloadModel =
        decode_jws_payload(&item.signed_transaction_info)?;
    let renewal: Option<JwsRenewalInfoDecodedPayloadModel> = item
        .signed_renewal_info
        .as_deref()
        .map(decode_jws_payload)
        .transpose()?;

    let auto_renewing = renewal
        .as_ref()
        .is_some_and(|r| r.auto_renew_status == AutoRenewStatus::On);
    // Renewal info is re-signed when the customer turns renewal off.
    let user_cancellation_time = renewal
        .as_ref()
        .filter(|r| {
            r.auto_renew_status == AutoRenewStatus::Off
                && r.expiration_intent
                    .map_or(true, |intent| intent == ExpirationIntent::VoluntaryCancellation)
        })
        .map(|r| r.signed_date);
    let refunded = transaction.revocation_reason.is_some();
    let revoked = !refunded
        && (transaction.revocation_date.is_some()
            || item.status == AutoRenewableSubscriptionStatus::Revoked);
    let cancel_reason = match item.status {
        AutoRenewableSubscriptionStatus::BillingRetry => Some("billing_retry".to_owned()),
        _ => renewal
            .as_ref()
            .and_then(|r| r.expiration_intent)
            .filter(|intent| *intent != ExpirationIntent::VoluntaryCancellation)
            .map(|intent| format!("{intent:?}")),
    };

    Ok(StorefrontLookup::Found(StorefrontSubscription {
        product_id: Some(transaction.product_id),
        expiry_time: transaction.expires_date,
        auto_renewing,
        user_cancellation_time,
        refunded,
        revoked,
        cancel_reason,
    }))
}
