use std::collections::BTreeMap;

use async_trait::async_trait;
use stripe::{
    Client, CreatePaymentIntent, CreatePaymentIntentAutomaticPaymentMethods, CreateRefund,
    Currency, PaymentIntent, PaymentIntentId, PaymentIntentStatus, Refund, StripeError,
};

use crate::{
    data::models::stripe_api::payment_intent_model::PaymentIntentModel,
    errors::{StorefrontApi, StorefrontError},
};

const API: StorefrontApi = StorefrontApi::StripeApi;

#[async_trait]
pub(crate) trait StripeApiDatasource: Send + Sync {
    /// Retrieve a PaymentIntent:
    /// https://docs.stripe.com/api/payment_intents/retrieve
    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentIntentModel, StorefrontError>;

    /// Create a PaymentIntent in USD, with automatic payment methods enabled:
    /// https://docs.stripe.com/api/payment_intents/create
    async fn create_payment_intent(
        &self,
        amount_cents: i64,
        metadata: BTreeMap<String, String>,
    ) -> Result<PaymentIntentModel, StorefrontError>;

    /// Refund the full amount of a PaymentIntent, returning the refund id:
    /// https://docs.stripe.com/api/refunds/create
    async fn refund_payment_intent(&self, payment_intent_id: &str)
        -> Result<String, StorefrontError>;
}

pub(crate) struct StripeApiDatasourceImpl {
    client: Client,
}

#[async_trait]
impl StripeApiDatasource for StripeApiDatasourceImpl {
    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentIntentModel, StorefrontError> {
        let function_name = "RetrievePaymentIntent";
        let id = parse_payment_intent_id(payment_intent_id, function_name)?;
        let intent = PaymentIntent::retrieve(&self.client, &id, &[])
            .await
            .map_err(|e| map_stripe_error(e, function_name))?;
        Ok(to_model(intent))
    }

    async fn create_payment_intent(
        &self,
        amount_cents: i64,
        metadata: BTreeMap<String, String>,
    ) -> Result<PaymentIntentModel, StorefrontError> {
        let function_name = "CreatePaymentIntent";
        let mut params = CreatePaymentIntent::new(amount_cents, Currency::USD);
        params.metadata = Some(metadata.into_iter().collect());
        params.automatic_payment_methods = Some(CreatePaymentIntentAutomaticPaymentMethods {
            enabled: true,
            ..Default::default()
        });
        let intent = PaymentIntent::create(&self.client, params)
            .await
            .map_err(|e| map_stripe_error(e, function_name))?;
        Ok(to_model(intent))
    }

    async fn refund_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<String, StorefrontError> {
        let function_name = "CreateRefund";
        let id = parse_payment_intent_id(payment_intent_id, function_name)?;
        let refund = Refund::create(
            &self.client,
            CreateRefund {
                payment_intent: Some(id),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| map_stripe_error(e, function_name))?;
        Ok(refund.id.to_string())
    }
}

impl StripeApiDatasourceImpl {
    pub(crate) fn new(secret_key: &str) -> Self {
        Self {
            client: Client::new(secret_key),
        }
    }
}

fn parse_payment_intent_id(
    payment_intent_id: &str,
    function_name: &str,
) -> Result<PaymentIntentId, StorefrontError> {
    payment_intent_id.parse().map_err(|e| {
        StorefrontError::invalid_response_with_debug(
            API,
            function_name,
            "malformed PaymentIntent id",
            &e,
        )
    })
}

fn map_stripe_error(error: StripeError, function_name: &str) -> StorefrontError {
    match &error {
        StripeError::Stripe(request_error) => StorefrontError::status(
            API,
            function_name,
            request_error.http_status,
            format!("{error:?}"),
        ),
        _ => StorefrontError::callout_with_debug(API, function_name, "callout failed", &error),
    }
}

fn to_model(intent: PaymentIntent) -> PaymentIntentModel {
    PaymentIntentModel {
        id: intent.id.to_string(),
        amount: intent.amount,
        succeeded: intent.status == PaymentIntentStatus::Succeeded,
        status: intent.status.as_str().to_owned(),
        client_secret: intent.client_secret,
        metadata: intent.metadata.into_iter().collect(),
    }
}
