use async_trait::async_trait;
use tracing::debug;

use crate::{
    constants::{APP_STORE_RECEIPT_PRODUCTION_URL, APP_STORE_RECEIPT_SANDBOX_URL},
    data::models::app_store_receipt_api::verify_receipt_response_model::{
        VerifyReceiptRequestModel, VerifyReceiptResponseModel,
    },
    errors::{StorefrontApi, StorefrontError},
};

use super::utils::HTTP_CLIENT;

const API: StorefrontApi = StorefrontApi::AppStoreReceiptApi;

#[async_trait]
pub(crate) trait AppStoreReceiptDatasource: Send + Sync {
    /// verifyReceipt (deprecated, still used by older app builds):
    /// https://developer.apple.com/documentation/appstorereceipts/verifyreceipt
    ///
    /// A production request answered with 21007 is retried against the
    /// sandbox.
    async fn verify_receipt(
        &self,
        receipt_data: &str,
    ) -> Result<VerifyReceiptResponseModel, StorefrontError>;
}

pub(crate) struct AppStoreReceiptDatasourceImpl {
    production_url: String,
    sandbox_url: String,
    shared_secret: String,
    use_sandbox: bool,
}

#[async_trait]
impl AppStoreReceiptDatasource for AppStoreReceiptDatasourceImpl {
    async fn verify_receipt(
        &self,
        receipt_data: &str,
    ) -> Result<VerifyReceiptResponseModel, StorefrontError> {
        let first_url = if self.use_sandbox {
            &self.sandbox_url
        } else {
            &self.production_url
        };
        let response = self.callout(first_url, receipt_data).await?;
        if response.status == VerifyReceiptResponseModel::STATUS_SANDBOX_RECEIPT_IN_PRODUCTION
            && !self.use_sandbox
        {
            debug!("sandbox receipt sent to production; retrying against sandbox");
            return self.callout(&self.sandbox_url, receipt_data).await;
        }
        Ok(response)
    }
}

impl AppStoreReceiptDatasourceImpl {
    pub(crate) fn new(shared_secret: String, use_sandbox: bool) -> Self {
        Self::with_urls(
            APP_STORE_RECEIPT_PRODUCTION_URL.to_owned(),
            APP_STORE_RECEIPT_SANDBOX_URL.to_owned(),
            shared_secret,
            use_sandbox,
        )
    }

    pub(crate) fn with_urls(
        production_url: String,
        sandbox_url: String,
        shared_secret: String,
        use_sandbox: bool,
    ) -> Self {
        Self {
            production_url,
            sandbox_url,
            shared_secret,
            use_sandbox,
        }
    }

    async fn callout(
        &self,
        url: &str,
        receipt_data: &str,
    ) -> Result<VerifyReceiptResponseModel, StorefrontError> {
        let function_name = "verifyReceipt";
        let response = HTTP_CLIENT
            .post(url)
            .json(&VerifyReceiptRequestModel {
                receipt_data,
                password: &self.shared_secret,
                exclude_old_transactions: true,
            })
            .send()
            .await
            .map_err(|e| {
                StorefrontError::callout_with_debug(API, function_name, "callout failed to send", &e)
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(StorefrontError::status(
                API,
                function_name,
                status,
                response.text().await.unwrap_or_default(),
            ));
        }

        response.json().await.map_err(|e| {
            StorefrontError::invalid_response_with_debug(
                API,
                function_name,
                "failed to parse callout response",
                &e,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{body_partial_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    #[tokio::test]
    async fn retries_sandbox_receipts_against_sandbox() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/production"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": 21007 })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sandbox"))
            .and(body_partial_json(serde_json::json!({
                "receipt-data": "receipt",
                "password": "secret"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": 0,
                "environment": "Sandbox",
                "latest_receipt_info": [{
                    "product_id": "premium_monthly",
                    "transaction_id": "1000000000000001",
                    "original_transaction_id": "1000000000000000",
                    "expires_date_ms": "4102444800000"
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let datasource = AppStoreReceiptDatasourceImpl::with_urls(
            format!("{}/production", server.uri()),
            format!("{}/sandbox", server.uri()),
            "secret".to_owned(),
            false,
        );
        let response = datasource.verify_receipt("receipt").await.unwrap();
        assert_eq!(response.status, VerifyReceiptResponseModel::STATUS_VALID);
        let transaction = &response.latest_receipt_info[0];
        assert_eq!(transaction.product_id, "premium_monthly");
        assert!(transaction.expires_date().is_some());
        assert!(!transaction.is_revoked());
    }

    #[tokio::test]
    async fn uses_sandbox_directly_when_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sandbox"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": 21003 })))
            .expect(1)
            .mount(&server)
            .await;

        let datasource = AppStoreReceiptDatasourceImpl::with_urls(
            format!("{}/production", server.uri()),
            format!("{}/sandbox", server.uri()),
            "secret".to_owned(),
            true,
        );
        let response = datasource.verify_receipt("receipt").await.unwrap();
        assert_eq!(response.status, 21003);
        assert!(response.latest_receipt_info.is_empty());
    }
}
