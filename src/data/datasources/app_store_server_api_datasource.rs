use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;

use crate::{
    constants::{APP_STORE_SERVER_API_PRODUCTION_URL, APP_STORE_SERVER_API_SANDBOX_URL},
    data::models::app_store_server_api::status_response_model::StatusResponseModel,
    errors::{StorefrontApi, StorefrontError},
};

use super::{app_store_auth::AppleToken, utils::HTTP_CLIENT};

const API: StorefrontApi = StorefrontApi::AppStoreServerApi;

#[async_trait]
pub(crate) trait AppStoreServerApiDatasource: Send + Sync {
    /// Get All Subscription Statuses:
    /// https://developer.apple.com/documentation/appstoreserverapi/get_all_subscription_statuses
    ///
    /// transactionId:
    ///   The identifier of a transaction that belongs to the customer, and
    ///   which may be an original transaction identifier.
    async fn get_all_subscription_statuses(
        &self,
        transaction_id: &str,
    ) -> Result<StatusResponseModel, StorefrontError>;
}

pub(crate) struct AppStoreServerApiDatasourceImpl {
    production_url: String,
    sandbox_url: String,
    token: AppleToken,
}

#[async_trait]
impl AppStoreServerApiDatasource for AppStoreServerApiDatasourceImpl {
    async fn get_all_subscription_statuses(
        &self,
        transaction_id: &str,
    ) -> Result<StatusResponseModel, StorefrontError> {
        let production_url = format!(
            "{}/inApps/v1/subscriptions/{transaction_id}",
            self.production_url
        );
        let sandbox_url = format!("{}/inApps/v1/subscriptions/{transaction_id}", self.sandbox_url);
        self.callout_with_sandbox_fallback(&production_url, &sandbox_url, "GetAllSubscriptionStatuses")
            .await
    }
}

impl AppStoreServerApiDatasourceImpl {
    pub(crate) fn new(token: AppleToken) -> Self {
        Self::with_base_urls(
            APP_STORE_SERVER_API_PRODUCTION_URL.to_owned(),
            APP_STORE_SERVER_API_SANDBOX_URL.to_owned(),
            token,
        )
    }

    pub(crate) fn with_base_urls(production_url: String, sandbox_url: String, token: AppleToken) -> Self {
        Self {
            production_url: production_url.trim_end_matches('/').to_owned(),
            sandbox_url: sandbox_url.trim_end_matches('/').to_owned(),
            token,
        }
    }

    async fn callout_with_sandbox_fallback<T: DeserializeOwned>(
        &self,
        production_url: &str,
        sandbox_url: &str,
        function_name: &str,
    ) -> Result<T, StorefrontError> {
        // As per Apple's documentation, try production endpoint first. If it
        // fails, try checking the sandbox.
        //
        // If both fail, we will return the error from the production callout.
        // Credential errors are the same in both environments, so they are
        // returned as-is.
        match self.callout(production_url, function_name).await {
            Ok(production_response) => Ok(production_response),
            Err(production_error) if production_error.is_unauthorized() => Err(production_error),
            Err(production_error) => match self.callout(sandbox_url, function_name).await {
                Ok(sandbox_response) => Ok(sandbox_response),
                Err(_sandbox_error) => Err(production_error),
            },
        }
    }

    async fn callout<T: DeserializeOwned>(
        &self,
        url: &str,
        function_name: &str,
    ) -> Result<T, StorefrontError> {
        let response = HTTP_CLIENT
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token.bearer()?))
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
