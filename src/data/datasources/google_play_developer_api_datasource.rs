use async_trait::async_trait;
use reqwest::{header::AUTHORIZATION, RequestBuilder};
use serde::de::DeserializeOwned;

use crate::{
    constants::GOOGLE_PLAY_API_BASE_URL,
    data::models::google_play_developer_api::{
        subscription_model::ListSubscriptionsResponseModel,
        subscription_purchase_v2_model::SubscriptionPurchaseV2Model,
    },
    errors::{StorefrontApi, StorefrontError},
};

use super::{google_auth::GoogleAccessToken, utils::HTTP_CLIENT};

const API: StorefrontApi = StorefrontApi::GooglePlayDeveloperApi;

#[async_trait]
pub(crate) trait GooglePlayDeveloperApiDatasource: Send + Sync {
    /// purchases.subscriptionsv2.get:
    /// https://developers.google.com/android-publisher/api-ref/rest/v3/purchases.subscriptionsv2/get
    ///
    /// token:
    ///   The token provided to the user's device when the subscription was
    ///   purchased.
    async fn get_subscription_purchase_v2(
        &self,
        token: &str,
    ) -> Result<SubscriptionPurchaseV2Model, StorefrontError>;

    /// purchases.subscriptions.acknowledge:
    /// https://developers.google.com/android-publisher/api-ref/rest/v3/purchases.subscriptions/acknowledge
    ///
    /// subscriptionId:
    ///   The purchased subscription ID (for example, 'monthly001').
    /// token:
    ///   The token provided to the user's device when the subscription was
    ///   purchased.
    async fn acknowledge_subscription(
        &self,
        subscription_id: &str,
        token: &str,
    ) -> Result<(), StorefrontError>;

    /// purchases.subscriptions.revoke:
    /// https://developers.google.com/android-publisher/api-ref/rest/v3/purchases.subscriptions/revoke
    ///
    /// Refunds and immediately revokes a user's subscription purchase.
    async fn revoke_subscription(
        &self,
        subscription_id: &str,
        token: &str,
    ) -> Result<(), StorefrontError>;

    /// monetization.subscriptions.list:
    /// https://developers.google.com/android-publisher/api-ref/rest/v3/monetization.subscriptions/list
    ///
    /// pageToken:
    ///   A page token, received from a previous ListSubscriptions call.
    async fn list_subscriptions(
        &self,
        page_token: Option<&str>,
    ) -> Result<ListSubscriptionsResponseModel, StorefrontError>;
}

pub(crate) struct GooglePlayDeveloperApiDatasourceImpl {
    base_url: String,
    package_name: String,
    access_token: GoogleAccessToken,
}

#[async_trait]
impl GooglePlayDeveloperApiDatasource for GooglePlayDeveloperApiDatasourceImpl {
    async fn get_subscription_purchase_v2(
        &self,
        token: &str,
    ) -> Result<SubscriptionPurchaseV2Model, StorefrontError> {
        let url = format!(
            "{}/applications/{}/purchases/subscriptionsv2/tokens/{token}",
            self.base_url, self.package_name
        );
        self.callout(HTTP_CLIENT.get(url), "purchases.subscriptionsv2.get")
            .await
    }

    async fn acknowledge_subscription(
        &self,
        subscription_id: &str,
        token: &str,
    ) -> Result<(), StorefrontError> {
        let url = format!(
            "{}/applications/{}/purchases/subscriptions/{subscription_id}/tokens/{token}:acknowledge",
            self.base_url, self.package_name
        );
        self.send(
            HTTP_CLIENT.post(url).json(&serde_json::json!({})),
            "purchases.subscriptions.acknowledge",
        )
        .await
        .map(|_| ())
    }

    async fn revoke_subscription(
        &self,
        subscription_id: &str,
        token: &str,
    ) -> Result<(), StorefrontError> {
        let url = format!(
            "{}/applications/{}/purchases/subscriptions/{subscription_id}/tokens/{token}:revoke",
            self.base_url, self.package_name
        );
        self.send(HTTP_CLIENT.post(url), "purchases.subscriptions.revoke")
            .await
            .map(|_| ())
    }

    async fn list_subscriptions(
        &self,
        page_token: Option<&str>,
    ) -> Result<ListSubscriptionsResponseModel, StorefrontError> {
        let url = format!(
            "{}/applications/{}/subscriptions",
            self.base_url, self.package_name
        );
        let mut request = HTTP_CLIENT.get(url);
        if let Some(page_token) = page_token {
            request = request.query(&[("pageToken", page_token)]);
        }
        self.callout(request, "monetization.subscriptions.list").await
    }
}

impl GooglePlayDeveloperApiDatasourceImpl {
    pub(crate) fn new(package_name: String, access_token: GoogleAccessToken) -> Self {
        Self::with_base_url(GOOGLE_PLAY_API_BASE_URL.to_owned(), package_name, access_token)
    }

    pub(crate) fn with_base_url(
        base_url: String,
        package_name: String,
        access_token: GoogleAccessToken,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            package_name,
            access_token,
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        function_name: &str,
    ) -> Result<reqwest::Response, StorefrontError> {
        let bearer = self.access_token.bearer().await?;
        let response = request
            .header(AUTHORIZATION, format!("Bearer {bearer}"))
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
        Ok(response)
    }

    async fn callout<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        function_name: &str,
    ) -> Result<T, StorefrontError> {
        self.send(request, function_name)
            .await?
            .json()
            .await
            .map_err(|e| {
                StorefrontError::invalid_response_with_debug(
                    API,
                    function_name,
                    "failed to parse callout response",
                    &e,
                )
            })
    }
}
