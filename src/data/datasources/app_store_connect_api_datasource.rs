use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;

use crate::{
    constants::APP_STORE_CONNECT_API_URL,
    data::models::app_store_connect_api::connect_response_model::{
        ConnectCollectionResponseModel, ConnectIncludedResourceModel, ConnectResourceModel,
        SubscriptionAttributes, SubscriptionGroupAttributes, SubscriptionLocalizationAttributes,
        SubscriptionPriceAttributes,
    },
    errors::{StorefrontApi, StorefrontError},
};

use super::{app_store_auth::AppleToken, utils::HTTP_CLIENT};

const API: StorefrontApi = StorefrontApi::AppStoreConnectApi;
const PAGE_LIMIT: u32 = 200;

#[async_trait]
pub(crate) trait AppStoreConnectApiDatasource: Send + Sync {
    /// List All Subscription Groups for an App:
    /// https://developer.apple.com/documentation/appstoreconnectapi/list_all_subscription_groups_for_an_app
    ///
    /// Follows `links.next` until every page has been read.
    async fn list_subscription_groups(
        &self,
        app_id: &str,
    ) -> Result<Vec<ConnectResourceModel<SubscriptionGroupAttributes>>, StorefrontError>;

    /// List All Subscriptions for a Subscription Group:
    /// https://developer.apple.com/documentation/appstoreconnectapi/list_all_subscriptions_for_a_subscription_group
    async fn list_subscriptions(
        &self,
        group_id: &str,
    ) -> Result<Vec<ConnectResourceModel<SubscriptionAttributes>>, StorefrontError>;

    /// List All Subscription Localizations for a Subscription:
    /// https://developer.apple.com/documentation/appstoreconnectapi/list_all_subscription_localizations_for_a_subscription
    async fn list_subscription_localizations(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<ConnectResourceModel<SubscriptionLocalizationAttributes>>, StorefrontError>;

    /// List All Prices for a Subscription, filtered to one territory, with the
    /// price point included:
    /// https://developer.apple.com/documentation/appstoreconnectapi/list_all_prices_for_a_subscription
    ///
    /// Returns the customer price of the first price point, if any.
    async fn get_subscription_price(
        &self,
        subscription_id: &str,
        territory: &str,
    ) -> Result<Option<f64>, StorefrontError>;
}

pub(crate) struct AppStoreConnectApiDatasourceImpl {
    base_url: String,
    token: AppleToken,
}

#[async_trait]
impl AppStoreConnectApiDatasource for AppStoreConnectApiDatasourceImpl {
    async fn list_subscription_groups(
        &self,
        app_id: &str,
    ) -> Result<Vec<ConnectResourceModel<SubscriptionGroupAttributes>>, StorefrontError> {
        let url = format!(
            "{}/v1/apps/{app_id}/subscriptionGroups?limit={PAGE_LIMIT}",
            self.base_url
        );
        Ok(self.get_all_pages(url, "ListSubscriptionGroups").await?.0)
    }

    async fn list_subscriptions(
        &self,
        group_id: &str,
    ) -> Result<Vec<ConnectResourceModel<SubscriptionAttributes>>, StorefrontError> {
        let url = format!(
            "{}/v1/subscriptionGroups/{group_id}/subscriptions?limit={PAGE_LIMIT}",
            self.base_url
        );
        Ok(self.get_all_pages(url, "ListSubscriptions").await?.0)
    }

    async fn list_subscription_localizations(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<ConnectResourceModel<SubscriptionLocalizationAttributes>>, StorefrontError>
    {
        let url = format!(
            "{}/v1/subscriptions/{subscription_id}/subscriptionLocalizations?limit={PAGE_LIMIT}",
            self.base_url
        );
        Ok(self
            .get_all_pages(url, "ListSubscriptionLocalizations")
            .await?
            .0)
    }

    async fn get_subscription_price(
        &self,
        subscription_id: &str,
        territory: &str,
    ) -> Result<Option<f64>, StorefrontError> {
        let url = format!(
            "{}/v1/subscriptions/{subscription_id}/prices?filter[territory]={territory}&include=subscriptionPricePoint&limit={PAGE_LIMIT}",
            self.base_url
        );
        let (_prices, included) = self
            .get_all_pages::<SubscriptionPriceAttributes>(url, "ListSubscriptionPrices")
            .await?;
        Ok(included
            .iter()
            .filter(|resource| {
                resource.resource_type == ConnectIncludedResourceModel::PRICE_POINT_TYPE
            })
            .filter_map(|resource| resource.attributes.as_ref()?.customer_price.as_deref())
            .find_map(|price| price.parse::<f64>().ok()))
    }
}

impl AppStoreConnectApiDatasourceImpl {
    pub(crate) fn new(token: AppleToken) -> Self {
        Self::with_base_url(APP_STORE_CONNECT_API_URL.to_owned(), token)
    }

    pub(crate) fn with_base_url(base_url: String, token: AppleToken) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            token,
        }
    }

    async fn get_all_pages<A: DeserializeOwned>(
        &self,
        first_page_url: String,
        function_name: &str,
    ) -> Result<
        (
            Vec<ConnectResourceModel<A>>,
            Vec<ConnectIncludedResourceModel>,
        ),
        StorefrontError,
    > {
        let mut data = Vec::new();
        let mut included = Vec::new();
        let mut next = Some(first_page_url);
        while let Some(url) = next.take() {
            let page: ConnectCollectionResponseModel<A> = self.callout(&url, function_name).await?;
            data.extend(page.data);
            included.extend(page.included);
            next = page.links.next.filter(|next_url| *next_url != url);
        }
        Ok((data, included))
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

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn datasource(server: &MockServer) -> AppStoreConnectApiDatasourceImpl {
        AppStoreConnectApiDatasourceImpl::with_base_url(
            server.uri(),
            AppleToken::Static("jwt".to_owned()),
        )
    }

    #[tokio::test]
    async fn follows_next_links_across_pages() {
        let server = MockServer::start().await;
        let second_page = format!("{}/v1/subscriptionGroups/g1/subscriptions?cursor=2", server.uri());
        Mock::given(method("GET"))
            .and(path("/v1/subscriptionGroups/g1/subscriptions"))
            .and(query_param("cursor", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{
                    "type": "subscriptions",
                    "id": "s2",
                    "attributes": { "productId": "premium_yearly", "state": "APPROVED" }
                }],
                "links": { "self": second_page }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/subscriptionGroups/g1/subscriptions"))
            .and(query_param("limit", "200"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{
                    "type": "subscriptions",
                    "id": "s1",
                    "attributes": { "productId": "basic_weekly", "state": "APPROVED" }
                }],
                "links": { "self": "first", "next": second_page }
            })))
            .mount(&server)
            .await;

        let subscriptions = datasource(&server).list_subscriptions("g1").await.unwrap();
        let ids: Vec<_> = subscriptions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn reads_customer_price_from_included_price_point() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/subscriptions/s1/prices"))
            .and(query_param("filter[territory]", "USA"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "type": "subscriptionPrices", "id": "p1", "attributes": { "preserved": false } }],
                "included": [
                    { "type": "territories", "id": "USA" },
                    { "type": "subscriptionPricePoints", "id": "pp1", "attributes": { "customerPrice": "9.99", "proceeds": "8.49" } }
                ],
                "links": { "self": "prices" }
            })))
            .mount(&server)
            .await;

        let price = datasource(&server)
            .get_subscription_price("s1", "USA")
            .await
            .unwrap();
        assert_eq!(price, Some(9.99));
    }

    #[tokio::test]
    async fn surfaces_rate_limiting_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = datasource(&server)
            .list_subscription_groups("123")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
