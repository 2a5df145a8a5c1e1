#![allow(dead_code)]

use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};

/// Response of monetization.subscriptions.list.
///
/// https://developers.google.com/android-publisher/api-ref/rest/v3/monetization.subscriptions/list
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListSubscriptionsResponseModel {
    /// The subscriptions from the specified app.
    #[serde(default)]
    pub(crate) subscriptions: Vec<SubscriptionModel>,
    /// A token, which can be sent as pageToken to retrieve the next page. If
    /// this field is omitted, there are no subsequent pages.
    pub(crate) next_page_token: Option<String>,
}

/// A single subscription for an app.
///
/// https://developers.google.com/android-publisher/api-ref/rest/v3/monetization.subscriptions#Subscription
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubscriptionModel {
    /// Immutable. Package name of the parent app.
    pub(crate) package_name: Option<String>,
    /// Immutable. Unique product ID of the product.
    pub(crate) product_id: String,
    /// The set of base plans for this subscription.
    #[serde(default)]
    pub(crate) base_plans: Vec<BasePlan>,
    /// List of localized listings for this subscription.
    #[serde(default)]
    pub(crate) listings: Vec<SubscriptionListing>,
    /// Whether this subscription is archived. Archived subscriptions are not
    /// available to any subscriber any longer.
    #[serde(default)]
    pub(crate) archived: bool,
}

impl SubscriptionModel {
    pub(crate) fn is_offered(&self) -> bool {
        !self.archived
            && self
                .base_plans
                .iter()
                .any(|plan| plan.state == BasePlanState::Active)
    }

    /// English listing if there is one, else the first.
    pub(crate) fn primary_listing(&self) -> Option<&SubscriptionListing> {
        self.listings
            .iter()
            .find(|listing| listing.language_code.starts_with("en"))
            .or_else(|| self.listings.first())
    }

    /// Price in `region_code` of the first active base plan.
    pub(crate) fn price_in(&self, region_code: &str) -> Option<&Money> {
        let plan = self
            .base_plans
            .iter()
            .find(|plan| plan.state == BasePlanState::Active)?;
        plan.regional_configs
            .iter()
            .find(|config| config.region_code == region_code)
            .or_else(|| plan.regional_configs.first())
            .and_then(|config| config.price.as_ref())
    }
}

/// A single base plan for a subscription.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BasePlan {
    /// Immutable. The unique identifier of this base plan.
    pub(crate) base_plan_id: String,
    /// Output only. The state of the base plan.
    pub(crate) state: BasePlanState,
    /// Set when the base plan automatically renews at a regular interval.
    pub(crate) auto_renewing_base_plan_type: Option<BasePlanType>,
    /// Set when the base plan does not automatically renew at the end of the
    /// billing period.
    pub(crate) prepaid_base_plan_type: Option<BasePlanType>,
    /// Region-specific information for this base plan.
    #[serde(default)]
    pub(crate) regional_configs: Vec<RegionalBasePlanConfig>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum BasePlanState {
    /// Unspecified state.
    StateUnspecified,
    /// The base plan is currently in a draft state, and hasn't been activated.
    Draft,
    /// The base plan is active and available for new subscribers.
    Active,
    /// The base plan is inactive and only available for existing subscribers.
    Inactive,
    #[serde(untagged)]
    Unknown(String),
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BasePlanType {
    /// Subscription period, specified in ISO 8601 format (e.g. "P1M").
    pub(crate) billing_period_duration: Option<String>,
}

/// Configuration for a base plan specific to a region.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegionalBasePlanConfig {
    /// Region code this configuration applies to, as defined by ISO 3166-2.
    pub(crate) region_code: String,
    /// The price of the base plan in the specified region.
    pub(crate) price: Option<Money>,
}

/// The consumer-visible metadata of a subscription.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubscriptionListing {
    /// The language of this listing, as defined by BCP-47, e.g. "en-US".
    pub(crate) language_code: String,
    /// The title of this subscription in the language of this listing.
    pub(crate) title: Option<String>,
    /// A list of benefits shown to the user on platforms such as the Play
    /// Store and in restoration flows in the language of this listing.
    #[serde(default)]
    pub(crate) benefits: Vec<String>,
    /// The description of this subscription in the language of this listing.
    pub(crate) description: Option<String>,
}

/// Represents an amount of money with its currency type.
#[serde_as]
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Money {
    /// The three-letter currency code defined in ISO 4217.
    pub(crate) currency_code: String,
    /// The whole units of the amount. Encoded as a string (int64).
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    pub(crate) units: i64,
    /// Number of nano (10^-9) units of the amount.
    #[serde(default)]
    pub(crate) nanos: i32,
}

impl Money {
    pub(crate) fn as_f64(&self) -> f64 {
        self.units as f64 + self.nanos as f64 / 1_000_000_000.0
    }
}
