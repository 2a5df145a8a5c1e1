#![allow(dead_code)]

use serde::Deserialize;

/// A page of resources from the App Store Connect API (JSON:API format).
///
/// https://developer.apple.com/documentation/appstoreconnectapi/subscriptiongroupsresponse
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConnectCollectionResponseModel<A> {
    pub(crate) data: Vec<ConnectResourceModel<A>>,
    /// Related resources requested with `include=`.
    #[serde(default)]
    pub(crate) included: Vec<ConnectIncludedResourceModel>,
    pub(crate) links: PagedDocumentLinksModel,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConnectResourceModel<A> {
    #[serde(rename = "type")]
    pub(crate) resource_type: String,
    pub(crate) id: String,
    pub(crate) attributes: Option<A>,
}

/// Links related to the response document, including paging links.
///
/// https://developer.apple.com/documentation/appstoreconnectapi/pageddocumentlinks
#[derive(Debug, Deserialize)]
pub(crate) struct PagedDocumentLinksModel {
    /// The link that produced the current document.
    #[serde(rename = "self")]
    pub(crate) self_link: String,
    /// The link to the next page of documents.
    pub(crate) next: Option<String>,
}

/// https://developer.apple.com/documentation/appstoreconnectapi/subscriptiongroup/attributes
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubscriptionGroupAttributes {
    pub(crate) reference_name: Option<String>,
}

/// https://developer.apple.com/documentation/appstoreconnectapi/subscription/attributes
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubscriptionAttributes {
    pub(crate) name: Option<String>,
    pub(crate) product_id: String,
    pub(crate) family_sharable: Option<bool>,
    pub(crate) state: Option<SubscriptionProductState>,
    pub(crate) subscription_period: Option<SubscriptionPeriod>,
    pub(crate) review_note: Option<String>,
    pub(crate) group_level: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum SubscriptionProductState {
    MissingMetadata,
    ReadyToSubmit,
    WaitingForReview,
    InReview,
    DeveloperActionNeeded,
    PendingBinaryApproval,
    Approved,
    DeveloperRemovedFromSale,
    RemovedFromSale,
    Rejected,

    #[serde(untagged)]
    Unknown(String),
}

impl SubscriptionProductState {
    /// Products that were pulled from sale no longer back a plan.
    pub(crate) fn is_offered(&self) -> bool {
        !matches!(
            self,
            SubscriptionProductState::DeveloperRemovedFromSale
                | SubscriptionProductState::RemovedFromSale
                | SubscriptionProductState::Rejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum SubscriptionPeriod {
    OneWeek,
    OneMonth,
    TwoMonths,
    ThreeMonths,
    SixMonths,
    OneYear,

    #[serde(untagged)]
    Unknown(String),
}

/// https://developer.apple.com/documentation/appstoreconnectapi/subscriptionlocalization/attributes
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubscriptionLocalizationAttributes {
    pub(crate) name: Option<String>,
    pub(crate) locale: Option<String>,
    pub(crate) description: Option<String>,
}

/// https://developer.apple.com/documentation/appstoreconnectapi/subscriptionprice/attributes
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubscriptionPriceAttributes {
    pub(crate) start_date: Option<String>,
    pub(crate) preserved: Option<bool>,
}

/// Any resource pulled in with `include=`. Only price points are read.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConnectIncludedResourceModel {
    #[serde(rename = "type")]
    pub(crate) resource_type: String,
    pub(crate) id: String,
    pub(crate) attributes: Option<SubscriptionPricePointAttributes>,
}

/// https://developer.apple.com/documentation/appstoreconnectapi/subscriptionpricepoint/attributes
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubscriptionPricePointAttributes {
    /// Price the customer pays, as a decimal string (e.g. "9.99").
    pub(crate) customer_price: Option<String>,
    pub(crate) proceeds: Option<String>,
}

impl ConnectIncludedResourceModel {
    pub(crate) const PRICE_POINT_TYPE: &'static str = "subscriptionPricePoints";
}
