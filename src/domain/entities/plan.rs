use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{
    FREE_IMAGE_CREDITS, FREE_PROMPT_CREDITS, FREE_TOTAL_CREDITS,
};

use super::payment_record::Platform;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub String);

impl PlanId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlanId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Free,
    Trial,
    Basic,
    Standard,
    Premium,
}

impl PlanType {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanType::Free => "free",
            PlanType::Trial => "trial",
            PlanType::Basic => "basic",
            PlanType::Standard => "standard",
            PlanType::Premium => "premium",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            PlanType::Free => "Free",
            PlanType::Trial => "Trial",
            PlanType::Basic => "Basic",
            PlanType::Standard => "Standard",
            PlanType::Premium => "Premium",
        }
    }

    pub fn is_free(self) -> bool {
        self == PlanType::Free
    }

    /// End of one billing period starting at `start`.
    pub fn period_end(self, start: DateTime<Utc>) -> DateTime<Utc> {
        let by_months = |months: u32| {
            start
                .checked_add_months(Months::new(months))
                .unwrap_or(start + Duration::days(30 * months as i64))
        };
        match self {
            PlanType::Basic | PlanType::Trial => start + Duration::days(7),
            PlanType::Standard => by_months(1),
            PlanType::Premium | PlanType::Free => by_months(12),
        }
    }

    /// Storefront products are mapped to plan types by the tier name embedded
    /// in their product id (e.g. `com.app.premium_yearly`).
    pub fn from_product_id(product_id: &str) -> Option<Self> {
        let id = product_id.to_ascii_lowercase();
        [
            PlanType::Trial,
            PlanType::Free,
            PlanType::Premium,
            PlanType::Standard,
            PlanType::Basic,
        ]
        .into_iter()
        .find(|plan_type| id.contains(plan_type.as_str()))
    }

    /// Credits granted by a plan of this tier when the storefront does not
    /// carry them.
    pub fn default_allotment(self) -> CreditAllotment {
        match self {
            PlanType::Free => CreditAllotment {
                total: FREE_TOTAL_CREDITS,
                image: FREE_IMAGE_CREDITS,
                prompt: FREE_PROMPT_CREDITS,
            },
            PlanType::Trial => CreditAllotment::split(10),
            PlanType::Basic => CreditAllotment::split(50),
            PlanType::Standard => CreditAllotment::split(150),
            PlanType::Premium => CreditAllotment::split(500),
        }
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAllotment {
    pub total: i64,
    pub image: i64,
    pub prompt: i64,
}

impl CreditAllotment {
    /// `total` credits, shared evenly between image and prompt generation.
    pub fn split(total: i64) -> Self {
        Self {
            total,
            image: total / 2,
            prompt: total - total / 2,
        }
    }
}

/// A catalog entry. Updated in place on resync (bumping `version`), never
/// deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    #[serde(rename = "type")]
    pub plan_type: PlanType,
    pub description: Option<String>,
    pub price: f64,
    pub currency: String,
    pub total_credits: i64,
    pub image_credits: i64,
    pub prompt_credits: i64,
    #[serde(default)]
    pub features: Vec<String>,
    pub version: u32,
    pub google_product_id: Option<String>,
    pub apple_product_id: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(
        name: impl Into<String>,
        plan_type: PlanType,
        price: f64,
        credits: CreditAllotment,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PlanId::generate(),
            name: name.into(),
            plan_type,
            description: None,
            price,
            currency: "USD".to_owned(),
            total_credits: credits.total,
            image_credits: credits.image,
            prompt_credits: credits.prompt,
            features: Vec::new(),
            version: 1,
            google_product_id: None,
            apple_product_id: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn free(now: DateTime<Utc>) -> Self {
        let mut plan = Self::new(
            PlanType::Free.display_name(),
            PlanType::Free,
            0.0,
            PlanType::Free.default_allotment(),
            now,
        );
        plan.description = Some("Daily free credits with watermarked output".to_owned());
        plan
    }

    pub fn trial(now: DateTime<Utc>) -> Self {
        let mut plan = Self::new(
            PlanType::Trial.display_name(),
            PlanType::Trial,
            0.0,
            PlanType::Trial.default_allotment(),
            now,
        );
        plan.description = Some("7-day free trial".to_owned());
        plan
    }

    pub fn allotment(&self) -> CreditAllotment {
        CreditAllotment {
            total: self.total_credits,
            image: self.image_credits,
            prompt: self.prompt_credits,
        }
    }

    /// Price in the smallest currency unit, as charged through Stripe.
    pub fn price_cents(&self) -> i64 {
        (self.price * 100.0).round() as i64
    }

    pub fn product_id(&self, platform: Platform) -> Option<&str> {
        match platform {
            Platform::Android => self.google_product_id.as_deref(),
            Platform::Ios => self.apple_product_id.as_deref(),
            Platform::Stripe => None,
        }
    }

    pub fn set_product_id(&mut self, platform: Platform, product_id: String) {
        match platform {
            Platform::Android => self.google_product_id = Some(product_id),
            Platform::Ios => self.apple_product_id = Some(product_id),
            Platform::Stripe => {}
        }
    }

    pub fn snapshot(&self) -> PlanSnapshot {
        PlanSnapshot {
            plan_id: self.id.clone(),
            name: self.name.clone(),
            plan_type: self.plan_type,
            price: self.price,
            total_credits: self.total_credits,
            image_credits: self.image_credits,
            prompt_credits: self.prompt_credits,
            features: self.features.clone(),
            version: self.version,
        }
    }
}

/// Copy of a plan taken when it was assigned, immune to later catalog edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSnapshot {
    pub plan_id: PlanId,
    pub name: String,
    #[serde(rename = "type")]
    pub plan_type: PlanType,
    pub price: f64,
    pub total_credits: i64,
    pub image_credits: i64,
    pub prompt_credits: i64,
    #[serde(default)]
    pub features: Vec<String>,
    pub version: u32,
}

impl PlanSnapshot {
    pub fn allotment(&self) -> CreditAllotment {
        CreditAllotment {
            total: self.total_credits,
            image: self.image_credits,
            prompt: self.prompt_credits,
        }
    }
}

/// A subscription product as listed by a storefront.
#[derive(Debug, Clone, PartialEq)]
pub struct StorefrontProduct {
    pub platform: Platform,
    pub product_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: f64,
    pub currency: String,
    pub features: Vec<String>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn billing_periods_follow_tier() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        assert_eq!(PlanType::Basic.period_end(start), start + Duration::days(7));
        assert_eq!(PlanType::Trial.period_end(start), start + Duration::days(7));
        // Month arithmetic clamps to the end of February.
        assert_eq!(
            PlanType::Standard.period_end(start),
            Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap()
        );
        assert_eq!(
            PlanType::Premium.period_end(start),
            Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn product_ids_map_to_tiers() {
        assert_eq!(
            PlanType::from_product_id("com.app.premium_yearly"),
            Some(PlanType::Premium)
        );
        assert_eq!(
            PlanType::from_product_id("basic-weekly"),
            Some(PlanType::Basic)
        );
        assert_eq!(
            PlanType::from_product_id("premium_trial"),
            Some(PlanType::Trial)
        );
        assert_eq!(PlanType::from_product_id("coins_100"), None);
    }

    #[test]
    fn split_allotment_keeps_total() {
        let allotment = CreditAllotment::split(151);
        assert_eq!(allotment.image + allotment.prompt, 151);
    }
}
