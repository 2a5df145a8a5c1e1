use std::{collections::HashSet, sync::Arc};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    domain::{
        entities::{
            payment_record::Platform,
            plan::{Plan, PlanId, PlanType, StorefrontProduct},
        },
        repositories::{ledger_store::LedgerStore, storefront_repository::StorefrontRepository},
    },
    errors::{LedgerError, LedgerResult},
};

/// Outcome of one storefront plan sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSyncReport {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub deactivated: usize,
    pub skipped: usize,
}

/// Versioned plan definitions, kept in step with the storefronts.
pub struct PlanCatalog<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for PlanCatalog<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: LedgerStore> PlanCatalog<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Inserts the Free and Trial plans if the catalog lacks them. Returns how
    /// many were created.
    pub async fn ensure_default_plans(&self) -> LedgerResult<usize> {
        let now = self.clock.now();
        let mut missing = Vec::new();
        for plan_type in [PlanType::Free, PlanType::Trial] {
            if self.store.find_plan_by_type(plan_type).await?.is_none() {
                missing.push(match plan_type {
                    PlanType::Free => Plan::free(now),
                    _ => Plan::trial(now),
                });
            }
        }
        let created = missing.len();
        if created > 0 {
            self.store.save_plans(missing).await?;
            info!(created, "default plans created");
        }
        Ok(created)
    }

    pub async fn get_by_id(&self, id: &PlanId) -> LedgerResult<Plan> {
        self.store
            .get_plan(id)
            .await?
            .ok_or_else(|| LedgerError::PlanNotFound(id.to_string()))
    }

    pub async fn get_by_type(&self, plan_type: PlanType) -> LedgerResult<Option<Plan>> {
        Ok(self.store.find_plan_by_type(plan_type).await?)
    }

    /// The Free plan, created on first use.
    pub async fn free_plan(&self) -> LedgerResult<Plan> {
        if let Some(plan) = self.store.find_plan_by_type(PlanType::Free).await? {
            return Ok(plan);
        }
        let plan = Plan::free(self.clock.now());
        self.store.save_plans(vec![plan.clone()]).await?;
        Ok(plan)
    }

    /// Active plans, cheapest first.
    pub async fn list_active(&self) -> LedgerResult<Vec<Plan>> {
        let mut plans: Vec<_> = self
            .store
            .list_plans()
            .await?
            .into_iter()
            .filter(|plan| plan.is_active)
            .collect();
        plans.sort_by(|a, b| {
            a.price
                .total_cmp(&b.price)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(plans)
    }

    /// Pulls the platform's product list and merges it into the catalog.
    ///
    /// Nothing is written unless the whole product list was fetched, and the
    /// merged result is written in one batch.
    pub async fn sync_from_storefront<R: StorefrontRepository + ?Sized>(
        &self,
        storefront: &R,
        platform: Platform,
    ) -> LedgerResult<PlanSyncReport> {
        let products = storefront.list_products(platform).await?;
        let existing = self.store.list_plans().await?;
        let (changed, report) = merge_products(existing, platform, &products, self.clock.now());
        if !changed.is_empty() {
            self.store.save_plans(changed).await?;
        }
        info!(
            %platform,
            fetched = report.fetched,
            created = report.created,
            updated = report.updated,
            deactivated = report.deactivated,
            skipped = report.skipped,
            "plan sync finished"
        );
        Ok(report)
    }
}

/// Upserts `products` into `plans`, returning the plans that changed.
///
/// A product is matched by its platform product id, else attached to a plan of
/// the same tier that has no product on this platform yet, else inserted.
/// Plans whose product disappeared lose that product id and are deactivated
/// once no storefront offers them. The Free plan is never deactivated.
fn merge_products(
    mut plans: Vec<Plan>,
    platform: Platform,
    products: &[StorefrontProduct],
    now: chrono::DateTime<chrono::Utc>,
) -> (Vec<Plan>, PlanSyncReport) {
    let mut report = PlanSyncReport {
        fetched: products.len(),
        ..PlanSyncReport::default()
    };
    let mut touched: HashSet<PlanId> = HashSet::new();
    let offered: HashSet<&str> = products.iter().map(|p| p.product_id.as_str()).collect();

    for product in products {
        let Some(plan_type) = PlanType::from_product_id(&product.product_id) else {
            warn!(
                %platform,
                product_id = %product.product_id,
                "product id does not name a known tier; skipping"
            );
            report.skipped += 1;
            continue;
        };
        if plan_type.is_free() {
            debug!(product_id = %product.product_id, "free tier is not sold; skipping");
            report.skipped += 1;
            continue;
        }

        let position = plans
            .iter()
            .position(|plan| plan.product_id(platform) == Some(product.product_id.as_str()))
            .or_else(|| {
                plans.iter().position(|plan| {
                    plan.plan_type == plan_type
                        && plan.product_id(platform).is_none()
                        && !touched.contains(&plan.id)
                })
            });

        match position {
            Some(index) => {
                let plan = &mut plans[index];
                if let Some(name) = &product.name {
                    plan.name = name.clone();
                }
                if product.description.is_some() {
                    plan.description = product.description.clone();
                }
                if !product.features.is_empty() {
                    plan.features = product.features.clone();
                }
                plan.price = product.price;
                plan.currency = product.currency.clone();
                plan.set_product_id(platform, product.product_id.clone());
                plan.is_active = true;
                plan.version += 1;
                plan.updated_at = now;
                touched.insert(plan.id.clone());
                report.updated += 1;
            }
            None => {
                let mut plan = Plan::new(
                    product
                        .name
                        .clone()
                        .unwrap_or_else(|| plan_type.display_name().to_owned()),
                    plan_type,
                    product.price,
                    plan_type.default_allotment(),
                    now,
                );
                plan.description = product.description.clone();
                plan.features = product.features.clone();
                plan.currency = product.currency.clone();
                plan.set_product_id(platform, product.product_id.clone());
                touched.insert(plan.id.clone());
                plans.push(plan);
                report.created += 1;
            }
        }
    }

    for plan in plans.iter_mut() {
        let Some(product_id) = plan.product_id(platform) else {
            continue;
        };
        if offered.contains(product_id) || plan.plan_type.is_free() {
            continue;
        }
        info!(
            %platform,
            plan_id = %plan.id,
            product_id,
            "product no longer offered"
        );
        match platform {
            Platform::Android => plan.google_product_id = None,
            Platform::Ios => plan.apple_product_id = None,
            Platform::Stripe => {}
        }
        if plan.google_product_id.is_none() && plan.apple_product_id.is_none() && plan.is_active
        {
            plan.is_active = false;
            report.deactivated += 1;
        }
        plan.updated_at = now;
        touched.insert(plan.id.clone());
    }

    let changed = plans
        .into_iter()
        .filter(|plan| touched.contains(&plan.id))
        .collect();
    (changed, report)
}
