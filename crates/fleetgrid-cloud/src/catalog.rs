//! Bulk pricing catalogs: on-demand compute prices and storage prices.
//!
//! Both catalogs are large public documents fetched over HTTP. The on-demand
//! offer file is plain JSON; the storage catalog is JSON wrapped in a
//! JavaScript callback. Parsing is kept separate from fetching so the
//! filters can be tested without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use fleet_core::PricingConfig;

use crate::error::{CloudError, CloudResult};
use crate::region::{OsType, region_full_name};
use crate::retry::{RetryPolicy, retry};

/// Storage class whose price is cached (general purpose SSD).
const STORAGE_CLASS: &str = "ebsGPSSD";

/// Lookup key of an on-demand price: catalog OS name, instance type and
/// catalog location name (`US East (N. Virginia)`, not `us-east-1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OnDemandKey {
    pub os: String,
    pub instance_type: String,
    pub location: String,
}

/// Hourly on-demand prices in USD.
pub type OnDemandPrices = HashMap<OnDemandKey, f64>;

/// Storage prices in USD per GB-month, keyed by region code.
pub type StoragePrices = HashMap<String, f64>;

/// Where catalog data comes from.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_on_demand(&self) -> CloudResult<OnDemandPrices>;
    async fn fetch_storage(&self) -> CloudResult<StoragePrices>;
}

// ── On-demand offer file ───────────────────────────────────────────

#[derive(Deserialize)]
struct OfferFile {
    #[serde(default)]
    products: HashMap<String, Product>,
    #[serde(default)]
    terms: Terms,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Product {
    sku: String,
    #[serde(default)]
    product_family: String,
    #[serde(default)]
    attributes: ProductAttributes,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ProductAttributes {
    location: String,
    instance_type: String,
    pre_installed_sw: String,
    operating_system: String,
    tenancy: String,
    license_model: String,
}

impl Product {
    fn is_shared_compute(&self) -> bool {
        let a = &self.attributes;
        self.product_family == "Compute Instance"
            && a.pre_installed_sw == "NA"
            && a.tenancy == "Shared"
            && a.license_model != "Bring your own license"
    }
}

#[derive(Default, Deserialize)]
struct Terms {
    #[serde(rename = "OnDemand", default)]
    on_demand: HashMap<String, HashMap<String, Term>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Term {
    #[serde(default)]
    price_dimensions: HashMap<String, PriceDimension>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceDimension {
    #[serde(default)]
    price_per_unit: HashMap<String, String>,
}

impl Terms {
    /// USD price of a SKU's first on-demand term, by term then rate code.
    fn sku_price(&self, sku: &str) -> Option<f64> {
        let terms = self.on_demand.get(sku)?;
        let mut term_codes: Vec<&String> = terms.keys().collect();
        term_codes.sort();
        for code in term_codes {
            let dims = &terms[code].price_dimensions;
            let mut rate_codes: Vec<&String> = dims.keys().collect();
            rate_codes.sort();
            for rate in rate_codes {
                if let Some(usd) = dims[rate].price_per_unit.get("USD") {
                    return usd.parse::<f64>().ok();
                }
            }
        }
        None
    }
}

/// Parse the on-demand offer file into prices for shared-tenancy compute
/// instances without pre-installed software or bring-your-own licensing.
///
/// Entries with a missing, unparsable or negative price are dropped.
pub fn parse_on_demand(body: &str) -> CloudResult<OnDemandPrices> {
    let offer: OfferFile =
        serde_json::from_str(body).map_err(|e| CloudError::Catalog(e.to_string()))?;

    let mut prices = OnDemandPrices::new();
    for product in offer.products.values().filter(|p| p.is_shared_compute()) {
        let Some(price) = offer.terms.sku_price(&product.sku) else {
            continue;
        };
        if !price.is_finite() || price < 0.0 {
            continue;
        }
        prices.insert(
            OnDemandKey {
                os: product.attributes.operating_system.clone(),
                instance_type: product.attributes.instance_type.clone(),
                location: product.attributes.location.clone(),
            },
            price,
        );
    }

    if prices.is_empty() {
        return Err(CloudError::Catalog(
            "no compute instance prices in offer file".to_string(),
        ));
    }
    Ok(prices)
}

// ── Storage catalog ────────────────────────────────────────────────

#[derive(Deserialize)]
struct StorageDocument {
    config: StorageConfig,
}

#[derive(Deserialize)]
struct StorageConfig {
    #[serde(default)]
    regions: Vec<StorageRegion>,
}

#[derive(Deserialize)]
struct StorageRegion {
    region: String,
    #[serde(default)]
    types: Vec<StorageType>,
}

#[derive(Deserialize)]
struct StorageType {
    name: String,
    #[serde(default)]
    values: Vec<StorageValue>,
}

#[derive(Deserialize)]
struct StorageValue {
    prices: HashMap<String, String>,
}

/// Extract general purpose SSD prices from the storage catalog script.
///
/// Fails when the embedded JSON is missing or yields no prices, which
/// usually means the document's layout changed.
pub fn parse_storage(body: &str) -> CloudResult<StoragePrices> {
    let re = Regex::new(r"(?s)callback\((.*)\)").map_err(|e| CloudError::Catalog(e.to_string()))?;
    let json = re
        .captures(body)
        .and_then(|c| c.get(1))
        .ok_or_else(|| CloudError::Catalog("no price JSON in storage catalog".to_string()))?;
    let doc: StorageDocument =
        serde_json::from_str(json.as_str()).map_err(|e| CloudError::Catalog(e.to_string()))?;

    let mut prices = StoragePrices::new();
    for region in &doc.config.regions {
        for kind in region.types.iter().filter(|t| t.name.contains(STORAGE_CLASS)) {
            let price = kind
                .values
                .first()
                .and_then(|v| v.prices.get("USD"))
                .and_then(|usd| usd.parse::<f64>().ok());
            if let Some(price) = price.filter(|p| p.is_finite() && *p >= 0.0) {
                prices.insert(region.region.clone(), price);
            }
        }
    }

    if prices.is_empty() {
        return Err(CloudError::Catalog(
            "no storage prices in storage catalog".to_string(),
        ));
    }
    Ok(prices)
}

// ── HTTP source ────────────────────────────────────────────────────

/// Fetches both catalogs over HTTP, retrying transport and parse failures.
pub struct HttpCatalog {
    client: reqwest::Client,
    on_demand_url: String,
    storage_url: String,
    policy: RetryPolicy,
}

impl HttpCatalog {
    pub fn new(config: &PricingConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            on_demand_url: config.on_demand_url.clone(),
            storage_url: config.storage_url.clone(),
            policy: RetryPolicy::from_config(config),
        }
    }

    async fn get_text(&self, url: &str) -> CloudResult<String> {
        let fetch_err = |e: reqwest::Error| CloudError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(fetch_err)?
            .error_for_status()
            .map_err(fetch_err)?;
        response.text().await.map_err(fetch_err)
    }
}

#[async_trait]
impl CatalogSource for HttpCatalog {
    async fn fetch_on_demand(&self) -> CloudResult<OnDemandPrices> {
        let url = self.on_demand_url.as_str();
        info!(%url, "loading on-demand pricing");
        let prices = retry(&self.policy, "on-demand catalog", || async move {
            let body = self.get_text(url).await?;
            parse_on_demand(&body)
        })
        .await?;
        debug!(count = prices.len(), "on-demand pricing parsed");
        Ok(prices)
    }

    async fn fetch_storage(&self) -> CloudResult<StoragePrices> {
        let url = self.storage_url.as_str();
        info!(%url, "loading storage pricing");
        let prices = retry(&self.policy, "storage catalog", || async move {
            let body = self.get_text(url).await?;
            parse_storage(&body)
        })
        .await?;
        debug!(count = prices.len(), "storage pricing parsed");
        Ok(prices)
    }
}

// ── In-memory source ───────────────────────────────────────────────

/// Fixed catalog data, optionally failing the first few fetches.
#[derive(Default)]
pub struct StaticCatalog {
    on_demand: OnDemandPrices,
    storage: StoragePrices,
    failures_remaining: AtomicU32,
    fetches: AtomicU32,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an on-demand price for a region code such as `us-east-1`.
    /// Negative or non-finite prices are dropped, as on the HTTP path.
    pub fn with_on_demand(
        mut self,
        os: OsType,
        instance_type: &str,
        region: &str,
        price: f64,
    ) -> CloudResult<Self> {
        let location = region_full_name(region)?;
        if !price.is_finite() || price < 0.0 {
            warn!(instance_type, region, price, "dropping invalid on-demand price");
            return Ok(self);
        }
        self.on_demand.insert(
            OnDemandKey {
                os: os.billing_name().to_string(),
                instance_type: instance_type.to_string(),
                location: location.to_string(),
            },
            price,
        );
        Ok(self)
    }

    pub fn with_storage(mut self, region: &str, price: f64) -> Self {
        if !price.is_finite() || price < 0.0 {
            warn!(region, price, "dropping invalid storage price");
            return self;
        }
        self.storage.insert(region.to_string(), price);
        self
    }

    /// Make the next `n` fetches fail with a transport error.
    pub fn failing(self, n: u32) -> Self {
        self.failures_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Number of fetch calls made so far, failed ones included.
    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn attempt(&self, what: &str) -> CloudResult<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CloudError::Fetch {
                url: format!("static://{what}"),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn fetch_on_demand(&self) -> CloudResult<OnDemandPrices> {
        self.attempt("on-demand")?;
        Ok(self.on_demand.clone())
    }

    async fn fetch_storage(&self) -> CloudResult<StoragePrices> {
        self.attempt("storage")?;
        Ok(self.storage.clone())
    }
}
