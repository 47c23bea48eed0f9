//! PriceCache: lazily filled, process-scoped on-demand and storage prices.
//!
//! Each catalog is fetched the first time it is needed and then kept for
//! the lifetime of the cache. A single async mutex is held across the
//! whole read-or-fill, so concurrent callers wait for one in-flight fill
//! instead of starting their own. A failed fill leaves that catalog empty
//! and the next call tries again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::catalog::{CatalogSource, OnDemandKey, OnDemandPrices, StoragePrices};
use crate::error::{CloudError, CloudResult};
use crate::region::{OsType, region_full_name};

/// Storage is billed per GB-month; a month is thirty days.
const BILLING_MONTH: Duration = Duration::from_secs(30 * 24 * 3600);

#[derive(Default)]
struct CacheState {
    on_demand: Option<OnDemandPrices>,
    storage: Option<StoragePrices>,
}

/// Shared price cache. Construct once and pass around by `Arc`.
pub struct PriceCache {
    source: Arc<dyn CatalogSource>,
    state: Mutex<CacheState>,
}

impl PriceCache {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self {
            source,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Hourly on-demand price for an instance type in a region code
    /// (`us-east-1`).
    pub async fn on_demand_price(
        &self,
        os: OsType,
        instance_type: &str,
        region: &str,
    ) -> CloudResult<f64> {
        let mut state = self.state.lock().await;
        if state.on_demand.is_none() {
            let prices = self.source.fetch_on_demand().await?;
            info!(count = prices.len(), "on-demand price cache filled");
            state.on_demand = Some(prices);
        }

        let key = OnDemandKey {
            os: os.billing_name().to_string(),
            instance_type: instance_type.to_string(),
            location: region_full_name(region)?.to_string(),
        };
        let price = state
            .on_demand
            .as_ref()
            .and_then(|prices| prices.get(&key))
            .copied();
        debug!(?os, instance_type, region, ?price, "on-demand price lookup");
        price.ok_or_else(|| CloudError::PriceNotFound {
            os: key.os,
            instance_type: key.instance_type,
            region: region.to_string(),
        })
    }

    /// Storage price per GB-month for a region code.
    pub async fn storage_price(&self, region: &str) -> CloudResult<f64> {
        let mut state = self.state.lock().await;
        if state.storage.is_none() {
            let prices = self.source.fetch_storage().await?;
            info!(count = prices.len(), "storage price cache filled");
            state.storage = Some(prices);
        }
        state
            .storage
            .as_ref()
            .and_then(|prices| prices.get(region))
            .copied()
            .ok_or_else(|| CloudError::StoragePriceNotFound(region.to_string()))
    }

    /// Cost of keeping `size_gb` of storage in `region` for `duration`.
    pub async fn storage_cost(
        &self,
        region: &str,
        size_gb: u64,
        duration: Duration,
    ) -> CloudResult<f64> {
        let price = self.storage_price(region).await?;
        let months = duration.as_secs_f64() / BILLING_MONTH.as_secs_f64();
        Ok(size_gb as f64 * months * price)
    }

    /// Whether the on-demand catalog has been loaded.
    pub async fn has_on_demand(&self) -> bool {
        self.state.lock().await.on_demand.is_some()
    }
}
