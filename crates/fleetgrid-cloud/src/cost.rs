//! Host cost accounting over a time window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use fleetgrid_state::{Distro, Host};

use crate::error::{CloudError, CloudResult};
use crate::price_cache::PriceCache;
use crate::provider::CloudProvider;
use crate::region::{OsType, az_to_region};
use crate::spot::{hourly_spot_rates, on_demand_cost, spot_cost_for_range};

/// Computes what a host cost over `[start, end)`.
///
/// On-demand hosts are charged the cached catalog price. Spot hosts are
/// charged by replaying the market history of their zone from launch.
pub struct CostCalculator {
    provider: Arc<dyn CloudProvider>,
    prices: Arc<PriceCache>,
    default_region: String,
}

impl CostCalculator {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        prices: Arc<PriceCache>,
        default_region: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            prices,
            default_region: default_region.into(),
        }
    }

    pub async fn compute_cost(
        &self,
        distro: &Distro,
        host: &Host,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CloudResult<f64> {
        let external_id = host
            .external_id
            .as_deref()
            .ok_or_else(|| CloudError::NotSpawned(host.id.clone()))?;
        let snapshot = self.provider.describe_instance(external_id).await?;
        let os = OsType::for_distro(distro);
        let instance_type = snapshot
            .instance_type
            .clone()
            .or_else(|| host.instance_type.clone())
            .unwrap_or_else(|| distro.settings.instance_type.clone());
        let zone = snapshot.zone.clone().or_else(|| host.zone.clone());

        let cost = if host.bid_price.is_none() {
            let region = zone
                .as_deref()
                .map(az_to_region)
                .unwrap_or(&self.default_region);
            let price = self.prices.on_demand_price(os, &instance_type, region).await?;
            on_demand_cost(price, start, end)
        } else {
            let zone = zone.ok_or_else(|| {
                CloudError::provider(format!("spot host {} has no availability zone", host.id))
            })?;
            let launch = snapshot
                .launch_time
                .or(host.start_time)
                .ok_or_else(|| CloudError::provider(format!("host {} has no launch time", host.id)))?;
            let product = os.spot_product(distro.in_vpc());
            let rates = hourly_spot_rates(
                self.provider.as_ref(),
                &instance_type,
                &product,
                &zone,
                launch,
                end,
            )
            .await?;
            spot_cost_for_range(start, end, &rates)
        };
        debug!(host_id = %host.id, cost, "host compute cost");
        Ok(cost)
    }

    /// Cost of `size_gb` of general purpose storage for `duration`.
    pub async fn storage_cost(
        &self,
        region: &str,
        size_gb: u64,
        duration: Duration,
    ) -> CloudResult<f64> {
        self.prices.storage_cost(region, size_gb, duration).await
    }
}
