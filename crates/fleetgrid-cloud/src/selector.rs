//! Provider selection: on-demand or spot, and where to place a spot host.

use std::sync::Arc;

use tracing::{debug, info};

use fleetgrid_state::{Distro, Host, ProviderMode};

use crate::error::{CloudError, CloudResult};
use crate::price_cache::PriceCache;
use crate::provider::{CloudProvider, Market, SpawnOptions, SubnetFilter};
use crate::region::{OsType, az_to_region};
use crate::spot::latest_lowest_spot_price;

/// Chooses how each host is acquired.
///
/// Automatic mode compares the cached on-demand price with the current
/// lowest spot price. Spot wins only when strictly cheaper, and then bids
/// the on-demand price so a spike below that ceiling does not lose the
/// instance. Any price lookup failure is returned; there is no fallback.
pub struct ProviderSelector {
    provider: Arc<dyn CloudProvider>,
    prices: Arc<PriceCache>,
    default_region: String,
}

impl ProviderSelector {
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

    /// Region of the distro's configured zone, or the default region.
    pub fn region_for<'a>(&'a self, distro: &'a Distro) -> &'a str {
        if distro.settings.zone.is_empty() {
            &self.default_region
        } else {
            az_to_region(&distro.settings.zone)
        }
    }

    async fn on_demand_price(&self, distro: &Distro) -> CloudResult<f64> {
        self.prices
            .on_demand_price(
                OsType::for_distro(distro),
                &distro.settings.instance_type,
                self.region_for(distro),
            )
            .await
    }

    /// Launch options for `host` of `distro`.
    pub async fn select(&self, distro: &Distro, host: &Host) -> CloudResult<SpawnOptions> {
        if host.user_host {
            debug!(host_id = %host.id, "user host, using on-demand");
            return Ok(SpawnOptions::on_demand());
        }

        match distro.provider_mode {
            ProviderMode::OnDemand => Ok(SpawnOptions::on_demand()),
            ProviderMode::Spot => {
                let bid_price = match distro.settings.bid_price {
                    Some(bid) => bid,
                    None => self.on_demand_price(distro).await?,
                };
                Ok(SpawnOptions {
                    market: Market::Spot { bid_price },
                    subnet_id: None,
                    zone: None,
                })
            }
            ProviderMode::Auto => self.select_auto(distro, host).await,
        }
    }

    async fn select_auto(&self, distro: &Distro, host: &Host) -> CloudResult<SpawnOptions> {
        let on_demand = self.on_demand_price(distro).await?;
        let product = OsType::for_distro(distro).spot_product(distro.in_vpc());
        let (spot, zone) =
            latest_lowest_spot_price(self.provider.as_ref(), &distro.settings.instance_type, &product)
                .await?;

        if spot >= on_demand {
            info!(host_id = %host.id, distro = %distro.id, on_demand, spot, "selected on-demand");
            return Ok(SpawnOptions::on_demand());
        }

        let subnet_id = match (&distro.settings.vpc_name, distro.in_vpc()) {
            (Some(vpc_name), true) => Some(self.subnet_for_zone(vpc_name, &zone).await?),
            _ => None,
        };
        info!(
            host_id = %host.id,
            distro = %distro.id,
            on_demand,
            spot,
            %zone,
            "selected spot"
        );
        Ok(SpawnOptions {
            market: Market::Spot {
                bid_price: on_demand,
            },
            subnet_id,
            zone: Some(zone),
        })
    }

    async fn subnet_for_zone(&self, vpc_name: &str, zone: &str) -> CloudResult<String> {
        let filter = SubnetFilter {
            vpc_name: vpc_name.to_string(),
            zone: zone.to_string(),
        };
        let subnets = self.provider.describe_subnets(&filter).await?;
        subnets.into_iter().next().ok_or_else(|| CloudError::NoSubnet {
            vpc: vpc_name.to_string(),
            zone: zone.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::mock::MockProvider;
    use chrono::{Duration as ChronoDuration, Utc};
    use fleetgrid_state::{DistroSettings, ProviderKind};

    fn distro(mode: ProviderMode) -> Distro {
        Distro {
            id: "ubuntu".to_string(),
            arch: "linux_amd64".to_string(),
            provider: ProviderKind::Ec2,
            provider_mode: mode,
            pool_size: 10,
            settings: DistroSettings {
                instance_type: "m5.large".to_string(),
                ..Default::default()
            },
        }
    }

    fn selector(mock: Arc<MockProvider>) -> ProviderSelector {
        let catalog = StaticCatalog::new()
            .with_on_demand(OsType::Linux, "m5.large", "us-east-1", 0.10)
            .unwrap();
        let cache = Arc::new(PriceCache::new(Arc::new(catalog)));
        ProviderSelector::new(mock, cache, "us-east-1")
    }

    fn host(d: &Distro) -> Host {
        Host::intent("h1", d, Utc::now())
    }

    #[tokio::test]
    async fn auto_picks_cheaper_spot_and_bids_on_demand() {
        let mock = Arc::new(MockProvider::new());
        let now = Utc::now();
        mock.add_spot_price("us-east-1a", 0.05, now - ChronoDuration::minutes(5));
        mock.add_spot_price("us-east-1b", 0.03, now - ChronoDuration::minutes(9));
        mock.add_spot_price("us-east-1b", 0.09, now - ChronoDuration::hours(3));
        let d = distro(ProviderMode::Auto);

        let options = selector(mock).select(&d, &host(&d)).await.unwrap();
        assert_eq!(options.market, Market::Spot { bid_price: 0.10 });
        assert_eq!(options.zone.as_deref(), Some("us-east-1b"));
        assert_eq!(options.subnet_id, None);
    }

    #[tokio::test]
    async fn auto_keeps_on_demand_when_spot_is_not_cheaper() {
        let mock = Arc::new(MockProvider::new());
        mock.add_spot_price("us-east-1a", 0.10, Utc::now());
        let d = distro(ProviderMode::Auto);

        let options = selector(mock).select(&d, &host(&d)).await.unwrap();
        assert_eq!(options, SpawnOptions::on_demand());
    }

    #[tokio::test]
    async fn auto_resolves_vpc_subnet_in_chosen_zone() {
        let mock = Arc::new(MockProvider::new());
        mock.add_spot_price("us-east-1c", 0.02, Utc::now());
        mock.add_subnet("build", "us-east-1c", "subnet-1c");
        let mut d = distro(ProviderMode::Auto);
        d.settings.vpc_name = Some("build".to_string());
        d.settings.is_vpc = true;

        let options = selector(mock).select(&d, &host(&d)).await.unwrap();
        assert_eq!(options.subnet_id.as_deref(), Some("subnet-1c"));
    }

    #[tokio::test]
    async fn auto_missing_subnet_is_an_error() {
        let mock = Arc::new(MockProvider::new());
        mock.add_spot_price("us-east-1c", 0.02, Utc::now());
        let mut d = distro(ProviderMode::Auto);
        d.settings.vpc_name = Some("build".to_string());
        d.settings.is_vpc = true;

        let err = selector(mock).select(&d, &host(&d)).await.unwrap_err();
        assert!(matches!(err, CloudError::NoSubnet { .. }));
    }

    #[tokio::test]
    async fn auto_without_spot_history_is_an_error() {
        let mock = Arc::new(MockProvider::new());
        let d = distro(ProviderMode::Auto);
        let err = selector(mock).select(&d, &host(&d)).await.unwrap_err();
        assert!(matches!(err, CloudError::NoSpotPrices { .. }));
    }

    #[tokio::test]
    async fn auto_without_on_demand_price_is_an_error() {
        let mock = Arc::new(MockProvider::new());
        mock.add_spot_price("us-east-1a", 0.01, Utc::now());
        let mut d = distro(ProviderMode::Auto);
        d.settings.instance_type = "z1d.metal".to_string();
        let err = selector(mock).select(&d, &host(&d)).await.unwrap_err();
        assert!(matches!(err, CloudError::PriceNotFound { .. }));
    }

    #[tokio::test]
    async fn forced_modes_and_user_hosts() {
        let mock = Arc::new(MockProvider::new());
        let sel = selector(mock);

        let od = distro(ProviderMode::OnDemand);
        assert_eq!(sel.select(&od, &host(&od)).await.unwrap(), SpawnOptions::on_demand());

        let mut spot = distro(ProviderMode::Spot);
        let options = sel.select(&spot, &host(&spot)).await.unwrap();
        assert_eq!(options.market, Market::Spot { bid_price: 0.10 });
        spot.settings.bid_price = Some(0.07);
        let options = sel.select(&spot, &host(&spot)).await.unwrap();
        assert_eq!(options.market, Market::Spot { bid_price: 0.07 });

        let mut user = host(&spot);
        user.user_host = true;
        assert_eq!(sel.select(&spot, &user).await.unwrap(), SpawnOptions::on_demand());
    }

    #[test]
    fn region_comes_from_zone_or_default() {
        let mock = Arc::new(MockProvider::new());
        let sel = selector(mock);
        let mut d = distro(ProviderMode::Auto);
        assert_eq!(sel.region_for(&d), "us-east-1");
        d.settings.zone = "eu-west-1b".to_string();
        assert_eq!(sel.region_for(&d), "eu-west-1");
    }
}
