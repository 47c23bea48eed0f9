//! EC2 backend for `CloudProvider`.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::Client;
use aws_sdk_ec2::primitives::DateTime as AwsDateTime;
use aws_sdk_ec2::types::{
    Filter, Instance, InstanceMarketOptionsRequest, InstanceStateName, InstanceType, MarketType,
    Placement, ResourceType, SpotMarketOptions, Tag, TagSpecification,
};
use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use fleetgrid_state::{Distro, Host};

use crate::error::{CloudError, CloudResult};
use crate::provider::{
    CloudProvider, InstanceSnapshot, InstanceState, Market, SpawnOptions, SpotPriceFilter,
    SpotPricePage, SpotPriceSample, SubnetFilter,
};

const SSH_PORT: u16 = 22;

fn to_chrono(dt: &AwsDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

fn to_aws(dt: DateTime<Utc>) -> AwsDateTime {
    AwsDateTime::from_secs(dt.timestamp())
}

fn instance_state(instance: &Instance) -> InstanceState {
    match instance.state().and_then(|s| s.name()) {
        Some(InstanceStateName::Pending) => InstanceState::Pending,
        Some(InstanceStateName::Running) => InstanceState::Running,
        Some(InstanceStateName::Stopping) => InstanceState::Stopping,
        Some(InstanceStateName::Stopped) => InstanceState::Stopped,
        Some(InstanceStateName::ShuttingDown) | Some(InstanceStateName::Terminated) => {
            InstanceState::Terminated
        }
        _ => InstanceState::Pending,
    }
}

fn instance_dns(instance: &Instance) -> Option<String> {
    [instance.public_dns_name(), instance.private_dns_name()]
        .into_iter()
        .flatten()
        .find(|name| !name.is_empty())
        .map(str::to_string)
}

pub struct Ec2Provider {
    client: Client,
    ssh_timeout: Duration,
}

impl Ec2Provider {
    pub fn new(client: Client, ssh_timeout: Duration) -> Self {
        Self {
            client,
            ssh_timeout,
        }
    }

    /// Build a client from the ambient AWS credentials for `region`.
    pub async fn from_env(region: &str, ssh_timeout: Duration) -> Self {
        debug!(region, "creating EC2 client");
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self::new(Client::new(&config), ssh_timeout)
    }

    async fn ssh_reachable(&self, dns_name: &str) -> bool {
        matches!(
            tokio::time::timeout(self.ssh_timeout, TcpStream::connect((dns_name, SSH_PORT))).await,
            Ok(Ok(_))
        )
    }

    async fn vpc_id(&self, vpc_name: &str) -> CloudResult<Option<String>> {
        let response = self
            .client
            .describe_vpcs()
            .filters(Filter::builder().name("tag:Name").values(vpc_name).build())
            .send()
            .await
            .map_err(CloudError::from_ec2)?;
        Ok(response
            .vpcs()
            .iter()
            .find_map(|vpc| vpc.vpc_id().map(str::to_string)))
    }
}

#[async_trait]
impl CloudProvider for Ec2Provider {
    fn name(&self) -> &str {
        "ec2"
    }

    async fn spawn_host(
        &self,
        distro: &Distro,
        host: &Host,
        options: &SpawnOptions,
    ) -> CloudResult<Host> {
        let settings = &distro.settings;
        let tags = TagSpecification::builder()
            .resource_type(ResourceType::Instance)
            .tags(Tag::builder().key("Name").value(&host.id).build())
            .tags(Tag::builder().key("distro").value(&distro.id).build())
            .tags(Tag::builder().key("started-by").value(&host.started_by).build())
            .build();

        let mut request = self
            .client
            .run_instances()
            .image_id(&settings.ami)
            .instance_type(InstanceType::from(settings.instance_type.as_str()))
            .set_security_group_ids(
                (!settings.security_groups.is_empty()).then(|| settings.security_groups.clone()),
            )
            .set_key_name((!settings.key_name.is_empty()).then(|| settings.key_name.clone()))
            .set_subnet_id(options.subnet_id.clone())
            .tag_specifications(tags)
            .min_count(1)
            .max_count(1);

        if let Some(zone) = &options.zone {
            request = request.placement(Placement::builder().availability_zone(zone).build());
        }
        if let Market::Spot { bid_price } = options.market {
            debug!(host_id = %host.id, bid_price, "launching as spot instance");
            let market_options = InstanceMarketOptionsRequest::builder()
                .market_type(MarketType::Spot)
                .spot_options(
                    SpotMarketOptions::builder()
                        .max_price(format!("{bid_price}"))
                        .build(),
                )
                .build();
            request = request.instance_market_options(market_options);
        }

        let response = request.send().await.map_err(CloudError::from_ec2)?;
        let instance = response
            .instances()
            .first()
            .ok_or_else(|| CloudError::provider("run_instances returned no instance"))?;
        let external_id = instance
            .instance_id()
            .ok_or_else(|| CloudError::provider("run_instances returned no instance id"))?;

        let mut spawned = host.clone();
        spawned.external_id = Some(external_id.to_string());
        spawned.zone = instance
            .placement()
            .and_then(|p| p.availability_zone())
            .map(str::to_string)
            .or_else(|| options.zone.clone());
        spawned.instance_type = Some(settings.instance_type.clone());
        spawned.subnet_id = options.subnet_id.clone();
        spawned.bid_price = match options.market {
            Market::Spot { bid_price } => Some(bid_price),
            Market::OnDemand => None,
        };
        info!(host_id = %host.id, %external_id, distro = %distro.id, "EC2 instance launched");
        Ok(spawned)
    }

    async fn describe_instance(&self, external_id: &str) -> CloudResult<InstanceSnapshot> {
        let response = self
            .client
            .describe_instances()
            .instance_ids(external_id)
            .send()
            .await
            .map_err(CloudError::from_ec2)?;
        let instance = response
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .next()
            .ok_or_else(|| CloudError::InstanceNotFound(external_id.to_string()))?;

        let state = instance_state(instance);
        let dns_name = instance_dns(instance);
        let ssh_reachable = match (&dns_name, state) {
            (Some(dns), InstanceState::Running) => self.ssh_reachable(dns).await,
            _ => false,
        };
        Ok(InstanceSnapshot {
            external_id: external_id.to_string(),
            state,
            dns_name,
            ssh_reachable,
            zone: instance
                .placement()
                .and_then(|p| p.availability_zone())
                .map(str::to_string),
            instance_type: instance.instance_type().map(|t| t.as_str().to_string()),
            launch_time: instance.launch_time().and_then(to_chrono),
        })
    }

    async fn describe_spot_price_history(
        &self,
        filter: &SpotPriceFilter,
    ) -> CloudResult<SpotPricePage> {
        let response = self
            .client
            .describe_spot_price_history()
            .instance_types(InstanceType::from(filter.instance_type.as_str()))
            .product_descriptions(&filter.product_description)
            .set_availability_zone(filter.zone.clone())
            .set_start_time(filter.start_time.map(to_aws))
            .set_end_time(filter.end_time.map(to_aws))
            .set_next_token(filter.next_token.clone())
            .send()
            .await
            .map_err(CloudError::from_ec2)?;

        let mut samples = Vec::with_capacity(response.spot_price_history().len());
        for entry in response.spot_price_history() {
            let raw = entry.spot_price().unwrap_or_default();
            let price: f64 = raw
                .parse()
                .map_err(|_| CloudError::InvalidSpotPrice(raw.to_string()))?;
            let Some(timestamp) = entry.timestamp().and_then(to_chrono) else {
                warn!(price, "spot price sample without timestamp skipped");
                continue;
            };
            samples.push(SpotPriceSample {
                zone: entry.availability_zone().unwrap_or_default().to_string(),
                price,
                timestamp,
            });
        }
        Ok(SpotPricePage {
            samples,
            next_token: response.next_token().map(str::to_string),
        })
    }

    async fn describe_subnets(&self, filter: &SubnetFilter) -> CloudResult<Vec<String>> {
        let Some(vpc_id) = self.vpc_id(&filter.vpc_name).await? else {
            return Ok(Vec::new());
        };
        let response = self
            .client
            .describe_subnets()
            .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
            .filters(
                Filter::builder()
                    .name("tag:Name")
                    .values(filter.subnet_name())
                    .build(),
            )
            .send()
            .await
            .map_err(CloudError::from_ec2)?;
        Ok(response
            .subnets()
            .iter()
            .filter_map(|s| s.subnet_id().map(str::to_string))
            .collect())
    }

    async fn terminate_instance(&self, external_id: &str) -> CloudResult<()> {
        self.client
            .terminate_instances()
            .instance_ids(external_id)
            .send()
            .await
            .map_err(CloudError::from_ec2)?;
        info!(%external_id, "EC2 instance terminated");
        Ok(())
    }

    async fn on_up(&self, host: &Host) -> CloudResult<()> {
        // Nothing EC2-specific to run once the host answers on SSH.
        debug!(host_id = %host.id, "EC2 host up");
        Ok(())
    }
}
