//! The `CloudProvider` capability and the types exchanged with it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleetgrid_state::{Distro, Host};

use crate::error::CloudResult;

/// How a single instance is bought.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "market", rename_all = "snake_case")]
pub enum Market {
    OnDemand,
    /// Spot market with a maximum hourly bid.
    Spot { bid_price: f64 },
}

/// Launch options produced by the provider selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnOptions {
    pub market: Market,
    pub subnet_id: Option<String>,
    /// Availability zone to launch in, when the selector pinned one.
    pub zone: Option<String>,
}

impl SpawnOptions {
    pub fn on_demand() -> Self {
        Self {
            market: Market::OnDemand,
            subnet_id: None,
            zone: None,
        }
    }
}

/// Provider-side state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    /// The provider gave up on the instance (launch error, capacity loss).
    Failed,
    Terminated,
}

impl InstanceState {
    /// The instance will never become usable.
    pub fn is_failed(&self) -> bool {
        matches!(self, InstanceState::Failed | InstanceState::Terminated)
    }
}

/// What the provider currently reports about an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub external_id: String,
    pub state: InstanceState,
    pub dns_name: Option<String>,
    /// Whether an SSH connection to the instance could be opened.
    pub ssh_reachable: bool,
    pub zone: Option<String>,
    pub instance_type: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
}

/// One spot price change as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotPriceSample {
    pub zone: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Filter for a spot price history query.
///
/// A `start_time` in the future asks the provider for only the latest
/// sample per zone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpotPriceFilter {
    pub instance_type: String,
    pub product_description: String,
    pub zone: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub next_token: Option<String>,
}

/// One page of spot price history, most recent sample first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpotPricePage {
    pub samples: Vec<SpotPriceSample>,
    pub next_token: Option<String>,
}

/// Filter for a subnet lookup inside a named virtual network.
#[derive(Debug, Clone, PartialEq)]
pub struct SubnetFilter {
    pub vpc_name: String,
    pub zone: String,
}

impl SubnetFilter {
    /// Name tag of the network's subnet in `zone`: `{vpc}.subnet_{suffix}`,
    /// where the suffix is the zone's third dash-separated part
    /// (`us-east-1a` → `1a`).
    pub fn subnet_name(&self) -> String {
        let suffix = self.zone.split('-').nth(2).unwrap_or(self.zone.as_str());
        format!("{}.subnet_{}", self.vpc_name, suffix)
    }
}

/// A compute backend capable of creating, inspecting and destroying hosts.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Launch an instance for the intent `host`, returning the host with
    /// its provider fields (external id, zone, instance type, bid) filled.
    async fn spawn_host(&self, distro: &Distro, host: &Host, options: &SpawnOptions)
    -> CloudResult<Host>;

    async fn describe_instance(&self, external_id: &str) -> CloudResult<InstanceSnapshot>;

    /// One page of spot price history; follow `next_token` for more.
    async fn describe_spot_price_history(
        &self,
        filter: &SpotPriceFilter,
    ) -> CloudResult<SpotPricePage>;

    /// Subnet ids matching the filter.
    async fn describe_subnets(&self, filter: &SubnetFilter) -> CloudResult<Vec<String>>;

    async fn terminate_instance(&self, external_id: &str) -> CloudResult<()>;

    /// Provider-specific setup run once a host is reachable.
    async fn on_up(&self, host: &Host) -> CloudResult<()>;
}
