//! Deterministic in-memory provider for tests and local runs.
//!
//! Instances get sequential ids (`mock-1`, `mock-2`, ...). Their reported
//! state can be changed at any time, spot price history is served in
//! fixed-size pages, and every provisioning hook call is counted.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use fleetgrid_state::{Distro, Host};

use crate::error::{CloudError, CloudResult};
use crate::provider::{
    CloudProvider, InstanceSnapshot, InstanceState, Market, SpawnOptions, SpotPriceFilter,
    SpotPricePage, SpotPriceSample, SubnetFilter,
};

/// A simulated instance.
#[derive(Debug, Clone, PartialEq)]
pub struct MockInstance {
    pub state: InstanceState,
    pub dns_name: Option<String>,
    pub ssh_reachable: bool,
    pub zone: String,
    pub instance_type: String,
    pub launch_time: DateTime<Utc>,
    pub market: Market,
    pub on_up_calls: u32,
}

impl MockInstance {
    /// A running, reachable instance.
    pub fn running(external_id: &str, launch_time: DateTime<Utc>) -> Self {
        Self {
            state: InstanceState::Running,
            dns_name: Some(format!("{external_id}.mock.internal")),
            ssh_reachable: true,
            zone: "us-east-1a".to_string(),
            instance_type: "m5.large".to_string(),
            launch_time,
            market: Market::OnDemand,
            on_up_calls: 0,
        }
    }
}

struct MockState {
    instances: HashMap<String, MockInstance>,
    next_id: u64,
    spawn_state: InstanceState,
    fail_spawn: bool,
    fail_on_up: bool,
    /// Newest first.
    spot_history: Vec<SpotPriceSample>,
    page_size: usize,
    history_calls: u32,
    /// `(vpc_name, subnet name tag)` → subnet ids.
    subnets: HashMap<(String, String), Vec<String>>,
    terminated: Vec<String>,
}

pub struct MockProvider {
    state: Mutex<MockState>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                instances: HashMap::new(),
                next_id: 1,
                spawn_state: InstanceState::Running,
                fail_spawn: false,
                fail_on_up: false,
                spot_history: Vec::new(),
                page_size: 100,
                history_calls: 0,
                subnets: HashMap::new(),
                terminated: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// State newly spawned instances report (default: running and reachable).
    pub fn set_spawn_state(&self, state: InstanceState) {
        self.lock().spawn_state = state;
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.lock().fail_spawn = fail;
    }

    pub fn fail_on_up(&self, fail: bool) {
        self.lock().fail_on_up = fail;
    }

    pub fn insert_instance(&self, external_id: &str, instance: MockInstance) {
        self.lock()
            .instances
            .insert(external_id.to_string(), instance);
    }

    pub fn instance(&self, external_id: &str) -> Option<MockInstance> {
        self.lock().instances.get(external_id).cloned()
    }

    /// Change one instance in place. Returns false if it does not exist.
    pub fn update_instance<F>(&self, external_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut MockInstance),
    {
        match self.lock().instances.get_mut(external_id) {
            Some(instance) => {
                f(instance);
                true
            }
            None => false,
        }
    }

    /// Change every instance in place.
    pub fn update_all<F>(&self, mut f: F)
    where
        F: FnMut(&mut MockInstance),
    {
        for instance in self.lock().instances.values_mut() {
            f(instance);
        }
    }

    pub fn on_up_calls(&self, external_id: &str) -> u32 {
        self.lock()
            .instances
            .get(external_id)
            .map(|i| i.on_up_calls)
            .unwrap_or(0)
    }

    /// External ids passed to `terminate_instance`, in call order.
    pub fn terminated(&self) -> Vec<String> {
        self.lock().terminated.clone()
    }

    /// Record a spot price change. Samples may be added in any order.
    pub fn add_spot_price(&self, zone: &str, price: f64, timestamp: DateTime<Utc>) {
        let mut state = self.lock();
        state.spot_history.push(SpotPriceSample {
            zone: zone.to_string(),
            price,
            timestamp,
        });
        state
            .spot_history
            .sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.lock().page_size = page_size.max(1);
    }

    /// Number of spot price history pages served.
    pub fn history_calls(&self) -> u32 {
        self.lock().history_calls
    }

    /// Register a subnet of `vpc_name` in `zone`.
    pub fn add_subnet(&self, vpc_name: &str, zone: &str, subnet_id: &str) {
        let filter = SubnetFilter {
            vpc_name: vpc_name.to_string(),
            zone: zone.to_string(),
        };
        self.lock()
            .subnets
            .entry((vpc_name.to_string(), filter.subnet_name()))
            .or_default()
            .push(subnet_id.to_string());
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn spawn_host(
        &self,
        distro: &Distro,
        host: &Host,
        options: &SpawnOptions,
    ) -> CloudResult<Host> {
        let mut state = self.lock();
        if state.fail_spawn {
            return Err(CloudError::provider(format!(
                "mock spawn failure for {}",
                host.id
            )));
        }
        let external_id = format!("mock-{}", state.next_id);
        state.next_id += 1;

        let zone = options
            .zone
            .clone()
            .unwrap_or_else(|| "us-east-1a".to_string());
        let mut instance = MockInstance::running(&external_id, Utc::now());
        instance.state = state.spawn_state;
        if state.spawn_state != InstanceState::Running {
            instance.dns_name = None;
            instance.ssh_reachable = false;
        }
        instance.zone = zone.clone();
        instance.instance_type = distro.settings.instance_type.clone();
        instance.market = options.market;
        state.instances.insert(external_id.clone(), instance);

        let mut spawned = host.clone();
        spawned.external_id = Some(external_id.clone());
        spawned.zone = Some(zone);
        spawned.instance_type = Some(distro.settings.instance_type.clone());
        spawned.subnet_id = options.subnet_id.clone();
        spawned.bid_price = match options.market {
            Market::Spot { bid_price } => Some(bid_price),
            Market::OnDemand => None,
        };
        debug!(host_id = %host.id, %external_id, "mock instance spawned");
        Ok(spawned)
    }

    async fn describe_instance(&self, external_id: &str) -> CloudResult<InstanceSnapshot> {
        let state = self.lock();
        let instance = state
            .instances
            .get(external_id)
            .ok_or_else(|| CloudError::InstanceNotFound(external_id.to_string()))?;
        Ok(InstanceSnapshot {
            external_id: external_id.to_string(),
            state: instance.state,
            dns_name: instance.dns_name.clone(),
            ssh_reachable: instance.ssh_reachable,
            zone: Some(instance.zone.clone()),
            instance_type: Some(instance.instance_type.clone()),
            launch_time: Some(instance.launch_time),
        })
    }

    async fn describe_spot_price_history(
        &self,
        filter: &SpotPriceFilter,
    ) -> CloudResult<SpotPricePage> {
        let mut state = self.lock();
        state.history_calls += 1;

        let in_zone = |s: &&SpotPriceSample| filter.zone.as_ref().is_none_or(|z| *z == s.zone);
        let matching: Vec<SpotPriceSample> = match filter.start_time {
            // A future start time means "latest sample per zone".
            Some(start) if start > Utc::now() => {
                let mut latest: Vec<SpotPriceSample> = Vec::new();
                for sample in state.spot_history.iter().filter(in_zone) {
                    if !latest.iter().any(|l| l.zone == sample.zone) {
                        latest.push(sample.clone());
                    }
                }
                latest
            }
            start => state
                .spot_history
                .iter()
                .filter(in_zone)
                .filter(|s| start.is_none_or(|t| s.timestamp >= t))
                .filter(|s| filter.end_time.is_none_or(|t| s.timestamp <= t))
                .cloned()
                .collect(),
        };

        let offset: usize = match &filter.next_token {
            Some(token) => token
                .parse()
                .map_err(|_| CloudError::provider(format!("bad page token {token:?}")))?,
            None => 0,
        };
        let end = (offset + state.page_size).min(matching.len());
        let samples = matching.get(offset..end).unwrap_or_default().to_vec();
        let next_token = (end < matching.len()).then(|| end.to_string());
        Ok(SpotPricePage {
            samples,
            next_token,
        })
    }

    async fn describe_subnets(&self, filter: &SubnetFilter) -> CloudResult<Vec<String>> {
        let key = (filter.vpc_name.clone(), filter.subnet_name());
        Ok(self.lock().subnets.get(&key).cloned().unwrap_or_default())
    }

    async fn terminate_instance(&self, external_id: &str) -> CloudResult<()> {
        let mut state = self.lock();
        let instance = state
            .instances
            .get_mut(external_id)
            .ok_or_else(|| CloudError::InstanceNotFound(external_id.to_string()))?;
        instance.state = InstanceState::Terminated;
        state.terminated.push(external_id.to_string());
        Ok(())
    }

    async fn on_up(&self, host: &Host) -> CloudResult<()> {
        let external_id = host
            .external_id
            .as_deref()
            .ok_or_else(|| CloudError::NotSpawned(host.id.clone()))?;
        let mut state = self.lock();
        let fail = state.fail_on_up;
        let instance = state
            .instances
            .get_mut(external_id)
            .ok_or_else(|| CloudError::InstanceNotFound(external_id.to_string()))?;
        instance.on_up_calls += 1;
        if fail {
            return Err(CloudError::provider(format!("mock setup failure for {}", host.id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::fetch_history;
    use chrono::Duration as ChronoDuration;
    use fleetgrid_state::{DistroSettings, ProviderKind, ProviderMode};

    fn distro() -> Distro {
        Distro {
            id: "ubuntu".to_string(),
            arch: "linux_amd64".to_string(),
            provider: ProviderKind::Mock,
            provider_mode: ProviderMode::OnDemand,
            pool_size: 10,
            settings: DistroSettings {
                instance_type: "c5.large".to_string(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn spawn_assigns_sequential_ids() {
        let mock = MockProvider::new();
        let d = distro();
        let intent = Host::intent("h1", &d, Utc::now());
        let a = mock.spawn_host(&d, &intent, &SpawnOptions::on_demand()).await.unwrap();
        let b = mock.spawn_host(&d, &intent, &SpawnOptions::on_demand()).await.unwrap();
        assert_eq!(a.external_id.as_deref(), Some("mock-1"));
        assert_eq!(b.external_id.as_deref(), Some("mock-2"));
        assert_eq!(a.instance_type.as_deref(), Some("c5.large"));

        let snap = mock.describe_instance("mock-1").await.unwrap();
        assert_eq!(snap.state, InstanceState::Running);
        assert!(snap.ssh_reachable);
    }

    #[tokio::test]
    async fn spot_spawn_records_bid() {
        let mock = MockProvider::new();
        let d = distro();
        let options = SpawnOptions {
            market: Market::Spot { bid_price: 0.2 },
            subnet_id: Some("subnet-1".to_string()),
            zone: Some("us-east-1b".to_string()),
        };
        let host = mock
            .spawn_host(&d, &Host::intent("h1", &d, Utc::now()), &options)
            .await
            .unwrap();
        assert_eq!(host.bid_price, Some(0.2));
        assert_eq!(host.zone.as_deref(), Some("us-east-1b"));
        assert_eq!(host.subnet_id.as_deref(), Some("subnet-1"));
    }

    #[tokio::test]
    async fn history_is_paged() {
        let mock = MockProvider::new();
        mock.set_page_size(2);
        let now = Utc::now();
        for i in 0..5 {
            mock.add_spot_price("us-east-1a", 0.1 * i as f64, now - ChronoDuration::hours(i));
        }
        let filter = SpotPriceFilter {
            instance_type: "m5.large".to_string(),
            product_description: "Linux/UNIX".to_string(),
            ..Default::default()
        };
        let history = fetch_history(&mock, &filter).await.unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(mock.history_calls(), 3);
        assert!(history.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[tokio::test]
    async fn subnets_are_found_by_name_tag() {
        let mock = MockProvider::new();
        mock.add_subnet("build", "us-east-1c", "subnet-abc");
        let found = mock
            .describe_subnets(&SubnetFilter {
                vpc_name: "build".to_string(),
                zone: "us-east-1c".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(found, vec!["subnet-abc".to_string()]);
    }
}
