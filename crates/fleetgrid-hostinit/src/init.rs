//! Host init: starts intents, brings ready hosts up and reaps dead ones.
//!
//! A sweep runs three passes over the store:
//!
//! 1. **start**: every uninitialized intent is launched through the
//!    provider selector and moved to `starting`.
//! 2. **setup**: every `starting`/`initializing` host is checked for
//!    readiness. Ready hosts get their provisioning hook and become
//!    `running`; failed or stale ones are terminated.
//! 3. **terminate**: hosts matching a termination rule are terminated.
//!
//! Failures are per host and collected in the sweep report.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fleet_core::HostInitConfig;
use fleetgrid_cloud::{CloudError, CloudProvider, CostCalculator, InstanceState, ProviderSelector};
use fleetgrid_state::{Host, HostId, HostStatus, SYSTEM_USER, StateStore};

use crate::error::{LifecycleError, LifecycleResult};
use crate::lifecycle::HostLifecycle;

/// What a readiness check found.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    /// Active, resolvable and reachable over SSH.
    Ready { dns_name: String },
    NotReady,
    /// The provider reports the instance gone or broken.
    Failed(InstanceState),
    /// Not ready and past the readiness cutoff.
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostFailure {
    pub host_id: HostId,
    pub error: String,
}

/// Hosts touched by a sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub started: Vec<HostId>,
    pub running: Vec<HostId>,
    pub provision_failed: Vec<HostId>,
    pub terminated: Vec<HostId>,
    pub failures: Vec<HostFailure>,
}

impl SweepReport {
    fn fail(&mut self, host_id: &str, error: impl fmt::Display) {
        self.failures.push(HostFailure {
            host_id: host_id.to_string(),
            error: error.to_string(),
        });
    }

    pub fn merge(&mut self, other: SweepReport) {
        self.started.extend(other.started);
        self.running.extend(other.running);
        self.provision_failed.extend(other.provision_failed);
        self.terminated.extend(other.terminated);
        self.failures.extend(other.failures);
    }
}

enum SetupOutcome {
    Waiting,
    Running,
    ProvisionFailed,
    Terminated,
}

fn older_than(now: DateTime<Utc>, t: DateTime<Utc>, cutoff: Duration) -> bool {
    (now - t).to_std().is_ok_and(|age| age > cutoff)
}

/// Why `host` should be terminated now, if it should.
pub fn termination_reason(
    host: &Host,
    now: DateTime<Utc>,
    config: &HostInitConfig,
) -> Option<&'static str> {
    if !host.provider.is_spawnable()
        || matches!(host.status, HostStatus::Terminated | HostStatus::Quarantined)
    {
        return None;
    }
    if host.started_by != SYSTEM_USER && host.expiration_time.is_some_and(|t| t <= now) {
        return Some("spawn host lease expired");
    }
    match host.status {
        HostStatus::ProvisionFailed => return Some("provisioning failed"),
        HostStatus::Decommissioned if host.running_task.is_none() => {
            return Some("decommissioned with no running task");
        }
        HostStatus::Unreachable
            if !host.needs_new_agent
                && older_than(
                    now,
                    host.last_communication.unwrap_or(host.creation_time),
                    config.unreachable_cutoff(),
                ) =>
        {
            return Some("unreachable past cutoff");
        }
        _ => {}
    }
    if !host.provisioned
        && host.started_by == SYSTEM_USER
        && older_than(now, host.creation_time, config.provisioning_cutoff())
    {
        return Some("provisioning cutoff exceeded");
    }
    None
}

pub struct HostInit {
    store: StateStore,
    provider: Arc<dyn CloudProvider>,
    selector: ProviderSelector,
    lifecycle: HostLifecycle,
    costs: Option<CostCalculator>,
    config: HostInitConfig,
}

impl HostInit {
    pub fn new(
        store: StateStore,
        provider: Arc<dyn CloudProvider>,
        selector: ProviderSelector,
        config: HostInitConfig,
    ) -> Self {
        Self {
            lifecycle: HostLifecycle::new(store.clone()),
            store,
            provider,
            selector,
            costs: None,
            config,
        }
    }

    /// Record each terminated host's compute cost.
    pub fn with_costs(mut self, costs: CostCalculator) -> Self {
        self.costs = Some(costs);
        self
    }

    pub fn lifecycle(&self) -> &HostLifecycle {
        &self.lifecycle
    }

    // ── Start ──────────────────────────────────────────────────────

    /// Launch every uninitialized intent of a spawnable provider.
    pub async fn start_hosts(&self, cancel: &watch::Receiver<bool>) -> LifecycleResult<SweepReport> {
        let intents = self.store.find_hosts(|h| {
            h.status == HostStatus::Uninitialized && h.is_intent() && h.provider.is_spawnable()
        })?;
        let mut report = SweepReport::default();
        for mut host in intents {
            if *cancel.borrow() {
                return Err(LifecycleError::Canceled);
            }
            match self.start_host(&mut host).await {
                Ok(()) => report.started.push(host.id),
                Err(e) => {
                    warn!(host_id = %host.id, distro = %host.distro_id, error = %e, "failed to start host");
                    report.fail(&host.id, e);
                }
            }
        }
        if !report.started.is_empty() {
            info!(count = report.started.len(), "hosts started");
        }
        Ok(report)
    }

    async fn start_host(&self, host: &mut Host) -> LifecycleResult<()> {
        let distro = self
            .store
            .get_distro(&host.distro_id)?
            .ok_or_else(|| LifecycleError::DistroNotFound(host.distro_id.clone()))?;
        let options = self.selector.select(&distro, host).await?;
        let spawned = self.provider.spawn_host(&distro, host, &options).await?;

        if let Err(e) = self.lifecycle.mark_started(host, &spawned, Utc::now()) {
            // The intent is gone or moved on; the instance has no owner.
            if let Some(external_id) = spawned.external_id.as_deref() {
                if let Err(te) = self.provider.terminate_instance(external_id).await {
                    error!(host_id = %host.id, %external_id, error = %te, "failed to terminate orphaned instance");
                }
            }
            return Err(e);
        }
        info!(
            host_id = %host.id,
            distro = %host.distro_id,
            external_id = host.external_id.as_deref().unwrap_or_default(),
            market = ?options.market,
            "host starting"
        );
        Ok(())
    }

    // ── Readiness ──────────────────────────────────────────────────

    /// Ask the provider whether `host` is ready for provisioning.
    pub async fn is_host_ready(&self, host: &Host, now: DateTime<Utc>) -> LifecycleResult<Readiness> {
        let external_id = host
            .external_id
            .as_deref()
            .ok_or_else(|| CloudError::NotSpawned(host.id.clone()))?;
        let snapshot = match self.provider.describe_instance(external_id).await {
            Ok(s) => s,
            Err(CloudError::InstanceNotFound(_)) => {
                return Ok(Readiness::Failed(InstanceState::Terminated));
            }
            Err(e) => return Err(e.into()),
        };

        if snapshot.state.is_failed() {
            return Ok(Readiness::Failed(snapshot.state));
        }
        if snapshot.state == InstanceState::Running && snapshot.ssh_reachable {
            if let Some(dns_name) = snapshot.dns_name.filter(|d| !d.is_empty()) {
                return Ok(Readiness::Ready { dns_name });
            }
        }
        let waiting_since = host.start_time.unwrap_or(host.creation_time);
        if older_than(now, waiting_since, self.config.readiness_cutoff()) {
            return Ok(Readiness::TimedOut);
        }
        Ok(Readiness::NotReady)
    }

    /// Readiness sweep over `starting` and `initializing` hosts.
    pub async fn setup_ready_hosts(&self, cancel: &watch::Receiver<bool>) -> LifecycleResult<SweepReport> {
        let hosts = self.store.find_hosts(|h| {
            matches!(h.status, HostStatus::Starting | HostStatus::Initializing)
                && h.provider.is_spawnable()
        })?;
        let mut report = SweepReport::default();
        for mut host in hosts {
            if *cancel.borrow() {
                return Err(LifecycleError::Canceled);
            }
            match self.setup_host(&mut host).await {
                Ok(SetupOutcome::Waiting) => {}
                Ok(SetupOutcome::Running) => report.running.push(host.id),
                Ok(SetupOutcome::ProvisionFailed) => report.provision_failed.push(host.id),
                Ok(SetupOutcome::Terminated) => report.terminated.push(host.id),
                Err(e) => {
                    warn!(host_id = %host.id, error = %e, "host setup failed");
                    report.fail(&host.id, e);
                }
            }
        }
        Ok(report)
    }

    async fn setup_host(&self, host: &mut Host) -> LifecycleResult<SetupOutcome> {
        match self.is_host_ready(host, Utc::now()).await? {
            Readiness::NotReady => {
                debug!(host_id = %host.id, "host not ready yet");
                Ok(SetupOutcome::Waiting)
            }
            Readiness::Failed(state) => {
                warn!(host_id = %host.id, ?state, "provider reports host failed");
                self.terminate_host(host, "provider reported failure").await?;
                Ok(SetupOutcome::Terminated)
            }
            Readiness::TimedOut => {
                warn!(host_id = %host.id, "host not ready within cutoff");
                self.terminate_host(host, "readiness cutoff exceeded").await?;
                Ok(SetupOutcome::Terminated)
            }
            Readiness::Ready { dns_name } => {
                if host.status == HostStatus::Starting {
                    self.lifecycle.mark_initializing(host, &dns_name)?;
                }
                match self.provider.on_up(host).await {
                    Ok(()) => {
                        self.lifecycle.mark_running(host, Utc::now())?;
                        Ok(SetupOutcome::Running)
                    }
                    Err(e) => {
                        error!(host_id = %host.id, error = %e, "provisioning hook failed");
                        self.lifecycle.mark_provision_failed(host)?;
                        Ok(SetupOutcome::ProvisionFailed)
                    }
                }
            }
        }
    }

    // ── Termination ────────────────────────────────────────────────

    /// Termination sweep over every host matching a termination rule.
    pub async fn terminate_hosts(&self, cancel: &watch::Receiver<bool>) -> LifecycleResult<SweepReport> {
        let now = Utc::now();
        let candidates = self
            .store
            .find_hosts(|h| termination_reason(h, now, &self.config).is_some())?;
        let mut report = SweepReport::default();
        for mut host in candidates {
            if *cancel.borrow() {
                return Err(LifecycleError::Canceled);
            }
            let Some(reason) = termination_reason(&host, now, &self.config) else {
                continue;
            };
            match self.terminate_host(&mut host, reason).await {
                Ok(()) => report.terminated.push(host.id),
                Err(e) => {
                    warn!(host_id = %host.id, %reason, error = %e, "failed to terminate host");
                    report.fail(&host.id, e);
                }
            }
        }
        Ok(report)
    }

    /// Destroy the host's instance, if any, and mark it terminated.
    pub async fn terminate_host(&self, host: &mut Host, reason: &str) -> LifecycleResult<()> {
        if host.status == HostStatus::Terminated {
            return Err(LifecycleError::AlreadyTerminated(host.id.clone()));
        }
        let now = Utc::now();
        let cost = self.final_cost(host, now).await;

        if let Some(external_id) = host.external_id.as_deref() {
            match self.provider.terminate_instance(external_id).await {
                Ok(()) => {}
                Err(CloudError::InstanceNotFound(_)) => {
                    warn!(host_id = %host.id, %external_id, "instance already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.lifecycle.terminate(host, now, cost)?;
        info!(host_id = %host.id, distro = %host.distro_id, %reason, "host terminated");
        Ok(())
    }

    async fn final_cost(&self, host: &Host, now: DateTime<Utc>) -> Option<f64> {
        let costs = self.costs.as_ref()?;
        let start = host.start_time?;
        host.external_id.as_ref()?;
        let distro = match self.store.get_distro(&host.distro_id) {
            Ok(Some(d)) => d,
            Ok(None) => return None,
            Err(e) => {
                warn!(host_id = %host.id, error = %e, "failed to load distro for cost");
                return None;
            }
        };
        match costs.compute_cost(&distro, host, start, now).await {
            Ok(cost) => Some(cost),
            Err(e) => {
                warn!(host_id = %host.id, error = %e, "failed to compute host cost");
                None
            }
        }
    }

    // ── Loop ───────────────────────────────────────────────────────

    /// Start, setup and termination passes in order.
    pub async fn sweep(&self, cancel: &watch::Receiver<bool>) -> LifecycleResult<SweepReport> {
        let mut report = self.start_hosts(cancel).await?;
        report.merge(self.setup_ready_hosts(cancel).await?);
        report.merge(self.terminate_hosts(cancel).await?);
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "host init started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.sweep(&shutdown).await {
                        Ok(report) => debug!(
                            started = report.started.len(),
                            running = report.running.len(),
                            terminated = report.terminated.len(),
                            failures = report.failures.len(),
                            "host sweep complete"
                        ),
                        Err(e) => error!(error = %e, "host sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("host init shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_cloud::{Market, MockInstance, MockProvider, OsType, PriceCache, StaticCatalog};
    use fleetgrid_state::{Distro, DistroSettings, ProviderKind, ProviderMode};

    fn distro(mode: ProviderMode) -> Distro {
        Distro {
            id: "ubuntu".to_string(),
            arch: "linux_amd64".to_string(),
            provider: ProviderKind::Mock,
            provider_mode: mode,
            pool_size: 10,
            settings: DistroSettings {
                instance_type: "m5.large".to_string(),
                zone: "us-east-1a".to_string(),
                ..Default::default()
            },
        }
    }

    fn prices() -> Arc<PriceCache> {
        let catalog = StaticCatalog::new()
            .with_on_demand(OsType::Linux, "m5.large", "us-east-1", 0.5)
            .unwrap()
            .with_storage("us-east-1", 0.1);
        Arc::new(PriceCache::new(Arc::new(catalog)))
    }

    fn setup(mode: ProviderMode) -> (StateStore, Arc<MockProvider>, HostInit) {
        let store = StateStore::open_in_memory().unwrap();
        store.put_distro(&distro(mode)).unwrap();
        let mock = Arc::new(MockProvider::new());
        let provider: Arc<dyn CloudProvider> = mock.clone();
        let selector = ProviderSelector::new(provider.clone(), prices(), "us-east-1");
        let init = HostInit::new(store.clone(), provider.clone(), selector, HostInitConfig::default())
            .with_costs(CostCalculator::new(provider, prices(), "us-east-1"));
        (store, mock, init)
    }

    fn spawned_host(store: &StateStore, mock: &MockProvider, id: &str, status: HostStatus) -> Host {
        let external_id = format!("i-{id}");
        mock.insert_instance(&external_id, MockInstance::running(&external_id, Utc::now()));
        let mut host = Host::intent(id, &distro(ProviderMode::OnDemand), Utc::now());
        host.external_id = Some(external_id);
        host.status = status;
        host.start_time = Some(Utc::now());
        store.insert_host(&host).unwrap();
        host
    }

    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn start_moves_intents_to_starting() {
        let (store, mock, init) = setup(ProviderMode::OnDemand);
        let intent = Host::intent("h1", &distro(ProviderMode::OnDemand), Utc::now());
        store.insert_host(&intent).unwrap();

        let report = init.start_hosts(&no_cancel()).await.unwrap();
        assert_eq!(report.started, vec!["h1".to_string()]);

        let stored = store.get_host("h1").unwrap().unwrap();
        assert_eq!(stored.status, HostStatus::Starting);
        let external_id = stored.external_id.unwrap();
        assert_eq!(mock.instance(&external_id).unwrap().market, Market::OnDemand);
        assert!(stored.start_time.is_some());
    }

    #[tokio::test]
    async fn spot_distro_bids_on_demand_price() {
        let (store, mock, init) = setup(ProviderMode::Spot);
        store
            .insert_host(&Host::intent("h1", &distro(ProviderMode::Spot), Utc::now()))
            .unwrap();

        init.start_hosts(&no_cancel()).await.unwrap();
        let stored = store.get_host("h1").unwrap().unwrap();
        assert_eq!(stored.bid_price, Some(0.5));
        let instance = mock.instance(stored.external_id.as_deref().unwrap()).unwrap();
        assert_eq!(instance.market, Market::Spot { bid_price: 0.5 });
    }

    #[tokio::test]
    async fn failed_spawn_keeps_intent() {
        let (store, mock, init) = setup(ProviderMode::OnDemand);
        mock.fail_spawns(true);
        store
            .insert_host(&Host::intent("h1", &distro(ProviderMode::OnDemand), Utc::now()))
            .unwrap();

        let report = init.start_hosts(&no_cancel()).await.unwrap();
        assert!(report.started.is_empty());
        assert_eq!(report.failures.len(), 1);
        let stored = store.get_host("h1").unwrap().unwrap();
        assert_eq!(stored.status, HostStatus::Uninitialized);
        assert!(stored.is_intent());
    }

    #[tokio::test]
    async fn readiness_variants() {
        let (store, mock, init) = setup(ProviderMode::OnDemand);
        let host = spawned_host(&store, &mock, "h1", HostStatus::Starting);
        let now = Utc::now();

        assert!(matches!(
            init.is_host_ready(&host, now).await.unwrap(),
            Readiness::Ready { ref dns_name } if dns_name == "i-h1.mock.internal"
        ));

        mock.update_instance("i-h1", |i| i.ssh_reachable = false);
        assert_eq!(init.is_host_ready(&host, now).await.unwrap(), Readiness::NotReady);
        let later = now + chrono::Duration::hours(1);
        assert_eq!(init.is_host_ready(&host, later).await.unwrap(), Readiness::TimedOut);

        mock.update_instance("i-h1", |i| i.state = InstanceState::Failed);
        assert_eq!(
            init.is_host_ready(&host, now).await.unwrap(),
            Readiness::Failed(InstanceState::Failed)
        );

        let mut gone = host.clone();
        gone.external_id = Some("i-missing".to_string());
        assert_eq!(
            init.is_host_ready(&gone, now).await.unwrap(),
            Readiness::Failed(InstanceState::Terminated)
        );
    }

    #[tokio::test]
    async fn hook_failure_marks_provision_failed() {
        let (store, mock, init) = setup(ProviderMode::OnDemand);
        mock.fail_on_up(true);
        spawned_host(&store, &mock, "h1", HostStatus::Starting);

        let report = init.setup_ready_hosts(&no_cancel()).await.unwrap();
        assert_eq!(report.provision_failed, vec!["h1".to_string()]);
        assert_eq!(
            store.get_host("h1").unwrap().unwrap().status,
            HostStatus::ProvisionFailed
        );

        // The next termination sweep reaps it.
        let report = init.terminate_hosts(&no_cancel()).await.unwrap();
        assert_eq!(report.terminated, vec!["h1".to_string()]);
        assert_eq!(mock.terminated(), vec!["i-h1".to_string()]);
    }

    #[tokio::test]
    async fn termination_records_cost() {
        let (store, mock, init) = setup(ProviderMode::OnDemand);
        let mut host = spawned_host(&store, &mock, "h1", HostStatus::Decommissioned);
        host.start_time = Some(Utc::now() - chrono::Duration::hours(3));
        store.put_host(&host).unwrap();

        let report = init.terminate_hosts(&no_cancel()).await.unwrap();
        assert_eq!(report.terminated, vec!["h1".to_string()]);
        let stored = store.get_host("h1").unwrap().unwrap();
        assert_eq!(stored.status, HostStatus::Terminated);
        assert!((stored.total_cost - 1.5).abs() < 0.01, "cost {}", stored.total_cost);
    }

    #[tokio::test]
    async fn terminating_terminated_host_fails() {
        let (store, mock, init) = setup(ProviderMode::OnDemand);
        let mut host = spawned_host(&store, &mock, "h1", HostStatus::Running);
        init.terminate_host(&mut host, "test").await.unwrap();
        let err = init.terminate_host(&mut host, "test").await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyTerminated(_)));
        assert_eq!(mock.terminated().len(), 1);
    }

    #[tokio::test]
    async fn canceled_sweep_stops() {
        let (store, _mock, init) = setup(ProviderMode::OnDemand);
        store
            .insert_host(&Host::intent("h1", &distro(ProviderMode::OnDemand), Utc::now()))
            .unwrap();
        let (_tx, cancel) = watch::channel(true);
        let err = init.sweep(&cancel).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Canceled));
        assert_eq!(
            store.get_host("h1").unwrap().unwrap().status,
            HostStatus::Uninitialized
        );
    }

    fn rule_host(status: HostStatus) -> Host {
        let mut host = Host::intent("h", &distro(ProviderMode::OnDemand), Utc::now());
        host.status = status;
        host.provisioned = true;
        host
    }

    #[test]
    fn termination_rules() {
        let config = HostInitConfig::default();
        let now = Utc::now();

        let mut lease = rule_host(HostStatus::Running);
        lease.started_by = "alice".to_string();
        lease.expiration_time = Some(now - chrono::Duration::minutes(1));
        assert_eq!(termination_reason(&lease, now, &config), Some("spawn host lease expired"));
        lease.status = HostStatus::Quarantined;
        assert_eq!(termination_reason(&lease, now, &config), None);

        let mut decommissioned = rule_host(HostStatus::Decommissioned);
        assert!(termination_reason(&decommissioned, now, &config).is_some());
        decommissioned.running_task = Some("t1".to_string());
        assert_eq!(termination_reason(&decommissioned, now, &config), None);

        let mut unreachable = rule_host(HostStatus::Unreachable);
        unreachable.last_communication = Some(now - chrono::Duration::minutes(10));
        assert_eq!(termination_reason(&unreachable, now, &config), Some("unreachable past cutoff"));
        unreachable.needs_new_agent = true;
        assert_eq!(termination_reason(&unreachable, now, &config), None);
        unreachable.needs_new_agent = false;
        unreachable.last_communication = Some(now - chrono::Duration::minutes(1));
        assert_eq!(termination_reason(&unreachable, now, &config), None);

        let mut slow = rule_host(HostStatus::Starting);
        slow.provisioned = false;
        slow.creation_time = now - chrono::Duration::minutes(30);
        assert_eq!(
            termination_reason(&slow, now, &config),
            Some("provisioning cutoff exceeded")
        );

        let mut fixed = rule_host(HostStatus::ProvisionFailed);
        fixed.provider = ProviderKind::Static;
        assert_eq!(termination_reason(&fixed, now, &config), None);

        assert_eq!(termination_reason(&rule_host(HostStatus::Running), now, &config), None);
    }
}
