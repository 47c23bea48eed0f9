//! Guarded host status transitions.
//!
//! ```text
//!  uninitialized ──▶ starting ──▶ initializing ──▶ running ◀──▶ unreachable
//!                       │              │              │
//!                       └──────┬───────┘              ├──▶ decommissioned
//!                              ▼                      └──▶ quarantined
//!                       provision_failed
//!
//!  any status except terminated ──▶ terminated
//! ```
//!
//! Every transition re-reads the stored host inside one write transaction
//! and checks the move against the stored status. The caller's copy is
//! replaced with the written record only after the write commits.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use fleetgrid_state::{Host, HostStatus, StateError, StateStore};

use crate::error::{LifecycleError, LifecycleResult};

/// Whether a host may move from `from` to `to`.
///
/// Decommissioned and quarantined are not sticky: an operator may move a
/// host between the two, or bring a quarantined host back to running.
/// Only terminated is final.
pub fn can_transition(from: HostStatus, to: HostStatus) -> bool {
    use HostStatus::*;
    match (from, to) {
        (Terminated, _) => false,
        (_, Uninitialized) => false,
        (Uninitialized, Starting) => true,
        (Starting, Initializing) => true,
        (Initializing | Running | Unreachable | Quarantined, Running) => true,
        (Starting | Initializing, ProvisionFailed) => true,
        (Running, Unreachable) => true,
        (_, Decommissioned | Quarantined) => from != Uninitialized,
        (_, Terminated) => true,
        _ => false,
    }
}

fn check(host: &Host, to: HostStatus) -> LifecycleResult<()> {
    if host.status == HostStatus::Terminated {
        return Err(LifecycleError::AlreadyTerminated(host.id.clone()));
    }
    if !can_transition(host.status, to) {
        return Err(LifecycleError::InvalidTransition {
            host: host.id.clone(),
            from: host.status,
            to,
        });
    }
    Ok(())
}

#[derive(Clone)]
pub struct HostLifecycle {
    store: StateStore,
}

impl HostLifecycle {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Move `host` to `to`, applying `update` to the stored record in the
    /// same write.
    fn apply<F>(&self, host: &mut Host, to: HostStatus, update: F) -> LifecycleResult<()>
    where
        F: FnOnce(&mut Host),
    {
        let mut refused: Option<LifecycleError> = None;
        let result = self.store.modify_host(&host.id, |stored| {
            if let Err(e) = check(stored, to) {
                let reason = e.to_string();
                refused = Some(e);
                return Err(StateError::Precondition(reason));
            }
            stored.status = to;
            update(stored);
            Ok(())
        });

        match result {
            Ok(written) => {
                debug!(host_id = %written.id, from = %host.status, %to, "host status changed");
                *host = written;
                Ok(())
            }
            Err(e) => Err(refused.unwrap_or(LifecycleError::State(e))),
        }
    }

    /// Change status with no other field updates.
    pub fn transition(&self, host: &mut Host, to: HostStatus) -> LifecycleResult<()> {
        self.apply(host, to, |_| {})
    }

    /// Record the provider identity of a freshly spawned intent and mark it
    /// `starting`.
    pub fn mark_started(&self, host: &mut Host, spawned: &Host, now: DateTime<Utc>) -> LifecycleResult<()> {
        self.apply(host, HostStatus::Starting, |stored| {
            stored.external_id = spawned.external_id.clone();
            stored.dns_name = spawned.dns_name.clone();
            stored.zone = spawned.zone.clone();
            stored.instance_type = spawned.instance_type.clone();
            stored.bid_price = spawned.bid_price;
            stored.subnet_id = spawned.subnet_id.clone();
            stored.start_time = Some(now);
        })
    }

    /// Mark a reachable host as initializing, recording its DNS name.
    pub fn mark_initializing(&self, host: &mut Host, dns_name: &str) -> LifecycleResult<()> {
        let dns_name = dns_name.to_string();
        self.apply(host, HostStatus::Initializing, move |stored| {
            stored.dns_name = Some(dns_name);
            stored.provision_attempts += 1;
        })
    }

    pub fn mark_running(&self, host: &mut Host, now: DateTime<Utc>) -> LifecycleResult<()> {
        self.apply(host, HostStatus::Running, |stored| {
            stored.provisioned = true;
            stored.provision_time = Some(now);
            stored.last_communication = Some(now);
        })?;
        info!(host_id = %host.id, distro = %host.distro_id, "host running");
        Ok(())
    }

    pub fn mark_provision_failed(&self, host: &mut Host) -> LifecycleResult<()> {
        self.transition(host, HostStatus::ProvisionFailed)
    }

    /// Mark `host` terminated, recording its final cost when known.
    pub fn terminate(
        &self,
        host: &mut Host,
        now: DateTime<Utc>,
        total_cost: Option<f64>,
    ) -> LifecycleResult<()> {
        self.apply(host, HostStatus::Terminated, |stored| {
            stored.termination_time = Some(now);
            if let Some(cost) = total_cost {
                stored.total_cost = cost;
            }
        })
    }
}
