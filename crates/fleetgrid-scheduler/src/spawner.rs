//! Materializes allocation decisions as persisted host intents.

use std::collections::BTreeMap;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use fleetgrid_state::{DistroId, Host, HostId, StateError, StateStore};

use crate::error::{DistroFailure, SchedulerError, SchedulerResult};

#[derive(Debug, Default)]
pub struct SpawnOutcome {
    pub created: BTreeMap<DistroId, Vec<HostId>>,
    pub failures: Vec<DistroFailure>,
}

pub struct IntentSpawner {
    store: StateStore,
}

impl IntentSpawner {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Insert `needed[d]` intents for each distro `d`.
    ///
    /// Each insert re-checks the distro's live host count against its pool
    /// size. A missing distro or a failed insert stops that distro only.
    /// Cancellation is checked before every intent.
    pub fn spawn_intents(
        &self,
        needed: &BTreeMap<DistroId, u32>,
        cancel: &watch::Receiver<bool>,
    ) -> SchedulerResult<SpawnOutcome> {
        let mut outcome = SpawnOutcome::default();

        for (distro_id, &count) in needed {
            if count == 0 {
                continue;
            }
            let distro = match self.store.get_distro(distro_id) {
                Ok(Some(d)) => d,
                Ok(None) => {
                    let err = SchedulerError::DistroNotFound(distro_id.clone());
                    warn!(distro = %distro_id, "distro vanished before spawning");
                    outcome.failures.push(DistroFailure::new(distro_id.clone(), err));
                    continue;
                }
                Err(e) => {
                    warn!(distro = %distro_id, error = %e, "failed to load distro");
                    outcome.failures.push(DistroFailure::new(distro_id.clone(), e));
                    continue;
                }
            };

            let created = outcome.created.entry(distro_id.clone()).or_default();
            for _ in 0..count {
                if *cancel.borrow() {
                    return Err(SchedulerError::Canceled);
                }
                let intent = Host::intent(
                    format!("{}-{}", distro.id, Uuid::new_v4().simple()),
                    &distro,
                    Utc::now(),
                );
                match self.store.insert_intent(&intent, distro.pool_size) {
                    Ok(()) => created.push(intent.id),
                    Err(e @ StateError::PoolFull { .. }) => {
                        info!(distro = %distro_id, error = %e, "pool full, stopping intents");
                        break;
                    }
                    Err(e) => {
                        warn!(distro = %distro_id, error = %e, "failed to insert host intent");
                        outcome.failures.push(DistroFailure::new(distro_id.clone(), e));
                        break;
                    }
                }
            }
            if !created.is_empty() {
                info!(distro = %distro_id, count = created.len(), "host intents created");
            }
        }
        Ok(outcome)
    }
}
