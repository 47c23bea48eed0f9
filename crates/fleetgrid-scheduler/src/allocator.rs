//! Host allocator: how many new hosts each distro needs this cycle.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::debug;

use fleetgrid_state::{Distro, DistroId, Host, TaskId, TaskQueue};

use crate::error::SchedulerResult;

/// Everything an allocation strategy may look at.
#[derive(Debug, Default)]
pub struct HostAllocatorData {
    /// Up hosts (intents included) per distro.
    pub existing_hosts: HashMap<DistroId, Vec<Host>>,
    pub distros: BTreeMap<DistroId, Distro>,
    /// This run's persisted queues; items carry expected durations.
    pub task_queues: BTreeMap<DistroId, TaskQueue>,
    /// Tasks queued on more than one distro, with those distros.
    pub multi_distro_tasks: HashMap<TaskId, Vec<DistroId>>,
}

impl HostAllocatorData {
    pub fn running(&self, distro_id: &str) -> u32 {
        self.existing_hosts
            .get(distro_id)
            .map_or(0, |hosts| hosts.len() as u32)
    }

    /// The one distro whose demand a multi-distro task counts toward: the
    /// smallest known distro id it is eligible for that can spawn hosts.
    pub fn demand_owner(&self, task_id: &str) -> Option<&str> {
        self.multi_distro_tasks.get(task_id).and_then(|distros| {
            distros
                .iter()
                .filter(|d| {
                    self.distros
                        .get(d.as_str())
                        .is_some_and(|distro| distro.provider.is_spawnable())
                })
                .min()
                .map(String::as_str)
        })
    }
}

/// Decides per-distro host counts.
pub trait HostAllocationStrategy: Send + Sync {
    /// New hosts to create per distro. Every known distro gets an entry.
    fn new_hosts_needed(&self, data: &HostAllocatorData) -> SchedulerResult<BTreeMap<DistroId, u32>>;
}

/// Sizes each distro so its queue drains in about `target_makespan`.
///
/// `needed = ceil(total_expected_duration / target_makespan)`, at least
/// one for a non-empty queue and never more than the number of tasks,
/// minus hosts already up, clamped to the free pool slots.
pub struct DurationBasedHostAllocator {
    target_makespan: Duration,
}

impl DurationBasedHostAllocator {
    pub fn new(target_makespan: Duration) -> Self {
        Self {
            target_makespan: target_makespan.max(Duration::from_secs(1)),
        }
    }

    fn hosts_for_distro(&self, distro: &Distro, data: &HostAllocatorData) -> u32 {
        if !distro.provider.is_spawnable() {
            return 0;
        }
        let running = data.running(&distro.id);
        let free = distro.pool_size.saturating_sub(running);
        let Some(queue) = data.task_queues.get(&distro.id) else {
            return 0;
        };

        let (count, total) = queue
            .items
            .iter()
            .filter(|item| {
                data.demand_owner(&item.task_id)
                    .is_none_or(|owner| owner == distro.id)
            })
            .fold((0u32, Duration::ZERO), |(n, sum), item| {
                (n + 1, sum + item.expected_duration)
            });
        if count == 0 {
            return 0;
        }

        let ideal = total.as_secs_f64() / self.target_makespan.as_secs_f64();
        let wanted = (ideal.ceil() as u32).clamp(1, count);
        let new = wanted.saturating_sub(running).min(free);
        debug!(
            distro = %distro.id,
            tasks = count,
            total_secs = total.as_secs(),
            running,
            wanted,
            new,
            "host allocation"
        );
        new
    }
}

impl HostAllocationStrategy for DurationBasedHostAllocator {
    fn new_hosts_needed(&self, data: &HostAllocatorData) -> SchedulerResult<BTreeMap<DistroId, u32>> {
        Ok(data
            .distros
            .values()
            .map(|d| (d.id.clone(), self.hosts_for_distro(d, data)))
            .collect())
    }
}
