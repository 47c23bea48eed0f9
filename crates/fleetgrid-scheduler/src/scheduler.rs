//! Scheduler: one scheduling run from runnable tasks to host intents.
//!
//! A run:
//! 1. removes stale host intents
//! 2. finds runnable tasks and partitions them by distro
//! 3. builds and persists every distro's queue in the worker pool
//! 4. sizes each distro with the allocation strategy
//! 5. persists the resulting host intents
//!
//! Per-distro failures are collected into the report; only cancellation
//! or a store failure outside any one distro aborts the run.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleet_core::SchedulerConfig;
use fleetgrid_state::{DistroId, HostId, StateStore};

use crate::allocator::{DurationBasedHostAllocator, HostAllocationStrategy, HostAllocatorData};
use crate::durations::TaskDurations;
use crate::error::{DistroFailure, SchedulerError, SchedulerResult};
use crate::partition::{ProjectResolver, SkippedTask, StoreProjectResolver, partition_tasks};
use crate::persister::{QueuePersister, StoreQueuePersister};
use crate::pool::{DistroQueuePool, DistroWorkUnit};
use crate::prioritizer::{CmpBasedTaskPrioritizer, TaskPrioritizer};
use crate::spawner::IntentSpawner;

/// Per-distro results of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DistroReport {
    pub queue_length: usize,
    pub expected_duration: Duration,
    /// Up hosts (intents included) before this run's intents.
    pub hosts_running: usize,
    pub hosts_needed: u32,
    pub intents_created: Vec<HostId>,
}

/// What a scheduling run did.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stale_intents_removed: usize,
    pub runnable_tasks: usize,
    pub skipped_tasks: Vec<SkippedTask>,
    pub distros: BTreeMap<DistroId, DistroReport>,
    pub failures: Vec<DistroFailure>,
}

impl ScheduleReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total_queue_size(&self) -> usize {
        self.distros.values().map(|d| d.queue_length).sum()
    }

    pub fn total_intents(&self) -> usize {
        self.distros.values().map(|d| d.intents_created.len()).sum()
    }

    /// The report, or the aggregated failures as an error.
    pub fn into_result(self) -> SchedulerResult<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(SchedulerError::Distros(self.failures))
        }
    }
}

pub struct Scheduler {
    store: StateStore,
    config: SchedulerConfig,
    resolver: Arc<dyn ProjectResolver>,
    prioritizer: Arc<dyn TaskPrioritizer>,
    persister: Arc<dyn QueuePersister>,
    allocator: Arc<dyn HostAllocationStrategy>,
}

impl Scheduler {
    /// A scheduler with the store-backed resolver and persister, the
    /// comparator prioritizer and the duration-based allocator.
    pub fn new(store: StateStore, config: SchedulerConfig) -> Self {
        Self {
            resolver: Arc::new(StoreProjectResolver::new(store.clone())),
            prioritizer: Arc::new(CmpBasedTaskPrioritizer::default()),
            persister: Arc::new(StoreQueuePersister::new(store.clone())),
            allocator: Arc::new(DurationBasedHostAllocator::new(config.target_makespan())),
            store,
            config,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ProjectResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_prioritizer(mut self, prioritizer: Arc<dyn TaskPrioritizer>) -> Self {
        self.prioritizer = prioritizer;
        self
    }

    pub fn with_persister(mut self, persister: Arc<dyn QueuePersister>) -> Self {
        self.persister = persister;
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn HostAllocationStrategy>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one scheduling pass.
    pub async fn schedule(&self, cancel: &watch::Receiver<bool>) -> SchedulerResult<ScheduleReport> {
        let started_at = Utc::now();

        let cutoff = started_at
            - chrono::Duration::from_std(self.config.stale_intent_cutoff())
                .unwrap_or_else(|_| chrono::Duration::minutes(3));
        let stale = self.store.remove_stale_intents(cutoff)?;

        let runnable = self.store.find_runnable_tasks()?;
        let runnable_count = runnable.len();
        info!(count = runnable_count, "found runnable tasks");

        let durations = Arc::new(TaskDurations::from_tasks(
            &runnable,
            self.config.default_task_duration(),
        ));
        let partition = partition_tasks(runnable, self.resolver.as_ref(), &self.store);

        let distros: BTreeMap<DistroId, _> = self
            .store
            .list_distros()?
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        for distro_id in partition.by_distro.keys() {
            if !distros.contains_key(distro_id) {
                warn!(distro = %distro_id, tasks = partition.task_count(distro_id), "tasks target unknown distro");
            }
        }

        let mut units = Vec::new();
        for distro_id in distros.keys() {
            match partition.by_distro.get(distro_id) {
                Some(tasks) if !tasks.is_empty() => units.push(DistroWorkUnit {
                    distro_id: distro_id.clone(),
                    tasks: tasks.clone(),
                }),
                _ => {
                    if self.store.delete_task_queue(distro_id)? {
                        debug!(distro = %distro_id, "cleared queue of idle distro");
                    }
                }
            }
        }

        let pool = DistroQueuePool::new(
            self.store.clone(),
            self.prioritizer.clone(),
            self.persister.clone(),
            self.config.worker_count(),
        );
        let pooled = pool.run(units, durations, cancel).await?;
        let mut failures = pooled.failures;
        info!(
            total_queue_size = pooled.queues.values().map(|q| q.len()).sum::<usize>(),
            "distro queues persisted"
        );

        let failed: HashSet<DistroId> = failures.iter().map(|f| f.distro.clone()).collect();
        let data = HostAllocatorData {
            existing_hosts: self.store.up_hosts_by_distro()?,
            distros: distros
                .into_iter()
                .filter(|(id, _)| !failed.contains(id))
                .collect(),
            task_queues: pooled.queues,
            multi_distro_tasks: partition.multi_distro,
        };
        let needed = self.allocator.new_hosts_needed(&data)?;

        let spawned = IntentSpawner::new(self.store.clone()).spawn_intents(&needed, cancel)?;
        failures.extend(spawned.failures);

        let mut reports: BTreeMap<DistroId, DistroReport> = BTreeMap::new();
        for (distro_id, hosts_needed) in &needed {
            let queue = data.task_queues.get(distro_id);
            reports.insert(
                distro_id.clone(),
                DistroReport {
                    queue_length: queue.map_or(0, |q| q.len()),
                    expected_duration: queue
                        .map_or(Duration::ZERO, |q| q.total_expected_duration()),
                    hosts_running: data.running(distro_id) as usize,
                    hosts_needed: *hosts_needed,
                    intents_created: spawned.created.get(distro_id).cloned().unwrap_or_default(),
                },
            );
        }

        let report = ScheduleReport {
            started_at,
            finished_at: Utc::now(),
            stale_intents_removed: stale.len(),
            runnable_tasks: runnable_count,
            skipped_tasks: partition.skipped,
            distros: reports,
            failures,
        };
        info!(
            distros = report.distros.len(),
            queued = report.total_queue_size(),
            intents = report.total_intents(),
            failures = report.failures.len(),
            "scheduling run complete"
        );
        Ok(report)
    }
}
