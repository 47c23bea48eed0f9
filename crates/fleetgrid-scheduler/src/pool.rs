//! Distro queue scheduler pool: builds every distro's queue concurrently.
//!
//! ```text
//!   units ──▶ [work channel, closed] ──▶ worker 1..N ──▶ [result channel] ──▶ aggregator
//!                                          │ prioritize                       │
//!                                          │ persist                          ▼
//!                                          │ stamp scheduled time        PoolOutcome
//! ```
//!
//! Workers share one receiver and run each unit on the blocking pool,
//! since store writes are synchronous. The result channel closes only
//! after every worker has been joined, and the aggregator is awaited
//! before its outcome is read.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info};

use fleetgrid_state::{DistroId, StateStore, Task, TaskId, TaskQueue};

use crate::durations::TaskDurations;
use crate::error::{DistroFailure, SchedulerError, SchedulerResult};
use crate::persister::QueuePersister;
use crate::prioritizer::{TaskPrioritizer, task_ids};

/// One distro's unordered runnable tasks.
#[derive(Debug, Clone)]
pub struct DistroWorkUnit {
    pub distro_id: DistroId,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Default)]
pub struct PoolOutcome {
    pub queues: BTreeMap<DistroId, TaskQueue>,
    pub failures: Vec<DistroFailure>,
}

struct UnitResult {
    distro_id: DistroId,
    outcome: SchedulerResult<TaskQueue>,
}

struct DistroQueueScheduler {
    prioritizer: Arc<dyn TaskPrioritizer>,
    persister: Arc<dyn QueuePersister>,
    store: StateStore,
    durations: Arc<TaskDurations>,
}

impl DistroQueueScheduler {
    fn schedule_distro(&self, unit: DistroWorkUnit) -> SchedulerResult<TaskQueue> {
        let prioritized = self
            .prioritizer
            .prioritize(&unit.distro_id, unit.tasks, &self.durations)?;
        let queue = self
            .persister
            .persist(&unit.distro_id, &prioritized, &self.durations)?;
        self.store
            .set_tasks_scheduled_time(&task_ids(&prioritized), Utc::now())?;
        info!(
            distro = %unit.distro_id,
            queue_size = queue.len(),
            expected_duration_secs = queue.total_expected_duration().as_secs(),
            "distro scheduled"
        );
        Ok(queue)
    }
}

/// Fixed-size worker pool over per-distro units.
pub struct DistroQueuePool {
    store: StateStore,
    prioritizer: Arc<dyn TaskPrioritizer>,
    persister: Arc<dyn QueuePersister>,
    workers: usize,
}

impl DistroQueuePool {
    pub fn new(
        store: StateStore,
        prioritizer: Arc<dyn TaskPrioritizer>,
        persister: Arc<dyn QueuePersister>,
        workers: usize,
    ) -> Self {
        Self {
            store,
            prioritizer,
            persister,
            workers: workers.max(1),
        }
    }

    /// Prioritize and persist every unit.
    ///
    /// A failed distro is recorded in the outcome and does not stop the
    /// others. Returns `Canceled` if cancellation is seen before fan-out
    /// or while units remain.
    pub async fn run(
        &self,
        units: Vec<DistroWorkUnit>,
        durations: Arc<TaskDurations>,
        cancel: &watch::Receiver<bool>,
    ) -> SchedulerResult<PoolOutcome> {
        if *cancel.borrow() {
            return Err(SchedulerError::Canceled);
        }

        let expected: HashMap<DistroId, Vec<TaskId>> = units
            .iter()
            .map(|u| (u.distro_id.clone(), task_ids(&u.tasks)))
            .collect();

        let (work_tx, work_rx) = mpsc::channel(units.len().max(1));
        for unit in units {
            work_tx
                .send(unit)
                .await
                .map_err(|e| SchedulerError::Worker(e.to_string()))?;
        }
        drop(work_tx);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let (result_tx, mut result_rx) = mpsc::channel::<UnitResult>(self.workers);
        let aggregator = tokio::spawn(async move {
            let mut outcome = PoolOutcome::default();
            while let Some(result) = result_rx.recv().await {
                match result.outcome {
                    Ok(queue) => {
                        outcome.queues.insert(result.distro_id, queue);
                    }
                    Err(e) => {
                        error!(distro = %result.distro_id, error = %e, "failed to schedule distro");
                        outcome.failures.push(DistroFailure::new(result.distro_id, e));
                    }
                }
            }
            outcome
        });

        let scheduler = Arc::new(DistroQueueScheduler {
            prioritizer: self.prioritizer.clone(),
            persister: self.persister.clone(),
            store: self.store.clone(),
            durations,
        });

        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if *cancel.borrow() {
                        debug!(worker, "cancellation observed, worker stopping");
                        break;
                    }
                    let unit = work_rx.lock().await.recv().await;
                    let Some(unit) = unit else { break };

                    let distro_id = unit.distro_id.clone();
                    let scheduler = scheduler.clone();
                    let outcome =
                        match tokio::task::spawn_blocking(move || scheduler.schedule_distro(unit))
                            .await
                        {
                            Ok(outcome) => outcome,
                            Err(e) => Err(SchedulerError::Worker(e.to_string())),
                        };
                    if result_tx.send(UnitResult { distro_id, outcome }).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "queue scheduler worker panicked");
            }
        }
        let outcome = aggregator
            .await
            .map_err(|e| SchedulerError::Worker(e.to_string()))?;

        if *cancel.borrow() {
            return Err(SchedulerError::Canceled);
        }

        for (distro_id, queue) in &outcome.queues {
            let Some(input) = expected.get(distro_id) else {
                continue;
            };
            if input.len() != queue.len() {
                let input: BTreeSet<&str> = input.iter().map(String::as_str).collect();
                let output: BTreeSet<&str> =
                    queue.items.iter().map(|i| i.task_id.as_str()).collect();
                let delta: Vec<&str> = input.symmetric_difference(&output).copied().collect();
                error!(
                    distro = %distro_id,
                    expected = input.len(),
                    persisted = queue.len(),
                    ?delta,
                    "inconsistency between scheduler input and persisted queue"
                );
            }
        }

        Ok(outcome)
    }
}
