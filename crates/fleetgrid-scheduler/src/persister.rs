//! Task queue persistence.

use chrono::Utc;

use fleetgrid_state::{StateStore, Task, TaskQueue, TaskQueueItem};

use crate::durations::TaskDurations;
use crate::error::SchedulerResult;

/// Saves a distro's ordered queue, replacing the previous one.
pub trait QueuePersister: Send + Sync {
    /// Persist `tasks` (already in queue order) and return what was saved.
    fn persist(
        &self,
        distro_id: &str,
        tasks: &[Task],
        durations: &TaskDurations,
    ) -> SchedulerResult<TaskQueue>;
}

pub struct StoreQueuePersister {
    store: StateStore,
}

impl StoreQueuePersister {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

/// Queue items for `tasks` in order, ranked from zero.
pub fn queue_items(tasks: &[Task], durations: &TaskDurations) -> Vec<TaskQueueItem> {
    tasks
        .iter()
        .enumerate()
        .map(|(rank, t)| TaskQueueItem {
            task_id: t.id.clone(),
            display_name: t.display_name.clone(),
            project: t.project.clone(),
            build_variant: t.build_variant.clone(),
            expected_duration: durations.get(&t.id),
            priority: t.priority,
            rank,
        })
        .collect()
}

impl QueuePersister for StoreQueuePersister {
    fn persist(
        &self,
        distro_id: &str,
        tasks: &[Task],
        durations: &TaskDurations,
    ) -> SchedulerResult<TaskQueue> {
        let queue = TaskQueue {
            distro_id: distro_id.to_string(),
            generated_at: Utc::now(),
            items: queue_items(tasks, durations),
        };
        self.store.replace_task_queue(&queue)?;
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::TaskStatus;
    use std::time::Duration;

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            display_name: format!("{id}-name"),
            project: "p".to_string(),
            version: "v".to_string(),
            build_variant: "bv".to_string(),
            distro_id: None,
            priority: 2,
            expected_duration: None,
            depends_on: vec![],
            status: TaskStatus::Unscheduled,
            activated: true,
            create_time: Utc::now(),
            scheduled_time: None,
        }
    }

    #[test]
    fn persist_replaces_previous_queue() {
        let store = StateStore::open_in_memory().unwrap();
        let persister = StoreQueuePersister::new(store.clone());
        let durations = TaskDurations::from_tasks(&[], Duration::from_secs(60));

        persister
            .persist("ubuntu", &[task("a"), task("b"), task("c")], &durations)
            .unwrap();
        let saved = persister
            .persist("ubuntu", &[task("d"), task("a")], &durations)
            .unwrap();

        let stored = store.get_task_queue("ubuntu").unwrap().unwrap();
        assert_eq!(stored, saved);
        let ids: Vec<&str> = stored.items.iter().map(|i| i.task_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "a"]);
        assert_eq!(stored.items[1].rank, 1);
        assert_eq!(stored.total_expected_duration(), Duration::from_secs(120));
    }
}
