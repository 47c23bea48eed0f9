//! Task prioritization within one distro's queue.

use std::cmp::Ordering;
use std::collections::HashMap;

use fleetgrid_state::{Task, TaskId};

use crate::durations::TaskDurations;
use crate::error::SchedulerResult;

/// Orders a distro's runnable tasks, highest priority first.
///
/// Implementations must be deterministic: the same input set yields the
/// same order regardless of input order.
pub trait TaskPrioritizer: Send + Sync {
    fn prioritize(
        &self,
        distro_id: &str,
        tasks: Vec<Task>,
        durations: &TaskDurations,
    ) -> SchedulerResult<Vec<Task>>;
}

/// What comparators may consult besides the two tasks.
pub struct CmpContext<'a> {
    pub durations: &'a TaskDurations,
    /// Number of tasks in the same list depending on each task.
    pub dependents: HashMap<&'a str, usize>,
}

impl CmpContext<'_> {
    fn dependents_of(&self, task_id: &str) -> usize {
        self.dependents.get(task_id).copied().unwrap_or(0)
    }
}

/// Returns `Less` when `a` should run before `b`.
pub type TaskComparator = fn(&Task, &Task, &CmpContext<'_>) -> Ordering;

pub fn by_priority(a: &Task, b: &Task, _: &CmpContext<'_>) -> Ordering {
    b.priority.cmp(&a.priority)
}

pub fn by_dependents(a: &Task, b: &Task, ctx: &CmpContext<'_>) -> Ordering {
    ctx.dependents_of(&b.id).cmp(&ctx.dependents_of(&a.id))
}

pub fn by_expected_duration(a: &Task, b: &Task, ctx: &CmpContext<'_>) -> Ordering {
    ctx.durations.get(&b.id).cmp(&ctx.durations.get(&a.id))
}

pub fn by_create_time(a: &Task, b: &Task, _: &CmpContext<'_>) -> Ordering {
    a.create_time.cmp(&b.create_time)
}

/// Chains comparators; the first non-`Equal` answer wins and task id
/// breaks any remaining tie.
pub struct CmpBasedTaskPrioritizer {
    comparators: Vec<TaskComparator>,
}

impl Default for CmpBasedTaskPrioritizer {
    fn default() -> Self {
        Self {
            comparators: vec![
                by_priority,
                by_dependents,
                by_expected_duration,
                by_create_time,
            ],
        }
    }
}

impl CmpBasedTaskPrioritizer {
    pub fn with_comparators(comparators: Vec<TaskComparator>) -> Self {
        Self { comparators }
    }
}

impl TaskPrioritizer for CmpBasedTaskPrioritizer {
    fn prioritize(
        &self,
        _distro_id: &str,
        mut tasks: Vec<Task>,
        durations: &TaskDurations,
    ) -> SchedulerResult<Vec<Task>> {
        let mut order: Vec<usize> = (0..tasks.len()).collect();
        {
            let mut dependents: HashMap<&str, usize> = HashMap::new();
            for task in &tasks {
                for dep in &task.depends_on {
                    *dependents.entry(dep.as_str()).or_default() += 1;
                }
            }
            let ctx = CmpContext {
                durations,
                dependents,
            };
            order.sort_by(|&i, &j| {
                let (a, b) = (&tasks[i], &tasks[j]);
                self.comparators
                    .iter()
                    .map(|cmp| cmp(a, b, &ctx))
                    .find(|o| o.is_ne())
                    .unwrap_or_else(|| a.id.cmp(&b.id))
            });
        }

        let mut slots: Vec<Option<Task>> = tasks.drain(..).map(Some).collect();
        Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
    }
}

/// Ids in queue order.
pub fn task_ids(tasks: &[Task]) -> Vec<TaskId> {
    tasks.iter().map(|t| t.id.clone()).collect()
}
