//! Expected task durations for one scheduling run.

use std::collections::HashMap;
use std::time::Duration;

use fleetgrid_state::{Task, TaskId};

/// Per-task expected durations, with a default for tasks lacking an
/// estimate.
#[derive(Debug, Clone)]
pub struct TaskDurations {
    default: Duration,
    by_task: HashMap<TaskId, Duration>,
}

impl TaskDurations {
    pub fn from_tasks(tasks: &[Task], default: Duration) -> Self {
        let by_task = tasks
            .iter()
            .filter_map(|t| t.expected_duration.map(|d| (t.id.clone(), d)))
            .collect();
        Self { default, by_task }
    }

    pub fn get(&self, task_id: &str) -> Duration {
        self.by_task.get(task_id).copied().unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleetgrid_state::TaskStatus;

    #[test]
    fn unknown_and_unestimated_tasks_use_default() {
        let task = Task {
            id: "t1".to_string(),
            display_name: "compile".to_string(),
            project: "p".to_string(),
            version: "v".to_string(),
            build_variant: "bv".to_string(),
            distro_id: None,
            priority: 0,
            expected_duration: Some(Duration::from_secs(90)),
            depends_on: vec![],
            status: TaskStatus::Unscheduled,
            activated: true,
            create_time: Utc::now(),
            scheduled_time: None,
        };
        let mut other = task.clone();
        other.id = "t2".to_string();
        other.expected_duration = None;

        let durations = TaskDurations::from_tasks(&[task, other], Duration::from_secs(600));
        assert_eq!(durations.get("t1"), Duration::from_secs(90));
        assert_eq!(durations.get("t2"), Duration::from_secs(600));
        assert_eq!(durations.get("nope"), Duration::from_secs(600));
    }
}
