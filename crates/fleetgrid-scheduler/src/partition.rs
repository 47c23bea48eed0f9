//! Distro task partitioner: splits runnable tasks into per-distro lists.
//!
//! Eligible distros come from the project configuration of the task's
//! version: the build variant's entry for the task (directly, or through
//! the task group containing it) may name distros; otherwise the variant's
//! `run_on` distros apply. A task that cannot be resolved is skipped and
//! logged without affecting any other task.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fleetgrid_state::{DistroId, StateStore, Task, TaskId};

use crate::error::{SchedulerError, SchedulerResult};

// ── Project model ──────────────────────────────────────────────────

/// The parts of a project configuration the partitioner reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub build_variants: Vec<BuildVariant>,
    #[serde(default)]
    pub task_groups: Vec<TaskGroup>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildVariant {
    pub name: String,
    #[serde(default)]
    pub run_on: Vec<DistroId>,
    #[serde(default)]
    pub tasks: Vec<VariantTask>,
}

/// A task or task group listed under a build variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariantTask {
    pub name: String,
    #[serde(default)]
    pub distros: Vec<DistroId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<String>,
}

impl ProjectConfig {
    pub fn from_json(config: &str) -> serde_json::Result<Self> {
        serde_json::from_str(config)
    }

    pub fn variant(&self, name: &str) -> Option<&BuildVariant> {
        self.build_variants.iter().find(|bv| bv.name == name)
    }

    /// Distros `task_name` may run on under `variant`, without duplicates.
    ///
    /// `None` when the variant lists neither the task nor a task group
    /// containing it.
    pub fn distros_for(&self, variant: &BuildVariant, task_name: &str) -> Option<Vec<DistroId>> {
        let entry = variant
            .tasks
            .iter()
            .find(|vt| vt.name == task_name)
            .or_else(|| {
                variant.tasks.iter().find(|vt| {
                    self.task_groups
                        .iter()
                        .any(|g| g.name == vt.name && g.tasks.iter().any(|t| t == task_name))
                })
            })?;

        let chosen = if entry.distros.is_empty() {
            &variant.run_on
        } else {
            &entry.distros
        };
        let mut distros: Vec<DistroId> = Vec::with_capacity(chosen.len());
        for d in chosen {
            if !distros.contains(d) {
                distros.push(d.clone());
            }
        }
        Some(distros)
    }
}

/// Loads the project configuration of a version.
pub trait ProjectResolver: Send + Sync {
    fn project(&self, version_id: &str) -> SchedulerResult<Arc<ProjectConfig>>;
}

/// Reads the configuration stored on the `Version` record.
pub struct StoreProjectResolver {
    store: StateStore,
}

impl StoreProjectResolver {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

impl ProjectResolver for StoreProjectResolver {
    fn project(&self, version_id: &str) -> SchedulerResult<Arc<ProjectConfig>> {
        let version = self
            .store
            .get_version(version_id)?
            .ok_or_else(|| SchedulerError::project(version_id, "version not found"))?;
        let config = ProjectConfig::from_json(&version.config)
            .map_err(|e| SchedulerError::project(version_id, e))?;
        Ok(Arc::new(config))
    }
}

// ── Partitioning ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedTask {
    pub task_id: TaskId,
    pub reason: String,
}

/// Runnable tasks split by distro.
#[derive(Debug, Default)]
pub struct Partition {
    pub by_distro: BTreeMap<DistroId, Vec<Task>>,
    /// Tasks eligible on more than one distro, with those distros.
    pub multi_distro: HashMap<TaskId, Vec<DistroId>>,
    pub skipped: Vec<SkippedTask>,
}

impl Partition {
    pub fn task_count(&self, distro_id: &str) -> usize {
        self.by_distro.get(distro_id).map_or(0, Vec::len)
    }
}

/// Split `tasks` across the distros they may run on.
///
/// A task with no distro yet is backfilled with its first eligible
/// distro. A failed backfill is logged and the task is still queued.
pub fn partition_tasks(
    tasks: Vec<Task>,
    resolver: &dyn ProjectResolver,
    store: &StateStore,
) -> Partition {
    let mut partition = Partition::default();
    let mut projects: HashMap<String, Result<Arc<ProjectConfig>, String>> = HashMap::new();

    for mut task in tasks {
        let project = projects
            .entry(task.version.clone())
            .or_insert_with(|| resolver.project(&task.version).map_err(|e| e.to_string()));

        let distros = match project {
            Ok(project) => match project.variant(&task.build_variant) {
                Some(variant) => match project.distros_for(variant, &task.display_name) {
                    Some(d) if !d.is_empty() => Ok(d),
                    Some(_) => Err("no distros for task".to_string()),
                    None => Err("task not listed in build variant".to_string()),
                },
                None => Err(format!("build variant {} not defined", task.build_variant)),
            },
            Err(e) => Err(e.clone()),
        };

        let distros = match distros {
            Ok(d) => d,
            Err(reason) => {
                info!(
                    task_id = %task.id,
                    version = %task.version,
                    variant = %task.build_variant,
                    %reason,
                    "skipping task"
                );
                partition.skipped.push(SkippedTask {
                    task_id: task.id.clone(),
                    reason,
                });
                continue;
            }
        };

        if task.distro_id.is_none() {
            match store.set_task_distro(&task.id, &distros[0]) {
                Ok(_) => task.distro_id = Some(distros[0].clone()),
                Err(e) => warn!(
                    task_id = %task.id,
                    distro = %distros[0],
                    error = %e,
                    "failed to backfill task distro"
                ),
            }
        }

        if distros.len() > 1 {
            partition.multi_distro.insert(task.id.clone(), distros.clone());
        }
        for d in &distros {
            partition
                .by_distro
                .entry(d.clone())
                .or_default()
                .push(task.clone());
        }
    }

    debug!(
        distros = partition.by_distro.len(),
        multi_distro = partition.multi_distro.len(),
        skipped = partition.skipped.len(),
        "tasks partitioned"
    );
    partition
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleetgrid_state::{TaskStatus, Version};

    const CONFIG: &str = r#"{
        "build_variants": [
            {
                "name": "linux",
                "run_on": ["ubuntu", "ubuntu", "rhel"],
                "tasks": [
                    {"name": "compile"},
                    {"name": "lint", "distros": ["small"]},
                    {"name": "integration", "distros": ["large", "large"]}
                ]
            }
        ],
        "task_groups": [
            {"name": "integration", "tasks": ["db_tests", "api_tests"]}
        ]
    }"#;

    fn task(id: &str, name: &str, version: &str) -> Task {
        Task {
            id: id.to_string(),
            display_name: name.to_string(),
            project: "proj".to_string(),
            version: version.to_string(),
            build_variant: "linux".to_string(),
            distro_id: None,
            priority: 0,
            expected_duration: None,
            depends_on: vec![],
            status: TaskStatus::Unscheduled,
            activated: true,
            create_time: Utc::now(),
            scheduled_time: None,
        }
    }

    fn store_with_versions() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_version(&Version {
                id: "v1".to_string(),
                project: "proj".to_string(),
                config: CONFIG.to_string(),
            })
            .unwrap();
        store
            .put_version(&Version {
                id: "broken".to_string(),
                project: "proj".to_string(),
                config: "{ not json".to_string(),
            })
            .unwrap();
        store
    }

    fn run(store: &StateStore, tasks: Vec<Task>) -> Partition {
        for t in &tasks {
            store.put_task(t).unwrap();
        }
        let resolver = StoreProjectResolver::new(store.clone());
        partition_tasks(tasks, &resolver, store)
    }

    fn ids(partition: &Partition, distro: &str) -> Vec<String> {
        partition
            .by_distro
            .get(distro)
            .map(|ts| ts.iter().map(|t| t.id.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn falls_back_to_run_on_without_duplicates() {
        let store = store_with_versions();
        let p = run(&store, vec![task("t1", "compile", "v1")]);
        assert_eq!(ids(&p, "ubuntu"), vec!["t1"]);
        assert_eq!(ids(&p, "rhel"), vec!["t1"]);
        assert_eq!(
            p.multi_distro.get("t1"),
            Some(&vec!["ubuntu".to_string(), "rhel".to_string()])
        );
    }

    #[test]
    fn task_level_distros_override_run_on() {
        let store = store_with_versions();
        let p = run(&store, vec![task("t1", "lint", "v1")]);
        assert_eq!(ids(&p, "small"), vec!["t1"]);
        assert!(ids(&p, "ubuntu").is_empty());
        assert!(p.multi_distro.is_empty());
    }

    #[test]
    fn task_group_distros_apply_to_members() {
        let store = store_with_versions();
        let p = run(&store, vec![task("t1", "db_tests", "v1")]);
        assert_eq!(ids(&p, "large"), vec!["t1"]);
        assert_eq!(p.by_distro.len(), 1);
    }

    #[test]
    fn unresolvable_tasks_are_skipped_in_isolation() {
        let store = store_with_versions();
        let p = run(
            &store,
            vec![
                task("bad-version", "compile", "broken"),
                task("missing-version", "compile", "v404"),
                task("unlisted", "docs", "v1"),
                task("ok", "compile", "v1"),
            ],
        );
        let skipped: Vec<&str> = p.skipped.iter().map(|s| s.task_id.as_str()).collect();
        assert_eq!(skipped, vec!["bad-version", "missing-version", "unlisted"]);
        assert_eq!(ids(&p, "ubuntu"), vec!["ok"]);
        // Skipped tasks are not backfilled.
        assert_eq!(store.get_task("unlisted").unwrap().unwrap().distro_id, None);
    }

    #[test]
    fn backfills_first_eligible_distro_only_when_unset() {
        let store = store_with_versions();
        let mut pinned = task("t2", "compile", "v1");
        pinned.distro_id = Some("rhel".to_string());
        let p = run(&store, vec![task("t1", "compile", "v1"), pinned]);

        assert_eq!(
            store.get_task("t1").unwrap().unwrap().distro_id.as_deref(),
            Some("ubuntu")
        );
        assert_eq!(
            store.get_task("t2").unwrap().unwrap().distro_id.as_deref(),
            Some("rhel")
        );
        assert_eq!(p.by_distro["ubuntu"][0].distro_id.as_deref(), Some("ubuntu"));
    }

    #[test]
    fn failed_backfill_still_queues_task() {
        let store = store_with_versions();
        // Never stored, so the backfill write fails.
        let resolver = StoreProjectResolver::new(store.clone());
        let p = partition_tasks(vec![task("ghost", "compile", "v1")], &resolver, &store);
        assert_eq!(ids(&p, "ubuntu"), vec!["ghost"]);
        assert_eq!(p.by_distro["ubuntu"][0].distro_id, None);
    }

    #[test]
    fn every_task_lands_on_exactly_its_eligible_distros() {
        let store = store_with_versions();
        let tasks = vec![
            task("a", "compile", "v1"),
            task("b", "lint", "v1"),
            task("c", "api_tests", "v1"),
            task("d", "docs", "v1"),
        ];
        let p = run(&store, tasks);
        let placements: BTreeMap<&str, Vec<&str>> = p
            .by_distro
            .iter()
            .map(|(d, ts)| (d.as_str(), ts.iter().map(|t| t.id.as_str()).collect()))
            .collect();
        assert_eq!(placements["ubuntu"], vec!["a"]);
        assert_eq!(placements["rhel"], vec!["a"]);
        assert_eq!(placements["small"], vec!["b"]);
        assert_eq!(placements["large"], vec!["c"]);
        assert_eq!(placements.len(), 4);
    }
}
