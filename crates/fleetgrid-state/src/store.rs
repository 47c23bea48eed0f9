//! StateStore: redb-backed persistence for the Fleetgrid scheduling core.
//!
//! Provides typed operations over tasks, distros, versions, task queues
//! and hosts. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for def in [TASKS, DISTROS, VERSIONS, TASK_QUEUES, HOSTS] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON access ────────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn delete_key(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-check-write one record inside an already open write transaction.
    fn modify_in<T, F>(txn: &WriteTransaction, def: JsonTable, key: &str, f: F) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> StateResult<()>,
    {
        let mut table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut record: T = {
            let guard = table
                .get(key)
                .map_err(map_err!(Read))?
                .ok_or_else(|| StateError::NotFound(key.to_string()))?;
            serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
        };
        f(&mut record)?;
        let bytes = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
        table
            .insert(key, bytes.as_slice())
            .map_err(map_err!(Write))?;
        Ok(record)
    }

    /// Commit on success, abort on failure so a refused guard writes nothing.
    fn finish<T>(txn: WriteTransaction, result: StateResult<T>) -> StateResult<T> {
        match result {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    warn!(error = %abort_err, "failed to abort write transaction");
                }
                Err(e)
            }
        }
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Insert or update a task.
    pub fn put_task(&self, task: &Task) -> StateResult<()> {
        self.put_json(TASKS, &task.id, task)?;
        debug!(task_id = %task.id, "task stored");
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> StateResult<Option<Task>> {
        self.get_json(TASKS, task_id)
    }

    pub fn list_tasks(&self) -> StateResult<Vec<Task>> {
        self.list_json(TASKS)
    }

    /// Activated tasks waiting for a host whose dependencies have all finished.
    ///
    /// A dependency that is not in the store counts as unfinished.
    pub fn find_runnable_tasks(&self) -> StateResult<Vec<Task>> {
        let tasks = self.list_tasks()?;
        let finished: HashSet<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Finished)
            .map(|t| t.id.as_str())
            .collect();
        let runnable: Vec<Task> = tasks
            .iter()
            .filter(|t| t.activated && t.status.is_waiting())
            .filter(|t| t.depends_on.iter().all(|d| finished.contains(d.as_str())))
            .cloned()
            .collect();
        debug!(count = runnable.len(), "runnable tasks found");
        Ok(runnable)
    }

    /// Record the distro a task was first scheduled against.
    pub fn set_task_distro(&self, task_id: &str, distro_id: &str) -> StateResult<Task> {
        if task_id.is_empty() {
            return Err(StateError::Precondition("empty task id".to_string()));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = Self::modify_in(&txn, TASKS, task_id, |task: &mut Task| {
            task.distro_id = Some(distro_id.to_string());
            Ok(())
        });
        Self::finish(txn, result)
    }

    /// Stamp queued tasks as scheduled.
    ///
    /// The first scheduling time is kept on later runs. Ids missing from
    /// the store are skipped. Returns the number of tasks updated.
    pub fn set_tasks_scheduled_time(&self, task_ids: &[TaskId], at: DateTime<Utc>) -> StateResult<usize> {
        if task_ids.iter().any(|id| id.is_empty()) {
            return Err(StateError::Precondition("empty task id".to_string()));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = (|| -> StateResult<usize> {
            let mut updated = 0;
            for id in task_ids {
                let outcome = Self::modify_in(&txn, TASKS, id, |task: &mut Task| {
                    if task.scheduled_time.is_none() {
                        task.scheduled_time = Some(at);
                    }
                    if task.status == TaskStatus::Unscheduled {
                        task.status = TaskStatus::Scheduled;
                    }
                    Ok(())
                });
                match outcome {
                    Ok(_) => updated += 1,
                    Err(StateError::NotFound(_)) => warn!(task_id = %id, "scheduled task vanished"),
                    Err(e) => return Err(e),
                }
            }
            Ok(updated)
        })();
        Self::finish(txn, result)
    }

    // ── Distros ────────────────────────────────────────────────────

    pub fn put_distro(&self, distro: &Distro) -> StateResult<()> {
        self.put_json(DISTROS, &distro.id, distro)?;
        debug!(distro = %distro.id, "distro stored");
        Ok(())
    }

    pub fn get_distro(&self, distro_id: &str) -> StateResult<Option<Distro>> {
        self.get_json(DISTROS, distro_id)
    }

    pub fn list_distros(&self) -> StateResult<Vec<Distro>> {
        self.list_json(DISTROS)
    }

    // ── Versions ───────────────────────────────────────────────────

    pub fn put_version(&self, version: &Version) -> StateResult<()> {
        self.put_json(VERSIONS, &version.id, version)
    }

    pub fn get_version(&self, version_id: &str) -> StateResult<Option<Version>> {
        self.get_json(VERSIONS, version_id)
    }

    // ── Task queues ────────────────────────────────────────────────

    /// Replace the distro's queue with `queue`.
    pub fn replace_task_queue(&self, queue: &TaskQueue) -> StateResult<()> {
        self.put_json(TASK_QUEUES, &queue.distro_id, queue)?;
        debug!(distro = %queue.distro_id, len = queue.len(), "task queue replaced");
        Ok(())
    }

    pub fn get_task_queue(&self, distro_id: &str) -> StateResult<Option<TaskQueue>> {
        self.get_json(TASK_QUEUES, distro_id)
    }

    pub fn list_task_queues(&self) -> StateResult<Vec<TaskQueue>> {
        self.list_json(TASK_QUEUES)
    }

    pub fn delete_task_queue(&self, distro_id: &str) -> StateResult<bool> {
        self.delete_key(TASK_QUEUES, distro_id)
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Insert a new host. Fails if a host with the same id exists.
    pub fn insert_host(&self, host: &Host) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = Self::insert_host_in(&txn, host);
        Self::finish(txn, result)?;
        debug!(host_id = %host.id, distro = %host.distro_id, "host inserted");
        Ok(())
    }

    fn insert_host_in(txn: &WriteTransaction, host: &Host) -> StateResult<()> {
        let bytes = serde_json::to_vec(host).map_err(map_err!(Serialize))?;
        let mut table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
        if table.get(host.id.as_str()).map_err(map_err!(Read))?.is_some() {
            return Err(StateError::AlreadyExists(host.id.clone()));
        }
        table
            .insert(host.id.as_str(), bytes.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Insert a host intent if its distro still has room.
    ///
    /// The live host count is taken inside the same write transaction as
    /// the insert, so two concurrent allocation passes cannot together
    /// exceed `pool_size`.
    pub fn insert_intent(&self, host: &Host, pool_size: u32) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = (|| -> StateResult<()> {
            let live = {
                let table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
                let mut live = 0u32;
                for entry in table.iter().map_err(map_err!(Read))? {
                    let (_, value) = entry.map_err(map_err!(Read))?;
                    let existing: Host =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    if existing.distro_id == host.distro_id && existing.status.is_live() {
                        live += 1;
                    }
                }
                live
            };
            if live >= pool_size {
                return Err(StateError::PoolFull {
                    distro: host.distro_id.clone(),
                    live,
                    pool_size,
                });
            }
            Self::insert_host_in(&txn, host)
        })();
        Self::finish(txn, result)?;
        debug!(host_id = %host.id, distro = %host.distro_id, "host intent inserted");
        Ok(())
    }

    /// Insert or overwrite a host record unconditionally.
    pub fn put_host(&self, host: &Host) -> StateResult<()> {
        self.put_json(HOSTS, &host.id, host)
    }

    pub fn get_host(&self, host_id: &str) -> StateResult<Option<Host>> {
        self.get_json(HOSTS, host_id)
    }

    pub fn list_hosts(&self) -> StateResult<Vec<Host>> {
        self.list_json(HOSTS)
    }

    /// Hosts matching an arbitrary predicate.
    pub fn find_hosts<P>(&self, predicate: P) -> StateResult<Vec<Host>>
    where
        P: Fn(&Host) -> bool,
    {
        Ok(self.list_hosts()?.into_iter().filter(|h| predicate(h)).collect())
    }

    pub fn find_hosts_by_status(&self, statuses: &[HostStatus]) -> StateResult<Vec<Host>> {
        self.find_hosts(|h| statuses.contains(&h.status))
    }

    /// Up hosts (intents included) grouped by distro.
    pub fn up_hosts_by_distro(&self) -> StateResult<HashMap<DistroId, Vec<Host>>> {
        let mut by_distro: HashMap<DistroId, Vec<Host>> = HashMap::new();
        for host in self.find_hosts(|h| h.status.is_up())? {
            by_distro.entry(host.distro_id.clone()).or_default().push(host);
        }
        Ok(by_distro)
    }

    /// Number of non-terminated hosts of a distro.
    pub fn count_live_hosts(&self, distro_id: &str) -> StateResult<u32> {
        let hosts = self.find_hosts(|h| h.distro_id == distro_id && h.status.is_live())?;
        Ok(hosts.len() as u32)
    }

    /// Apply `f` to the stored host inside one write transaction.
    ///
    /// `f` sees the persisted record, not a caller's copy. If it returns an
    /// error nothing is written. Returns the record as written.
    pub fn modify_host<F>(&self, host_id: &str, f: F) -> StateResult<Host>
    where
        F: FnOnce(&mut Host) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = Self::modify_in(&txn, HOSTS, host_id, f);
        Self::finish(txn, result)
    }

    /// Delete uninitialized intents created before `cutoff`.
    ///
    /// Returns the ids removed.
    pub fn remove_stale_intents(&self, cutoff: DateTime<Utc>) -> StateResult<Vec<HostId>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = (|| -> StateResult<Vec<HostId>> {
            let mut table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let host: Host =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if host.status == HostStatus::Uninitialized
                    && host.is_intent()
                    && host.creation_time < cutoff
                {
                    stale.push(key.value().to_string());
                }
            }
            for id in &stale {
                table.remove(id.as_str()).map_err(map_err!(Write))?;
            }
            Ok(stale)
        })();
        let removed = Self::finish(txn, result)?;
        if !removed.is_empty() {
            debug!(count = removed.len(), "stale host intents removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn test_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            display_name: format!("{id}-name"),
            project: "proj".to_string(),
            version: "v1".to_string(),
            build_variant: "linux".to_string(),
            distro_id: None,
            priority: 0,
            expected_duration: Some(Duration::from_secs(60)),
            depends_on: Vec::new(),
            status: TaskStatus::Unscheduled,
            activated: true,
            create_time: Utc::now(),
            scheduled_time: None,
        }
    }

    fn test_distro(id: &str, pool_size: u32) -> Distro {
        Distro {
            id: id.to_string(),
            arch: "linux_amd64".to_string(),
            provider: ProviderKind::Mock,
            provider_mode: ProviderMode::OnDemand,
            pool_size,
            settings: DistroSettings::default(),
        }
    }

    // ── Tasks ──────────────────────────────────────────────────────

    #[test]
    fn task_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let task = test_task("t1");
        store.put_task(&task).unwrap();
        assert_eq!(store.get_task("t1").unwrap(), Some(task));
        assert_eq!(store.get_task("missing").unwrap(), None);
    }

    #[test]
    fn runnable_requires_activation_and_finished_dependencies() {
        let store = StateStore::open_in_memory().unwrap();

        let mut done = test_task("done");
        done.status = TaskStatus::Finished;
        let mut blocked = test_task("blocked");
        blocked.depends_on = vec!["pending".to_string()];
        let pending = test_task("pending");
        let mut ready = test_task("ready");
        ready.depends_on = vec!["done".to_string()];
        let mut inactive = test_task("inactive");
        inactive.activated = false;
        let mut dangling = test_task("dangling");
        dangling.depends_on = vec!["ghost".to_string()];

        for t in [&done, &blocked, &pending, &ready, &inactive, &dangling] {
            store.put_task(t).unwrap();
        }

        let mut ids: Vec<String> = store
            .find_runnable_tasks()
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["pending", "ready"]);
    }

    #[test]
    fn set_task_distro_rejects_empty_id() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.set_task_distro("", "d").unwrap_err();
        assert!(err.is_precondition());
    }

    #[test]
    fn set_task_distro_missing_task_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.set_task_distro("nope", "d").unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn scheduled_time_is_set_once() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_task(&test_task("t1")).unwrap();

        let first = Utc::now();
        let later = first + ChronoDuration::minutes(5);
        let n = store
            .set_tasks_scheduled_time(&["t1".to_string(), "gone".to_string()], first)
            .unwrap();
        assert_eq!(n, 1);
        store.set_tasks_scheduled_time(&["t1".to_string()], later).unwrap();

        let task = store.get_task("t1").unwrap().unwrap();
        assert_eq!(task.scheduled_time, Some(first));
        assert_eq!(task.status, TaskStatus::Scheduled);
    }

    // ── Task queues ────────────────────────────────────────────────

    #[test]
    fn task_queue_replace_overwrites_previous() {
        let store = StateStore::open_in_memory().unwrap();
        let item = |id: &str| TaskQueueItem {
            task_id: id.to_string(),
            display_name: id.to_string(),
            project: "proj".to_string(),
            build_variant: "bv".to_string(),
            expected_duration: Duration::from_secs(30),
            priority: 1,
            rank: 0,
        };
        let mut queue = TaskQueue {
            distro_id: "d1".to_string(),
            generated_at: Utc::now(),
            items: vec![item("a"), item("b")],
        };
        store.replace_task_queue(&queue).unwrap();
        queue.items = vec![item("c")];
        store.replace_task_queue(&queue).unwrap();

        let stored = store.get_task_queue("d1").unwrap().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored.items[0].task_id, "c");
        assert!(store.delete_task_queue("d1").unwrap());
        assert!(store.get_task_queue("d1").unwrap().is_none());
    }

    // ── Hosts ──────────────────────────────────────────────────────

    #[test]
    fn insert_host_twice_fails() {
        let store = StateStore::open_in_memory().unwrap();
        let host = Host::intent("h1", &test_distro("d1", 2), Utc::now());
        store.insert_host(&host).unwrap();
        let err = store.insert_host(&host).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn insert_intent_respects_pool_size() {
        let store = StateStore::open_in_memory().unwrap();
        let distro = test_distro("d1", 2);
        let now = Utc::now();

        store.insert_intent(&Host::intent("h1", &distro, now), 2).unwrap();
        store.insert_intent(&Host::intent("h2", &distro, now), 2).unwrap();
        let err = store
            .insert_intent(&Host::intent("h3", &distro, now), 2)
            .unwrap_err();
        assert!(matches!(err, StateError::PoolFull { live: 2, pool_size: 2, .. }));
        assert!(store.get_host("h3").unwrap().is_none());
    }

    #[test]
    fn terminated_hosts_free_pool_slots() {
        let store = StateStore::open_in_memory().unwrap();
        let distro = test_distro("d1", 1);
        let mut dead = Host::intent("dead", &distro, Utc::now());
        dead.status = HostStatus::Terminated;
        store.put_host(&dead).unwrap();

        store
            .insert_intent(&Host::intent("fresh", &distro, Utc::now()), 1)
            .unwrap();
        assert_eq!(store.count_live_hosts("d1").unwrap(), 1);
    }

    #[test]
    fn modify_host_refusal_writes_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let host = Host::intent("h1", &test_distro("d1", 2), Utc::now());
        store.insert_host(&host).unwrap();

        let err = store
            .modify_host("h1", |h| {
                h.status = HostStatus::Running;
                Err(StateError::Precondition("nope".to_string()))
            })
            .unwrap_err();
        assert!(err.is_precondition());
        let stored = store.get_host("h1").unwrap().unwrap();
        assert_eq!(stored.status, HostStatus::Uninitialized);
    }

    #[test]
    fn modify_host_returns_written_record() {
        let store = StateStore::open_in_memory().unwrap();
        let host = Host::intent("h1", &test_distro("d1", 2), Utc::now());
        store.insert_host(&host).unwrap();

        let updated = store
            .modify_host("h1", |h| {
                h.status = HostStatus::Starting;
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.status, HostStatus::Starting);
        assert_eq!(store.get_host("h1").unwrap(), Some(updated));
    }

    #[test]
    fn stale_intents_are_removed() {
        let store = StateStore::open_in_memory().unwrap();
        let distro = test_distro("d1", 5);
        let now = Utc::now();

        let old = Host::intent("old", &distro, now - ChronoDuration::minutes(10));
        let young = Host::intent("young", &distro, now);
        let mut started = Host::intent("started", &distro, now - ChronoDuration::minutes(10));
        started.external_id = Some("i-123".to_string());
        started.status = HostStatus::Starting;
        for h in [&old, &young, &started] {
            store.insert_host(h).unwrap();
        }

        let removed = store
            .remove_stale_intents(now - ChronoDuration::minutes(3))
            .unwrap();
        assert_eq!(removed, vec!["old".to_string()]);
        assert_eq!(store.list_hosts().unwrap().len(), 2);
    }

    #[test]
    fn up_hosts_grouped_by_distro() {
        let store = StateStore::open_in_memory().unwrap();
        let a = test_distro("a", 5);
        let b = test_distro("b", 5);
        let mut gone = Host::intent("gone", &a, Utc::now());
        gone.status = HostStatus::Terminated;
        for h in [
            &Host::intent("a1", &a, Utc::now()),
            &Host::intent("a2", &a, Utc::now()),
            &Host::intent("b1", &b, Utc::now()),
            &gone,
        ] {
            store.put_host(h).unwrap();
        }

        let grouped = store.up_hosts_by_distro().unwrap();
        assert_eq!(grouped["a"].len(), 2);
        assert_eq!(grouped["b"].len(), 1);
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.put_distro(&test_distro("d1", 3)).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.get_distro("d1").unwrap().unwrap().pool_size, 3);
    }
}
