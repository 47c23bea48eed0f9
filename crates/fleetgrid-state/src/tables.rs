//! redb table definitions for the Fleetgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// A table of JSON documents keyed by string identifiers.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Tasks keyed by `{task_id}`.
pub const TASKS: JsonTable = TableDefinition::new("tasks");

/// Distros keyed by `{distro_id}`.
pub const DISTROS: JsonTable = TableDefinition::new("distros");

/// Project versions keyed by `{version_id}`.
pub const VERSIONS: JsonTable = TableDefinition::new("versions");

/// Task queues keyed by `{distro_id}`; one queue per distro.
pub const TASK_QUEUES: JsonTable = TableDefinition::new("task_queues");

/// Hosts and host intents keyed by `{host_id}`.
pub const HOSTS: JsonTable = TableDefinition::new("hosts");
