//! Domain types for the Fleetgrid state store.
//!
//! These types represent the persisted state of tasks, distros, project
//! versions, task queues and hosts. All types are serializable to/from
//! JSON for storage in redb tables.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a task.
pub type TaskId = String;

/// Unique identifier for a distro (compute pool).
pub type DistroId = String;

/// Unique identifier for a host or host intent.
pub type HostId = String;

/// `started_by` value for hosts spawned by the scheduler itself.
pub const SYSTEM_USER: &str = "fleetgrid";

// ── Task ───────────────────────────────────────────────────────────

/// A unit of work waiting for (or running on) a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub display_name: String,
    pub project: String,
    /// Version (revision) the task was created from.
    pub version: String,
    pub build_variant: String,
    /// Distro the task was first scheduled against; `None` until backfilled.
    pub distro_id: Option<DistroId>,
    /// Higher runs first.
    pub priority: i64,
    /// Historical estimate; `None` means "use the configured default".
    pub expected_duration: Option<Duration>,
    pub depends_on: Vec<TaskId>,
    pub status: TaskStatus,
    /// Only activated tasks are considered for scheduling.
    pub activated: bool,
    pub create_time: DateTime<Utc>,
    /// Set the first time the task enters a persisted queue.
    pub scheduled_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Unscheduled,
    Scheduled,
    Dispatched,
    Finished,
}

impl TaskStatus {
    /// Waiting for a host, whether or not it has been queued before.
    pub fn is_waiting(&self) -> bool {
        matches!(self, TaskStatus::Unscheduled | TaskStatus::Scheduled)
    }
}

// ── Distro ─────────────────────────────────────────────────────────

/// A named compute pool that tasks run against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Distro {
    pub id: DistroId,
    /// e.g. `linux_amd64`, `windows_amd64`.
    pub arch: String,
    pub provider: ProviderKind,
    /// How instances for this distro are acquired.
    #[serde(default)]
    pub provider_mode: ProviderMode,
    /// Maximum number of non-terminated hosts.
    pub pool_size: u32,
    #[serde(default)]
    pub settings: DistroSettings,
}

/// Which backend hosts of a distro come from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Ec2,
    Mock,
    /// Fixed machines registered out of band; never spawned or terminated.
    Static,
}

impl ProviderKind {
    /// Whether hosts of this kind can be created and destroyed on demand.
    pub fn is_spawnable(&self) -> bool {
        !matches!(self, ProviderKind::Static)
    }
}

/// Acquisition strategy for hosts of a distro.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    #[default]
    OnDemand,
    Spot,
    /// Spot when it is currently cheaper than on-demand.
    Auto,
}

/// Provider-specific launch settings of a distro.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DistroSettings {
    pub instance_type: String,
    /// Availability zone or region; empty means the pricing default region.
    pub zone: String,
    pub ami: String,
    pub key_name: String,
    pub security_groups: Vec<String>,
    /// Name tag of the isolated virtual network hosts launch into.
    pub vpc_name: Option<String>,
    pub is_vpc: bool,
    /// Fixed spot bid; without one, spot hosts bid the on-demand price.
    pub bid_price: Option<f64>,
}

impl Distro {
    /// Whether the distro's network is an isolated virtual network.
    pub fn in_vpc(&self) -> bool {
        self.settings.is_vpc && self.settings.vpc_name.is_some()
    }
}

// ── Version ────────────────────────────────────────────────────────

/// A project revision carrying its (unparsed) project configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Version {
    pub id: String,
    pub project: String,
    /// Project configuration document as JSON.
    pub config: String,
}

// ── Task queue ─────────────────────────────────────────────────────

/// One entry of a distro's persisted, ordered queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskQueueItem {
    pub task_id: TaskId,
    pub display_name: String,
    pub project: String,
    pub build_variant: String,
    pub expected_duration: Duration,
    pub priority: i64,
    /// Zero-based position in the queue.
    pub rank: usize,
}

/// The ordered queue of tasks for one distro, replaced on every run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskQueue {
    pub distro_id: DistroId,
    pub generated_at: DateTime<Utc>,
    pub items: Vec<TaskQueueItem>,
}

impl TaskQueue {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of the expected durations of all queued tasks.
    pub fn total_expected_duration(&self) -> Duration {
        self.items.iter().map(|i| i.expected_duration).sum()
    }
}

// ── Host ───────────────────────────────────────────────────────────

/// A compute instance, or an intent to create one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: HostId,
    pub distro_id: DistroId,
    pub provider: ProviderKind,
    /// Provider-assigned identifier; `None` while the host is an intent.
    pub external_id: Option<String>,
    pub dns_name: Option<String>,
    pub zone: Option<String>,
    pub instance_type: Option<String>,
    pub status: HostStatus,
    pub provisioned: bool,
    pub provision_attempts: u32,
    pub started_by: String,
    /// Spawned on request of a user rather than by the allocator.
    pub user_host: bool,
    pub needs_new_agent: bool,
    pub running_task: Option<TaskId>,
    pub creation_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub provision_time: Option<DateTime<Utc>>,
    pub termination_time: Option<DateTime<Utc>>,
    /// Lease end for user-spawned hosts.
    pub expiration_time: Option<DateTime<Utc>>,
    pub last_communication: Option<DateTime<Utc>>,
    /// Spot bid; set only when the host was acquired on the spot market.
    pub bid_price: Option<f64>,
    pub subnet_id: Option<String>,
    pub total_cost: f64,
}

impl Host {
    /// A fresh intent for `distro`, not yet acknowledged by any provider.
    pub fn intent(id: impl Into<HostId>, distro: &Distro, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            distro_id: distro.id.clone(),
            provider: distro.provider,
            external_id: None,
            dns_name: None,
            zone: None,
            instance_type: None,
            status: HostStatus::Uninitialized,
            provisioned: false,
            provision_attempts: 0,
            started_by: SYSTEM_USER.to_string(),
            user_host: false,
            needs_new_agent: false,
            running_task: None,
            creation_time: now,
            start_time: None,
            provision_time: None,
            termination_time: None,
            expiration_time: None,
            last_communication: None,
            bid_price: None,
            subnet_id: None,
            total_cost: 0.0,
        }
    }

    pub fn is_intent(&self) -> bool {
        self.external_id.is_none()
    }
}

/// Host lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Uninitialized,
    Starting,
    Initializing,
    Running,
    ProvisionFailed,
    Unreachable,
    Decommissioned,
    Quarantined,
    Terminated,
}

impl HostStatus {
    /// Counts toward capacity for allocation: an intent or a host on its
    /// way up, or one already up.
    pub fn is_up(&self) -> bool {
        matches!(
            self,
            HostStatus::Uninitialized
                | HostStatus::Starting
                | HostStatus::Initializing
                | HostStatus::Running
        )
    }

    /// Occupies a slot in the distro's pool.
    pub fn is_live(&self) -> bool {
        !matches!(self, HostStatus::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Uninitialized => "uninitialized",
            HostStatus::Starting => "starting",
            HostStatus::Initializing => "initializing",
            HostStatus::Running => "running",
            HostStatus::ProvisionFailed => "provision_failed",
            HostStatus::Unreachable => "unreachable",
            HostStatus::Decommissioned => "decommissioned",
            HostStatus::Quarantined => "quarantined",
            HostStatus::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
