//! fleetgrid-scheduler: task queues and host demand per distro.
//!
//! One scheduling run turns runnable tasks into ordered per-distro queues
//! and into host intents for the distros that need more capacity:
//!
//! - Partitions runnable tasks by the distros their project allows
//! - Prioritizes and persists each distro's queue in a worker pool
//! - Sizes each distro against a target makespan
//! - Persists new hosts as `Uninitialized` intents
//!
//! # Architecture
//!
//! ```text
//! Runner (interval loop)
//!   └── Scheduler::schedule
//!         ├── partition_tasks ── dyn ProjectResolver
//!         ├── DistroQueuePool
//!         │     └── worker × N: dyn TaskPrioritizer → dyn QueuePersister
//!         ├── dyn HostAllocationStrategy (DurationBasedHostAllocator)
//!         └── IntentSpawner ── StateStore::insert_intent
//! ```

pub mod allocator;
pub mod durations;
pub mod error;
pub mod partition;
pub mod persister;
pub mod pool;
pub mod prioritizer;
pub mod runner;
pub mod scheduler;
pub mod spawner;

pub use allocator::{DurationBasedHostAllocator, HostAllocationStrategy, HostAllocatorData};
pub use durations::TaskDurations;
pub use error::{DistroFailure, SchedulerError, SchedulerResult};
pub use partition::{
    Partition, ProjectConfig, ProjectResolver, SkippedTask, StoreProjectResolver, partition_tasks,
};
pub use persister::{QueuePersister, StoreQueuePersister};
pub use pool::{DistroQueuePool, DistroWorkUnit, PoolOutcome};
pub use prioritizer::{CmpBasedTaskPrioritizer, TaskPrioritizer};
pub use runner::Runner;
pub use scheduler::{DistroReport, ScheduleReport, Scheduler};
pub use spawner::{IntentSpawner, SpawnOutcome};
