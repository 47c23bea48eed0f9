//! fleetgrid-state: embedded store for the Fleetgrid scheduling core.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage of tasks, distros, project versions, per-distro task queues and
//! hosts.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns
//! and keyed by their identifier (task queues by distro id).
//!
//! Single-record writes are atomic. Host updates that depend on the
//! record's current state go through [`StateStore::modify_host`], which
//! reads, checks and writes inside one write transaction; a refused check
//! surfaces as [`StateError::Precondition`], distinct from storage errors.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks and blocking workers.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
