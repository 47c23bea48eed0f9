//! fleetgrid-hostinit: host lifecycle management.
//!
//! Moves hosts from scheduler intents to running machines and back out:
//!
//! ```text
//!   StateStore (intents)
//!        │
//!        ▼
//!   HostInit::start_hosts ── ProviderSelector ──▶ dyn CloudProvider::spawn_host
//!        │
//!        ▼
//!   HostInit::setup_ready_hosts ── describe_instance ──▶ on_up ──▶ running
//!        │
//!        ▼
//!   HostInit::terminate_hosts ── terminate_instance ──▶ terminated (+ cost)
//! ```
//!
//! Every status change goes through `HostLifecycle`, which refuses moves
//! the stored status does not allow.

pub mod error;
pub mod init;
pub mod lifecycle;

pub use error::{LifecycleError, LifecycleResult};
pub use init::{HostFailure, HostInit, Readiness, SweepReport, termination_reason};
pub use lifecycle::{HostLifecycle, can_transition};
