//! Scheduler error types.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use fleetgrid_state::DistroId;

/// One distro's failure within a scheduling run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistroFailure {
    pub distro: DistroId,
    pub error: String,
}

impl DistroFailure {
    pub fn new(distro: impl Into<DistroId>, error: impl fmt::Display) -> Self {
        Self {
            distro: distro.into(),
            error: error.to_string(),
        }
    }
}

impl fmt::Display for DistroFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.distro, self.error)
    }
}

fn join_failures(failures: &[DistroFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The run observed its cancellation signal and stopped early.
    #[error("scheduling run canceled")]
    Canceled,

    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),

    #[error("distro not found: {0}")]
    DistroNotFound(String),

    #[error("project for version {version}: {reason}")]
    Project { version: String, reason: String },

    #[error("scheduling worker failed: {0}")]
    Worker(String),

    #[error("{} distro(s) failed: {}", .0.len(), join_failures(.0))]
    Distros(Vec<DistroFailure>),
}

impl SchedulerError {
    pub fn project(version: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Project {
            version: version.into(),
            reason: reason.to_string(),
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
