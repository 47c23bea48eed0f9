//! Host lifecycle error types.

use thiserror::Error;

use fleetgrid_state::{HostId, HostStatus};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),

    #[error("cloud provider error: {0}")]
    Cloud(#[from] fleetgrid_cloud::CloudError),

    /// The guarded write found the host in a status that does not allow
    /// the requested move.
    #[error("host {host}: cannot move from {from} to {to}")]
    InvalidTransition {
        host: HostId,
        from: HostStatus,
        to: HostStatus,
    },

    #[error("host {0} is already terminated")]
    AlreadyTerminated(HostId),

    #[error("distro not found: {0}")]
    DistroNotFound(String),

    #[error("host sweep canceled")]
    Canceled,
}

impl LifecycleError {
    /// Whether the host's stored status refused the operation, as opposed
    /// to a storage or provider failure.
    pub fn is_refused(&self) -> bool {
        matches!(
            self,
            LifecycleError::InvalidTransition { .. } | LifecycleError::AlreadyTerminated(_)
        )
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
