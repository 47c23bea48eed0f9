//! Error types for the Fleetgrid state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A guarded update was refused because the record's current state
    /// does not allow it. Nothing was written.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("distro {distro} is at its pool size ({live}/{pool_size})")]
    PoolFull {
        distro: String,
        live: u32,
        pool_size: u32,
    },
}

impl StateError {
    /// True when the error reports a refused guard rather than a storage fault.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            StateError::Precondition(_) | StateError::PoolFull { .. } | StateError::AlreadyExists(_)
        )
    }
}
