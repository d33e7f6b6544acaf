//! Typed errors surfaced on the client-facing catalog RPC surface.

use serde::{Deserialize, Serialize};

/// Application-level error codes embedded in catalog RPC responses.
///
/// Clients use these to decide between retrying elsewhere (leadership
/// errors), retrying later (availability errors), and giving up (input
/// errors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterErrorCode {
    UnknownError,
    /// This master is not the current leader; retry against another master.
    NotTheLeader,
    /// The catalog has not finished loading; retry later.
    CatalogManagerNotInitialized,
    TableNotFound,
    TableAlreadyPresent,
    InvalidSchema,
    TooManyTablets,
    ReplicationFactorTooHigh,
    IllegalReplicationFactor,
    EvenReplicationFactor,
    TabletNotRunning,
}

/// A catalog operation failure with a structured code and a reason string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct MasterError {
    pub code: MasterErrorCode,
    pub message: String,
}

impl MasterError {
    pub fn new(code: MasterErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_the_leader(message: impl Into<String>) -> Self {
        Self::new(MasterErrorCode::NotTheLeader, message)
    }

    pub fn not_initialized(message: impl Into<String>) -> Self {
        Self::new(MasterErrorCode::CatalogManagerNotInitialized, message)
    }

    pub fn table_not_found(message: impl Into<String>) -> Self {
        Self::new(MasterErrorCode::TableNotFound, message)
    }

    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::new(MasterErrorCode::InvalidSchema, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(MasterErrorCode::UnknownError, message)
    }
}

pub type MasterResult<T> = Result<T, MasterError>;

impl From<anyhow::Error> for MasterError {
    fn from(err: anyhow::Error) -> Self {
        MasterError::unknown(format!("{err:#}"))
    }
}
