pub mod handlers;

use thiserror::Error;
use tracing::error;

use crate::migration::ledger::MigrationStatus;

#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("Collection Error: {0}")]
    Collection(#[from] CollectionError),

    #[error("Constraint Conflict: {0}")]
    ConstraintConflict(#[from] ConstraintConflict),

    #[error("Placement infeasible for guest {guest}: {reason}")]
    PlacementInfeasible {
        guest: String,
        reason: String,
    },

    #[error("Relocation Error: {0}")]
    Relocation(#[from] RelocationError),

    #[error("Relocation of guest {guest} did not finish within {seconds}s")]
    Timeout {
        guest: String,
        seconds: u64,
    },

    #[error("Configuration Error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Ledger Error: {0}")]
    Ledger(#[from] LedgerError),
}

impl BalancerError {
    /// Short machine-readable kind, used by the API error body.
    pub fn kind(&self) -> &'static str {
        match self {
            BalancerError::Collection(_) => "collection",
            BalancerError::ConstraintConflict(_) => "constraint_conflict",
            BalancerError::PlacementInfeasible { .. } => "placement_infeasible",
            BalancerError::Relocation(_) => "relocation",
            BalancerError::Timeout { .. } => "timeout",
            BalancerError::Configuration(_) => "configuration",
            BalancerError::Ledger(_) => "ledger",
        }
    }
}

#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("cluster {cluster} unavailable: {message}")]
    Unavailable {
        cluster: String,
        message: String,
        retryable: bool,
    },

    #[error("node {node} unreachable: {reason}")]
    NodeUnreachable {
        node: String,
        reason: String,
    },

    #[error("malformed inventory: {0}")]
    Malformed(String),

    #[error("inventory io: {0}")]
    Io(#[from] std::io::Error),
}

impl CollectionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CollectionError::Unavailable { retryable, .. } => *retryable,
            CollectionError::NodeUnreachable { .. } => true,
            CollectionError::Malformed(_) => false,
            CollectionError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
        }
    }
}

impl From<serde_json::Error> for CollectionError {
    fn from(err: serde_json::Error) -> Self {
        CollectionError::Malformed(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[error("guest {guest}: {message}")]
pub struct ConstraintConflict {
    pub guest: String,
    pub message: String,
    /// True when the guest was excluded from placement because of the conflict.
    pub excluded: bool,
}

#[derive(Error, Debug)]
pub enum RelocationError {
    #[error("relocation of {guest} failed: {message}")]
    Failed {
        guest: String,
        message: String,
    },

    #[error("relocation command could not run: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("invalid value for {field}: {message}")]
    Invalid {
        field: String,
        message: String,
    },

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("failed to persist configuration: {0}")]
    Persist(String),
}

impl ConfigurationError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigurationError::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("migration record {0} not found")]
    NotFound(u64),

    #[error("migration record {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: u64,
        from: MigrationStatus,
        to: MigrationStatus,
    },

    #[error("ledger journal: {0}")]
    Journal(String),
}

pub type BalancerResult<T> = Result<T, BalancerError>;

/// Logs an error with the operation it interrupted and hands it back.
pub fn log_failure<E: std::fmt::Display>(operation: &str, err: E) -> E {
    error!(error = %err, operation, "Operation failed");
    err
}
