//! Error types for the PVC Remap Operator
//!
//! Provides structured error types for the remap executor, the per-instance
//! orchestrator, the cluster coordinator and the object store adapters.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation cancelled during {operation}")]
    Cancelled { operation: String },

    // =========================================================================
    // Kubernetes / Object Store Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Store operation {operation} failed on {object}: {reason}")]
    StoreOperation {
        operation: String,
        object: String,
        reason: String,
    },

    #[error("Optimistic concurrency conflict on {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Pod {pod} is still terminating")]
    PodTerminating { pod: String },

    // =========================================================================
    // Remap Errors
    // =========================================================================
    #[error("Refusing to delete bound PVC {claim}")]
    UnsafeDeletion { claim: String },

    #[error("Source PVC {claim} for instance {instance} does not exist")]
    SourceMissing { instance: String, claim: String },

    #[error("Stale PVC {claim} could not be removed: {reason}")]
    StaleResource { claim: String, reason: String },

    #[error("PVC inventory cannot be classified at {claim}: {reason}")]
    MalformedInventory { claim: String, reason: String },

    #[error("Existing PVC {target} does not match clone source {source_claim}: {reason}")]
    TargetMismatch {
        target: String,
        source_claim: String,
        reason: String,
    },

    #[error("Remapping failed for instances {failed:?}: {first}")]
    RemapFailed { failed: Vec<String>, first: Box<Error> },

    // =========================================================================
    // Switchover Errors
    // =========================================================================
    #[error("Primary pod {pod} is not migrated to new storage: switchover incomplete")]
    SwitchoverIncomplete { pod: String },

    #[error("Switchover failed for primary pod {pod}: {reason}")]
    Switchover { pod: String, reason: String },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Wrap a failed store round trip with the operation and object identity
    pub fn store(
        operation: impl Into<String>,
        object: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Error::StoreOperation {
            operation: operation.into(),
            object: object.into(),
            reason: reason.to_string(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::StoreOperation { .. }
            | Error::Conflict { .. }
            | Error::Cancelled { .. } => ErrorAction::RequeueWithBackoff,

            // Waiting on an external binding or finalizer to clear
            Error::UnsafeDeletion { .. }
            | Error::StaleResource { .. }
            | Error::PodTerminating { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(30))
            }

            // Switchover needs the replicas to catch up
            Error::SwitchoverIncomplete { .. } | Error::Switchover { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Needs operator attention
            Error::TargetMismatch { .. } | Error::SourceMissing { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(300))
            }

            Error::RemapFailed { first, .. } => first.action(),

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::MalformedInventory { .. }
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
