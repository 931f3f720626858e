//! Error types for the orchestrator
//!
//! Three families, one per seam:
//! - `OrchestratorError`: what callers of the operation surface see
//! - `ProviderError`: what a provider adapter call can fail with
//! - `StoreError`: what the execution store can fail with

use conduit_core::domain::execution::{ExecutionEvent, ExecutionState};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors returned by the caller-facing operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Bad request shape; nothing was created
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown or disabled template
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// Parameters do not satisfy the template schema
    #[error("Parameter validation error: {0}")]
    ParameterValidation(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// The state machine refused a transition
    #[error("Execution {id} cannot go from {from} on {event:?}")]
    InvalidTransition {
        id: Uuid,
        from: ExecutionState,
        event: ExecutionEvent,
    },

    /// The execution already reached completed, failed or cancelled
    #[error("Execution {id} is already {state}")]
    AlreadyTerminal { id: Uuid, state: ExecutionState },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors from provider adapter calls
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The provider refused the job (capacity, invalid config)
    #[error("Provider rejected the request: {0}")]
    Rejected(String),

    /// Network failure talking to the provider
    #[error("Provider unreachable: {0}")]
    Unreachable(String),

    /// The call did not finish within the per-call timeout
    #[error("Provider call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The provider cannot stop a running job
    #[error("Provider cannot cancel: {0}")]
    CancelUnsupported(String),

    /// The provider does not know the referenced job
    #[error("Provider does not know execution {0}")]
    UnknownExecution(String),
}

/// Errors from the execution store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Execution not found in store: {0}")]
    NotFound(Uuid),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
