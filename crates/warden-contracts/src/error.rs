//! Runtime error types for the WARDEN agent runtime.
//!
//! All fallible runtime operations return `WardenResult<T>`. Task handler
//! failures never travel through this type back to `submit_task` callers;
//! they are rendered into `TaskResult::error` with the variant's display text.

use thiserror::Error;

use crate::agent::LifecycleState;

/// The unified error type for the WARDEN runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WardenError {
    /// A lifecycle (or scheduling) operation is not legal in the current state.
    ///
    /// Fatal to the call, never to the agent: the state is left untouched.
    #[error("invalid state transition: cannot {operation} while {from}")]
    InvalidStateTransition {
        from: LifecycleState,
        operation: String,
    },

    /// A task handler returned `success: false`, returned an error, or panicked.
    ///
    /// Recoverable through the retry policy.
    #[error("task {task_id} failed on attempt {attempt}: {reason}")]
    TaskHandlerFailure {
        task_id: String,
        attempt: u32,
        reason: String,
    },

    /// A task failed on its last permitted attempt.
    #[error("task {task_id} exhausted its retries after {attempts} attempt(s): {reason}")]
    RetriesExhausted {
        task_id: String,
        attempts: u32,
        reason: String,
    },

    /// Publish or subscribe was attempted on a stopped message bus.
    ///
    /// The bus logs and drops; this variant is never thrown to publishers.
    #[error("message bus unavailable: {reason}")]
    BusUnavailable { reason: String },

    /// Recomputing the hash chain found stored entries that do not match.
    #[error("audit chain integrity violated at indices {indices:?}")]
    ChainIntegrityViolation { indices: Vec<u64> },

    /// The task type is not among the agent's granted capabilities.
    #[error("capability '{capability}' is not granted to agent '{agent_id}'")]
    CapabilityMissing {
        capability: String,
        agent_id: String,
    },

    /// An append was attempted on a closed audit log.
    #[error("audit log for '{owner}' is closed to appends")]
    AuditLogClosed { owner: String },

    /// The audit log could not record an entry.
    #[error("audit write failed: {reason}")]
    AuditWriteFailed { reason: String },

    /// A lifecycle hook (`on_initialize`, `on_start`, `on_stop`) failed.
    #[error("lifecycle hook '{hook}' failed: {reason}")]
    HookFailed { hook: String, reason: String },

    /// A signature did not verify against the agent's public key.
    #[error("signature from '{agent_id}' is invalid: {reason}")]
    SignatureInvalid { agent_id: String, reason: String },

    /// A required configuration value is missing or invalid.
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },
}

impl WardenError {
    pub fn invalid_transition(from: LifecycleState, operation: impl Into<String>) -> Self {
        WardenError::InvalidStateTransition {
            from,
            operation: operation.into(),
        }
    }

    pub fn hook_failed(hook: &str, reason: impl ToString) -> Self {
        WardenError::HookFailed {
            hook: hook.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Convenience alias used throughout the WARDEN crates.
pub type WardenResult<T> = Result<T, WardenError>;
