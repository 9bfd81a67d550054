//! Error types shared by the executor, the runtime and the history stores.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal failure reason of an orchestration instance.
///
/// This value is persisted inside `Outcome::Failed`, so variants and field
/// names are part of the history format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "type", content = "message")]
pub enum OrchestrationError {
    /// The workflow code requested tasks that disagree with the recorded history.
    #[error("nondeterministic: {0}")]
    NonDeterminism(String),
    /// Raised into in-flight tasks when an instance is terminated.
    #[error("TerminationRequested: {0}")]
    TerminationRequested(String),
    /// The stored history is unreadable or structurally invalid.
    #[error("history corruption: {0}")]
    HistoryCorruption(String),
    /// The workflow code returned an error, including an activity or child
    /// failure it propagated with `?`.
    #[error("{0}")]
    Application(String),
    /// The workflow code panicked while being replayed.
    #[error("orchestration panicked: {0}")]
    Panicked(String),
    /// No handler is registered under the instance's orchestration name.
    #[error("unregistered orchestration: {0}")]
    UnknownOrchestration(String),
    /// The history store rejected a write the instance cannot continue without.
    #[error("history store failure: {0}")]
    StoreFailure(String),
}

impl OrchestrationError {
    /// Fatal errors stop the instance regardless of workflow code.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestrationError::NonDeterminism(_)
                | OrchestrationError::HistoryCorruption(_)
                | OrchestrationError::Panicked(_)
                | OrchestrationError::UnknownOrchestration(_)
                | OrchestrationError::StoreFailure(_)
        )
    }
}

/// Errors returned by a [`crate::providers::HistoryStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// A writer tried to append at a position that is no longer the end of the log.
    #[error("append conflict on {instance}: expected event_id {expected}, found {found}")]
    Conflict { instance: String, expected: u64, found: u64 },
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("instance already exists: {0}")]
    AlreadyExists(String),
    #[error("history cap exceeded for {instance} (cap {cap})")]
    CapExceeded { instance: String, cap: usize },
    /// A persisted record could not be decoded.
    #[error("corrupt history record for {instance} at line {line}: {reason}")]
    Corrupt { instance: String, line: usize, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors returned by client-facing runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("instance already exists: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("codec error: {0}")]
    Codec(String),
}

/// Error returned by `Runtime::wait_for_orchestration`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("timed out waiting for orchestration")]
    Timeout,
    #[error("{0}")]
    Other(String),
}
