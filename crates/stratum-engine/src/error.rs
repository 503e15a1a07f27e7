//! Engine error types

use stratum_state::StateError;
use thiserror::Error;

/// Errors raised while reconciling resources
#[derive(Error, Debug)]
pub enum EngineError {
    /// The state backend failed; the pass fails closed
    #[error("State store error: {0}")]
    State(#[from] StateError),

    /// A resource handler failed; the record keeps its non-terminal status
    #[error("Resource {fqn} failed: {source:#}")]
    Handler {
        fqn: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "Resource {fqn} conflicts with an existing object '{name}'. \
         Re-run with --adopt (or set `adopt: true` on the resource) to manage it"
    )]
    Conflict { fqn: String, name: String },

    #[error("Cannot order deletions safely: {0}")]
    Dependency(String),

    #[error("No handler registered for resource kind '{kind}' (needed by {fqn})")]
    UnknownKind { kind: String, fqn: String },

    #[error("Invalid resource id or scope name: {0}")]
    InvalidId(String),

    #[error("Resource id '{id}' declared twice in scope {scope}")]
    DuplicateId { scope: String, id: String },

    /// Interrupted before a transition started; not a failure
    #[error("Interrupted")]
    Cancelled,

    #[error("Emulator error: {0}")]
    Emulator(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    /// Find an engine error inside an `anyhow` chain
    pub fn find_in(err: &anyhow::Error) -> Option<&EngineError> {
        err.chain().find_map(|e| e.downcast_ref::<EngineError>())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
