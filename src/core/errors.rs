use thiserror::Error;

/// Unified error type for the engine.
///
/// Executor failures are deliberately not represented here: they are
/// `anyhow::Error` values captured by the scheduler and recorded onto the
/// failing node's result, never raised past the dispatch loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("invalid graph definition: {0}")]
    InvalidDefinition(String),

    /// An operation was applied to a task or node in a state that does not
    /// admit it (e.g. unblocking a node that is not paused).
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage operation failed")]
    Storage(#[from] sled::Error),

    #[error("serialization failed")]
    Serialization(#[from] serde_json::Error),

    #[error("io operation failed")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
