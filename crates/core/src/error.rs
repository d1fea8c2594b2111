use thiserror::Error;
use uuid::Uuid;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No configuration registered for '{0}'")]
    ConfigNotFound(String),

    #[error("Definition '{0}' is system-owned and immutable")]
    ImmutableDefinition(String),

    #[error("Invalid state transition from '{from}' to '{to}' on trigger '{trigger}'")]
    InvalidTransition {
        from: String,
        to: String,
        trigger: String,
    },

    #[error("Lock contention on instance {0}")]
    LockContention(Uuid),

    #[error("Slug '{0}' already exists")]
    SlugConflict(String),

    #[error("Step '{step}' timed out after {timeout_ms}ms")]
    ExecutorTimeout { step: String, timeout_ms: u64 },

    #[error("Step '{step}' failed: {source}")]
    ExecutorFailure {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Instance {0} already has an active debug session")]
    SessionActive(Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Expected/transient errors a worker should back off from and retry,
    /// as opposed to faults that must propagate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::LockContention(_) | EngineError::ExecutorTimeout { .. }
        )
    }
}
