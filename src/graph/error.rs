use thiserror::Error;

/// Errors produced by graph-core operations.
///
/// Synchronous failures are returned directly to the caller. Failures the
/// backend reports asynchronously arrive through the node `result` event and
/// complete the matching work-queue entry instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("no entity with id {0}")]
    NoEntity(u32),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("out of memory: {0}")]
    NoMemory(String),

    #[error("backend error {code}: {message}")]
    Backend { code: i32, message: String },

    #[error("operation not allowed in state {0}")]
    BadState(String),

    #[error("peer connection dropped: {0}")]
    Connection(String),

    /// Reserved; never raised on the hot path.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl GraphError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        GraphError::Invalid(msg.into())
    }

    pub fn exists(msg: impl Into<String>) -> Self {
        GraphError::Exists(msg.into())
    }

    pub fn bad_state(msg: impl Into<String>) -> Self {
        GraphError::BadState(msg.into())
    }

    pub fn backend(code: i32, msg: impl Into<String>) -> Self {
        GraphError::Backend {
            code,
            message: msg.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
