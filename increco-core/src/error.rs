use thiserror::Error;

/// All errors produced by increco-core.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid IU kind: expected {expected}, got {got}")]
    InvalidIuKind { expected: String, got: String },

    #[error("queue closed")]
    QueueClosed,

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("unknown module class: {0}")]
    UnknownModuleClass(String),

    #[error("malformed graph: {0}")]
    MalformedGraph(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
