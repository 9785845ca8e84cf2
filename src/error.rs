use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdsError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("wrong mode: {0}")]
    WrongMode(&'static str),

    #[error("frame source error: {0}")]
    Source(String),

    #[error("alert sink error: {0}")]
    Sink(String),

    #[error("memory limit exceeded: {used_mb} MiB used of {limit_mb} MiB")]
    MemoryExhausted { used_mb: u64, limit_mb: u64 },

    #[error("baseline not found: {0}")]
    BaselineNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IdsError>;
