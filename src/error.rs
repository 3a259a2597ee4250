use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("cyclic dependency detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("duplicate resource identity: {0}")]
    DuplicateIdentity(String),

    #[error("resource '{resource}' references unknown resource '{reference}'")]
    UnknownReference { resource: String, reference: String },

    #[error("state is locked by {holder} since {acquired_at} (lease expires {expires_at}); \
             use `converge unlock` to force-release a stale lock")]
    ConcurrentApply {
        holder: String,
        acquired_at: String,
        expires_at: String,
    },

    #[error("no provider registered for resource type '{0}'")]
    UnsupportedType(String),

    #[error("provider error for {identity}: {message}")]
    Provider { identity: String, message: String },

    #[error("apply finished with {} failed and {} committed resources", .failed.len(), .committed.len())]
    PartialApply {
        committed: Vec<String>,
        failed: Vec<(String, String)>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("state snapshot error: {0}")]
    State(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
