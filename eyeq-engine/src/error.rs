use thiserror::Error;

/// Errors returned by the administrative surface of the engine. The packet path never fails; its
/// outcome is a [`Verdict`](crate::Verdict).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("class {0} already exists")]
    ClassExists(String),
    #[error("unknown class {0}")]
    UnknownClass(String),
    #[error("queue {0} already exists")]
    QueueExists(String),
    #[error("unknown queue {0}")]
    UnknownQueue(String),
    #[error("queue {0} is still associated with {1} class(es)")]
    QueueInUse(String, usize),
    #[error("invalid class key {0:?}")]
    InvalidKey(String),
    #[error("unknown parameter {0}")]
    UnknownParam(String),
    #[error("invalid value {value:?} for parameter {name}")]
    InvalidParam { name: String, value: String },
    #[error("invalid command {0:?}")]
    InvalidCommand(String),
    #[error("weight must be positive")]
    ZeroWeight,
    #[error("engine is shut down")]
    Shutdown,
    #[error("no tokio runtime available to start deferred work")]
    NoRuntime,
}

pub type Result<T> = std::result::Result<T, Error>;
