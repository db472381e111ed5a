use thiserror::Error;

/// Everything the pool, its instances and the converter can fail with.
///
/// Cloneable so one failure can be delivered to a task's result slot and
/// still be logged or recorded on the instance that produced it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OfficeError {
    #[error("failed to start office process for {instance}: {reason}")]
    ProcessStart { instance: String, reason: String },

    #[error("failed to stop office process for {instance}: {reason}")]
    ProcessStop { instance: String, reason: String },

    #[error("could not connect to office instance {instance}: {reason}")]
    Connection { instance: String, reason: String },

    #[error("connection to office instance {instance} was lost")]
    ConnectionLost { instance: String },

    #[error("bridge call '{op}' failed: {reason}")]
    Bridge { op: String, reason: String },

    #[error("task {task} exceeded the execution timeout of {timeout_ms}ms")]
    TaskTimeout { task: u64, timeout_ms: u64 },

    #[error("task {task} got no office instance within {timeout_ms}ms")]
    NoInstanceAvailable { task: u64, timeout_ms: u64 },

    #[error("office pool is not running")]
    NotRunning,

    #[error("office pool stopped before task {task} completed")]
    Stopped { task: u64 },

    #[error("task {task} was cancelled")]
    Cancelled { task: u64 },

    #[error("task {task} panicked")]
    TaskPanicked { task: u64 },

    #[error("task {task} could not be handed to office instance {instance}: {reason}")]
    Rejected {
        task: u64,
        instance: String,
        reason: String,
    },

    #[error("no office instance could be started: {}", join(.0))]
    PoolStart(Vec<OfficeError>),

    #[error("stopping the office pool reported errors: {}", join(.0))]
    PoolStop(Vec<OfficeError>),

    #[error("no office pool is installed")]
    NoInstalledPool,

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("unknown document format: {0}")]
    UnknownFormat(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl OfficeError {
    /// True for failures that mean the remote process is gone and the
    /// instance has to be restarted.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, OfficeError::ConnectionLost { .. })
    }
}

fn join(errors: &[OfficeError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, OfficeError>;
