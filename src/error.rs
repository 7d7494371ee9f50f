//! Error types and exit statuses for the balancer.
//!
//! Each layer has its own error enum; transfer errors never cross the mover
//! boundary, name-service errors abort the iteration, configuration errors
//! abort the process.

use thiserror::Error;

/// Errors raised by the metadata authority client.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("another balancer is running on {path}")]
    AlreadyRunning { path: String },

    #[error("lost connection to name service: {0}")]
    ConnectionLost(String),

    #[error("name service rejected request: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while moving a single block. These are contained inside the
/// mover: the block is skipped and the involved nodes get a back-off delay.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("channel negotiation failed: {0}")]
    Negotiation(String),

    #[error("access token rejected by transfer peer")]
    AccessToken,

    #[error("transfer peer rejected block move: {0}")]
    Rejected(String),

    #[error("block move timed out")]
    Timeout,

    #[error("wire protocol error: {0}")]
    Wire(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration and argument errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("threshold out of range [1.0, 100.0]: {0}")]
    ThresholdOutOfRange(f64),

    #[error("unknown balancing policy: {0}")]
    UnknownPolicy(String),

    #[error("-exclude and -include cannot be specified together")]
    ExcludeIncludeConflict,

    #[error("unable to read host file {path}: {source}")]
    HostFile {
        path: String,
        source: std::io::Error,
    },
}

/// Outcome of a balancer run (and of a single iteration). The numeric codes
/// map directly to the process exit code; `InProgress` only drives the outer
/// loop and is never returned to the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    InProgress,
    AlreadyRunning,
    NoMoveBlock,
    NoMoveProgress,
    IoException,
    IllegalArgs,
    Interrupted,
}

impl ExitStatus {
    /// Shell exit code for this status.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::InProgress => 1,
            ExitStatus::AlreadyRunning => -1,
            ExitStatus::NoMoveBlock => -2,
            ExitStatus::NoMoveProgress => -3,
            ExitStatus::IoException => -4,
            ExitStatus::IllegalArgs => -5,
            ExitStatus::Interrupted => -6,
        }
    }

    /// True if the status terminates the multi-service sweep.
    pub fn is_terminal_error(self) -> bool {
        !matches!(self, ExitStatus::Success | ExitStatus::InProgress)
    }
}

impl From<&ServiceError> for ExitStatus {
    fn from(err: &ServiceError) -> Self {
        match err {
            ServiceError::AlreadyRunning { .. } => ExitStatus::AlreadyRunning,
            _ => ExitStatus::IoException,
        }
    }
}
