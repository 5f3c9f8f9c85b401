//! Error types for the Dothill CSI plugin

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Array error code returned when the host (initiator) is unknown to the array.
pub const HOST_DOES_NOT_EXIST_ERROR_CODE: i64 = -10386;

/// Array error code returned when a host has no mapping for the volume.
pub const HOST_MAP_DOES_NOT_EXIST_ERROR_CODE: i64 = -10074;

/// Array error code returned when the named volume cannot be found.
pub const VOLUME_NOT_FOUND_ERROR_CODE: i64 = -10075;

/// Error reported by the array management API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("array returned code {code}: {message}")]
pub struct ArrayError {
    /// Negative return code from the array
    pub code: i64,
    /// Human-readable response text
    pub message: String,
}

impl ArrayError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The host or its mapping is already gone.
    pub fn is_missing_host_or_map(&self) -> bool {
        self.code == HOST_DOES_NOT_EXIST_ERROR_CODE
            || self.code == HOST_MAP_DOES_NOT_EXIST_ERROR_CODE
    }

    /// The volume is already gone.
    pub fn is_missing_volume(&self) -> bool {
        self.code == VOLUME_NOT_FOUND_ERROR_CODE
    }
}

/// Status code reported to the orchestrator, mirroring the CSI/gRPC codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    InvalidArgument,
    FailedPrecondition,
    Aborted,
    Unimplemented,
    ResourceExhausted,
    DeadlineExceeded,
    DataLoss,
    Unavailable,
    Internal,
}

impl Code {
    /// HTTP status used by the RPC endpoint for this code.
    pub fn http_status(&self) -> u16 {
        match self {
            Code::InvalidArgument | Code::FailedPrecondition => 400,
            Code::Aborted => 409,
            Code::ResourceExhausted => 429,
            Code::Unimplemented => 501,
            Code::Unavailable => 503,
            Code::DeadlineExceeded => 504,
            Code::DataLoss | Code::Internal => 500,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors that can occur in the Dothill CSI plugin
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed call input (empty id or path, missing capability)
    #[error("{0}")]
    InvalidArgument(String),

    /// Missing or invalid configuration, unsupported access mode, or a
    /// device already formatted with another filesystem
    #[error("{0}")]
    FailedPrecondition(String),

    /// The node admission slot is taken by another publication
    #[error("node busy: too many concurrent volume publication, try again later")]
    NodeBusy,

    /// Declared but unsupported operation
    #[error("{0} is unimplemented and should not be called")]
    Unimplemented(String),

    /// No resource left (e.g. every LUN is in use)
    #[error("{0}")]
    ResourceExhausted(String),

    /// Filesystem consistency check failed
    #[error("Filesystem seems to be corrupted: {0}")]
    Corruption(String),

    /// External process exited with a failure; output is the combined
    /// stdout/stderr of the process
    #[error("command '{command}' failed: {output}")]
    CommandFailed { command: String, output: String },

    /// Array management API error
    #[error("{0}")]
    Array(#[from] ArrayError),

    /// Block transport (iSCSI session) error
    #[error("iSCSI transport error: {0}")]
    Transport(String),

    /// The call deadline expired before the operation finished
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    /// HTTP error talking to the array
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Status code the orchestrator sees for this error.
    pub fn code(&self) -> Code {
        match self {
            Error::InvalidArgument(_) => Code::InvalidArgument,
            Error::FailedPrecondition(_) => Code::FailedPrecondition,
            Error::NodeBusy => Code::Aborted,
            Error::Unimplemented(_) => Code::Unimplemented,
            Error::ResourceExhausted(_) => Code::ResourceExhausted,
            Error::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Error::Corruption(_) => Code::DataLoss,
            Error::Array(_) | Error::Http(_) | Error::Transport(_) => Code::Unavailable,
            Error::CommandFailed { .. }
            | Error::Io(_)
            | Error::Json(_)
            | Error::Config(_)
            | Error::Internal(_) => Code::Internal,
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Error::FailedPrecondition(msg.into())
    }
}
