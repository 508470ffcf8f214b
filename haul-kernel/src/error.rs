//! Error types for the upload agent
//!
//! `AgentError` is the crate-local error returned by every fallible operation
//! in the kernel, store, transfer, and control crates. Each variant carries
//! the `code` that the Control Surface puts on an `error` frame (see
//! [`AgentError::code`]), so callers never have to string-match an error
//! message to classify it.

use thiserror::Error;

/// Machine-readable error code surfaced on Control Surface `error` frames.
///
/// These are the exact string values the wire protocol uses; renaming a
/// variant here changes the frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UploadInProgress,
    FileLockFailed,
    InitiateFailed,
    Incomplete,
    UploadError,
    CoordinatorUnavailable,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UploadInProgress => "upload_in_progress",
            ErrorCode::FileLockFailed => "file_lock_failed",
            ErrorCode::InitiateFailed => "initiate_failed",
            ErrorCode::Incomplete => "incomplete",
            ErrorCode::UploadError => "upload_error",
            ErrorCode::CoordinatorUnavailable => "coordinator_unavailable",
        }
    }
}

/// The kernel-wide error type.
///
/// Variants map 1:1 onto the error kinds enumerated in the upload agent
/// specification's error handling section, so the Supervisor can classify
/// an outcome without re-deriving it from a formatted string.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("another upload is already in progress")]
    UploadInProgress,

    #[error("failed to lock file {path}: {message}")]
    FileLockFailed { path: String, message: String },

    #[error("file fingerprint mismatch: file has changed since the job was created")]
    FingerprintMismatch,

    #[error("coordinator unavailable: {message}")]
    CoordinatorUnavailable { message: String },

    #[error("coordinator rejected initiate: {message}")]
    InitiateFailed { message: String },

    #[error("upload incomplete: {completed}/{total} parts completed")]
    Incomplete { completed: u32, total: u32 },

    #[error("{message}")]
    UploadError { message: String },

    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("storage/coordinator returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("state store error: {message}")]
    StateStore { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl AgentError {
    /// The wire error code this variant surfaces on an `error` frame.
    pub fn code(&self) -> ErrorCode {
        match self {
            AgentError::UploadInProgress => ErrorCode::UploadInProgress,
            AgentError::FileLockFailed { .. } => ErrorCode::FileLockFailed,
            AgentError::InitiateFailed { .. } => ErrorCode::InitiateFailed,
            AgentError::Incomplete { .. } => ErrorCode::Incomplete,
            AgentError::CoordinatorUnavailable { .. } => ErrorCode::CoordinatorUnavailable,
            AgentError::FingerprintMismatch
            | AgentError::UploadError { .. }
            | AgentError::Network { .. }
            | AgentError::Api { .. }
            | AgentError::StateStore { .. }
            | AgentError::Internal { .. }
            | AgentError::Cancelled => ErrorCode::UploadError,
        }
    }

    /// Whether this failure is transient and eligible for the worker pool's
    /// inline retry-with-backoff loop (5xx, 408, 429, or a bare network error).
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Network { .. } => true,
            AgentError::Api { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Process exit codes for the CLI boundary, following the same convention
/// (0 success, >=2 for specific failure classes) used across this codebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    InvalidArguments = 2,
    RemoteError = 5,
    InternalError = 6,
}

impl ExitCode {
    pub fn from_error(err: &anyhow::Error) -> Self {
        if let Some(agent_err) = err.downcast_ref::<AgentError>() {
            return match agent_err {
                AgentError::CoordinatorUnavailable { .. }
                | AgentError::InitiateFailed { .. }
                | AgentError::Network { .. }
                | AgentError::Api { .. } => ExitCode::RemoteError,
                AgentError::FileLockFailed { .. } | AgentError::FingerprintMismatch => {
                    ExitCode::InvalidArguments
                }
                _ => ExitCode::InternalError,
            };
        }
        ExitCode::InternalError
    }

    pub fn exit(self) -> ! {
        std::process::exit(self as i32)
    }
}
