//! Error taxonomy for the transfer engine.
//!
//! Engine components return [`TransferError`]; the binary wraps them in
//! `anyhow` at the application edge. Nothing here is retried: every variant
//! is fatal for the step that produced it.

use std::io;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The remote target could not be reached. No bytes were exchanged.
    #[error("cannot reach {target}: {message}")]
    Connection { target: String, message: String },

    /// The remote process ran and exited non-zero.
    #[error("command `{command}` failed on {target} (status {status}): {stderr}")]
    Command {
        target: String,
        command: String,
        status: i32,
        stderr: String,
    },

    /// Output did not have the expected shape.
    #[error("unexpected {what} output: {output:?}")]
    Parse { what: String, output: String },

    /// The remote side reported the path missing.
    #[error("{path} not found on {target}")]
    NotFound { target: String, path: String },

    /// A chunk or part failed after the channel itself worked.
    #[error("transfer of {what} failed: {message}")]
    Transfer { what: String, message: String },

    /// Initiate, complete or abort of a multipart session failed.
    #[error("object store {operation} failed: {message}")]
    StorageProtocol { operation: String, message: String },

    #[error("command `{command}` on {target} timed out after {secs}s")]
    Timeout {
        target: String,
        command: String,
        secs: u64,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// Short stable label, recorded in step records and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Command { .. } => "command",
            Self::Parse { .. } => "parse",
            Self::NotFound { .. } => "not_found",
            Self::Transfer { .. } => "transfer",
            Self::StorageProtocol { .. } => "storage_protocol",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Io(_) => "io",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub(crate) fn transfer(what: impl Into<String>, message: impl ToString) -> Self {
        Self::Transfer {
            what: what.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn storage(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::StorageProtocol {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}
