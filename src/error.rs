//! Error types for unishell.

use thiserror::Error;

/// Main error type for unishell operations.
#[derive(Error, Debug)]
pub enum ShellError {
    /// The transport connection could not be established or obtained.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Channel setup or initial read exceeded its time bound.
    ///
    /// This is distinct from a command exiting non-zero: the command's
    /// fate is unknown, the transport simply stopped answering in time.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A command resolved with a non-zero exit code and `check_xc` was set.
    #[error("'{command}' terminated with exit code {exit_code}")]
    CommandFailed {
        /// The command text as dispatched.
        command: String,
        /// The resolved non-zero exit code.
        exit_code: i32,
    },

    /// A command produced stderr output and `check_err` was set.
    #[error("'{command}' wrote to stderr: {stderr}")]
    UnexpectedStderr {
        /// The command text as dispatched.
        command: String,
        /// The captured stderr content.
        stderr: String,
    },

    /// The remote platform could not be classified for a permission
    /// operation. Recoverable: the caller may retry after classifying
    /// the host manually.
    #[error("unsupported platform for permission detection")]
    UnsupportedPlatform,

    /// A mandatory tool probe found none of the candidate executables.
    #[error("no usable command found, tried {candidates:?}")]
    ToolNotFound {
        /// The executable names that were probed, in order.
        candidates: Vec<String>,
    },

    /// A session URI could not be parsed or uses an unknown scheme.
    #[error("invalid shell URI '{uri}': {reason}")]
    InvalidUri {
        /// The URI as given.
        uri: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A permission query or update on a path failed.
    #[error("permission operation failed for '{path}': {reason}")]
    Permissions {
        /// The path the operation targeted.
        path: String,
        /// Why it failed.
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH transport error.
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    /// Serial transport error.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// Convenience Result type for unishell operations.
pub type Result<T> = std::result::Result<T, ShellError>;
