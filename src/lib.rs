//! # unishell
//!
//! One uniform way to run a shell command and retrieve its output and
//! exit status, whether the command runs on the local machine, over an
//! SSH connection, or over a serial line.
//!
//! Transports hide behind a single [`ShellSession`] API. Each
//! dispatched command captures stdout and stderr concurrently without
//! losing per-stream ordering, and hands back a [`CommandResult`]
//! that can be consumed eagerly or drained lazily on first access.
//!
//! ## Features
//!
//! - **Transport-agnostic execution**: local processes, SSH channels
//!   and serial consoles behind one session type
//! - **Ordered capture**: per-stream line order is exact even while
//!   the two streams interleave
//! - **Failure policy**: opt-in raising on non-zero exit codes
//!   (`check_xc`) or on any stderr output (`check_err`)
//! - **Permission-preserving transfers**: push/pull keep mode bits
//!   across platforms
//!
//! ## Quick Start
//!
//! ```no_run
//! use unishell::{CallOpts, ShellSession};
//!
//! #[tokio::main]
//! async fn main() -> unishell::Result<()> {
//!     // Initialize logging
//!     unishell::logging::try_init().ok();
//!
//!     let session = ShellSession::connect("local://").await?;
//!
//!     let result = session.call("echo Hello World").await?;
//!     assert_eq!(result.text().await, "Hello World");
//!     assert_eq!(result.exit_code().await, 0);
//!
//!     // Per-call environment override and policy
//!     let opts = CallOpts::new().env("FOO", "foo").check_xc(true);
//!     let result = session.call_with("echo $FOO", opts).await?;
//!     assert_eq!(result.text().await, "foo");
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod command;
pub mod error;
pub mod logging;
pub mod record;
pub mod result;
pub mod session;
pub mod uri;

// Re-export commonly used types
pub use backend::{
    ExecutionBackend, LocalBackend, SerialBackend, SerialConfig, SshBackend, SshConfig,
};
pub use command::CallOpts;
pub use error::{Result, ShellError};
pub use record::{OutputStream, StreamRecord};
pub use result::CommandResult;
pub use session::{OsType, SessionConfig, ShellSession};
pub use uri::ShellUri;
