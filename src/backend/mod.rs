//! Transport backends.
//!
//! A backend is the concrete executor of a command: a local process, an
//! SSH channel, or a serial sub-session. Each one satisfies the same
//! [`ExecutionBackend`] contract, so the session layer never knows
//! which transport it is talking to.

mod local;
mod serial;
mod ssh;

pub use local::LocalBackend;
pub use serial::{SerialBackend, SerialConfig};
pub use ssh::{SshBackend, SshConfig};

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::record::RecordQueue;
use crate::uri::ShellUri;

/// The abstract execution contract every transport satisfies.
///
/// `open` starts the command and wires its stdout, stderr and
/// completion source into a fresh record queue; the caller consumes
/// the queue through a [`CommandResult`](crate::CommandResult).
/// Opening a channel consumes one transport resource (process handle,
/// SSH channel, serial sub-session) which is released once the stream
/// readers and the completion watcher have finished.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short transport name for logging (`local`, `ssh`, `serial`).
    fn name(&self) -> &'static str;

    /// Execute a composed command, returning its record queue.
    ///
    /// `timeout` bounds channel setup and initial reads only; it does
    /// not kill a long-running command. The transport applies its own
    /// working-directory wrapping for `cwd`.
    async fn open(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<RecordQueue>;

    /// Copy raw bytes from `remote` on the transport's far side to the
    /// `local` file. Permission mirroring happens a layer above.
    async fn pull_bytes(&self, local: &Path, remote: &str) -> Result<()>;

    /// Copy raw bytes from the `local` file to `remote` on the
    /// transport's far side.
    async fn push_bytes(&self, local: &Path, remote: &str) -> Result<()>;

    /// Release the transport connection.
    async fn disconnect(&self) -> Result<()>;
}

/// Build the backend a parsed URI asks for.
///
/// Remote transports connect synchronously here; a connection failure
/// surfaces immediately rather than on first use.
pub(crate) async fn from_uri(
    uri: &ShellUri,
    connect_timeout: Option<Duration>,
) -> Result<Box<dyn ExecutionBackend>> {
    match uri {
        ShellUri::Local => Ok(Box::new(LocalBackend::new())),
        ShellUri::Ssh {
            host,
            port,
            username,
            password,
        } => {
            let config = SshConfig {
                host: host.clone(),
                port: *port,
                username: username.clone(),
                password: password.clone(),
                connect_timeout,
            };
            Ok(Box::new(SshBackend::connect(config).await?))
        }
        ShellUri::Serial { device, baudrate } => {
            let config = SerialConfig {
                device: device.clone(),
                baudrate: *baudrate,
                read_timeout: connect_timeout,
            };
            Ok(Box::new(SerialBackend::connect(config).await?))
        }
    }
}
