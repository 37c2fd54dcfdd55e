//! Local process backend.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::ExecutionBackend;
use crate::error::Result;
use crate::record::{pump_lines, record_channel, OutputStream, RecordQueue};

/// Runs commands as local child processes under `sh -c`.
///
/// The process's own exit status is the completion source. The working
/// directory is set natively on the child rather than by wrapping the
/// command text.
#[derive(Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    /// Create a local backend. No connection to establish.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn open(
        &self,
        command: &str,
        cwd: Option<&str>,
        _timeout: Option<Duration>,
    ) -> Result<RecordQueue> {
        // A local spawn either fails immediately or succeeds; the
        // setup timeout has nothing to bound here.
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;

        let (tx, queue) = record_channel();
        let out_task = tokio::spawn(pump_lines(stdout, OutputStream::Stdout, tx.clone()));
        let err_task = tokio::spawn(pump_lines(stderr, OutputStream::Stderr, tx.clone()));

        // Completion watcher: the exit code is published only after
        // both stream pumps have seen end-of-stream, so the control
        // records are always the last entries in the queue.
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = out_task.await;
            let _ = err_task.await;
            let code = match status {
                Ok(status) => exit_code_of(status),
                Err(err) => {
                    tracing::warn!(error = %err, "waiting on local child failed");
                    -1
                }
            };
            tx.exit_code(code);
            tx.end();
        });

        Ok(queue)
    }

    async fn pull_bytes(&self, local: &Path, remote: &str) -> Result<()> {
        tokio::fs::copy(remote, local).await?;
        Ok(())
    }

    async fn push_bytes(&self, local: &Path, remote: &str) -> Result<()> {
        tokio::fs::copy(local, remote).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        // Killed by a signal: report the conventional 128 + signo.
        None => 128 + status.signal().unwrap_or(0),
    }
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
