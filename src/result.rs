//! Command result synchronization.
//!
//! A [`CommandResult`] is created the instant a backend channel is
//! opened, before any output exists. It starts out pending and becomes
//! resolved once the end-of-command sentinel is observed on its record
//! queue. Resolution happens either eagerly (a background task drains
//! the queue right after dispatch, when the session's `wait` policy is
//! on) or lazily (the first accessor that needs complete data drains
//! it). Either way there is exactly one drainer at a time, and only
//! the drain loop ever writes the accumulated output.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::Mutex;

use crate::record::{RecordQueue, StreamRecord};

/// Accumulated state of one command, written only by the drain loop.
#[derive(Debug, Default)]
struct ResultState {
    stdout: Vec<String>,
    stderr: Vec<String>,
    exit_code: Option<i32>,
    resolved: bool,
}

/// The outcome of one dispatched command.
///
/// Pending until the control records arrive; every accessor that needs
/// complete data drains the queue first, so reading a result after the
/// underlying command finished long ago never deadlocks.
#[derive(Debug)]
pub struct CommandResult {
    session: Arc<str>,
    command: Arc<str>,
    state: Arc<StdMutex<ResultState>>,
    queue: Arc<Mutex<Option<RecordQueue>>>,
}

impl CommandResult {
    /// Wrap a freshly opened record queue. One result per command.
    pub(crate) fn new(session: &str, command: &str, queue: RecordQueue) -> Self {
        Self {
            session: Arc::from(session),
            command: Arc::from(command),
            state: Arc::new(StdMutex::new(ResultState::default())),
            queue: Arc::new(Mutex::new(Some(queue))),
        }
    }

    /// The command text this result belongs to.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Start draining on a background task (eager resolution).
    ///
    /// The caller is not blocked; by the time the result is inspected
    /// it is typically already resolved.
    pub(crate) fn spawn_eager_drain(&self) {
        let session = Arc::clone(&self.session);
        let queue = Arc::clone(&self.queue);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            drain(&session, &queue, &state).await;
        });
    }

    /// Drain the queue to completion.
    ///
    /// Returns once the result is resolved. If an eager drain task is
    /// already running, this waits for it to finish instead of
    /// consuming records itself.
    pub async fn wait(&self) {
        drain(&self.session, &self.queue, &self.state).await;
    }

    /// The resolved exit code, draining first if necessary.
    ///
    /// Returns `-1` if the producer side vanished without ever
    /// publishing a control record.
    pub async fn exit_code(&self) -> i32 {
        self.wait().await;
        self.lock_state().exit_code.unwrap_or(-1)
    }

    /// Complete stdout as a single string, lines joined with `\n`.
    ///
    /// Forces drain-to-completion: stdout is only complete once the
    /// stream has fully ended.
    pub async fn text(&self) -> String {
        self.wait().await;
        self.lock_state().stdout.join("\n")
    }

    /// Complete stderr as a single string, lines joined with `\n`.
    pub async fn stderr_text(&self) -> String {
        self.wait().await;
        self.lock_state().stderr.join("\n")
    }

    /// Complete stdout, one entry per line, in production order.
    pub async fn stdout_lines(&self) -> Vec<String> {
        self.wait().await;
        self.lock_state().stdout.clone()
    }

    /// Complete stderr, one entry per line, in production order.
    pub async fn stderr_lines(&self) -> Vec<String> {
        self.wait().await;
        self.lock_state().stderr.clone()
    }

    /// The exit code if already resolved, without draining.
    pub fn try_exit_code(&self) -> Option<i32> {
        let st = self.lock_state();
        if st.resolved {
            Some(st.exit_code.unwrap_or(-1))
        } else {
            st.exit_code
        }
    }

    /// Whether the end-of-command sentinel has been observed.
    pub fn is_resolved(&self) -> bool {
        self.lock_state().resolved
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ResultState> {
        // The lock is only held for plain field access; a poisoned
        // guard still carries consistent data.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The single-consumer drain loop.
///
/// Takes the queue slot's lock for the whole drain, so a second caller
/// blocks until the in-flight drain resolves the result, then finds
/// the slot empty and returns immediately.
async fn drain(
    session: &str,
    queue: &Arc<Mutex<Option<RecordQueue>>>,
    state: &Arc<StdMutex<ResultState>>,
) {
    let mut slot = queue.lock().await;
    let Some(rx) = slot.as_mut() else {
        return;
    };
    loop {
        let record = rx.recv().await;
        let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
        match record {
            Some(StreamRecord::Stdout(line)) => {
                tracing::debug!(session, stream = "stdout", "{line}");
                st.stdout.push(line);
            }
            Some(StreamRecord::Stderr(line)) => {
                tracing::debug!(session, stream = "stderr", "{line}");
                st.stderr.push(line);
            }
            Some(StreamRecord::ExitCode(code)) => {
                st.exit_code = Some(code);
            }
            Some(StreamRecord::End) => {
                st.resolved = true;
                break;
            }
            None => {
                // Producers died without a control record. Resolve
                // anyway so readers do not hang forever.
                tracing::warn!(session, "record channel closed without control record");
                st.resolved = true;
                break;
            }
        }
    }
    *slot = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{record_channel, OutputStream, RecordSender};

    fn finished(tx: &RecordSender, code: i32) {
        tx.exit_code(code);
        tx.end();
    }

    #[tokio::test]
    async fn test_pending_until_end_record() {
        let (tx, rx) = record_channel();
        let result = CommandResult::new("s", "true", rx);

        assert!(!result.is_resolved());
        assert_eq!(result.try_exit_code(), None);

        finished(&tx, 0);
        assert_eq!(result.exit_code().await, 0);
        assert!(result.is_resolved());
        assert_eq!(result.try_exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_streams_accumulate_in_order() {
        let (tx, rx) = record_channel();
        let result = CommandResult::new("s", "noisy", rx);

        tx.line(OutputStream::Stdout, "out 1".into());
        tx.line(OutputStream::Stderr, "err 1".into());
        tx.line(OutputStream::Stdout, "out 2".into());
        tx.line(OutputStream::Stderr, "err 2".into());
        finished(&tx, 0);

        assert_eq!(result.stdout_lines().await, vec!["out 1", "out 2"]);
        assert_eq!(result.stderr_lines().await, vec!["err 1", "err 2"]);
        assert_eq!(result.text().await, "out 1\nout 2");
        assert_eq!(result.stderr_text().await, "err 1\nerr 2");
    }

    #[tokio::test]
    async fn test_wait_is_idempotent() {
        let (tx, rx) = record_channel();
        let result = CommandResult::new("s", "true", rx);
        finished(&tx, 0);

        result.wait().await;
        result.wait().await;
        assert_eq!(result.exit_code().await, 0);
    }

    #[tokio::test]
    async fn test_eager_drain_resolves_in_background() {
        let (tx, rx) = record_channel();
        let result = CommandResult::new("s", "true", rx);
        tx.line(OutputStream::Stdout, "hi".into());
        finished(&tx, 7);

        result.spawn_eager_drain();
        // The accessor still drains-or-waits correctly regardless of
        // how far the background task got.
        assert_eq!(result.exit_code().await, 7);
        assert_eq!(result.text().await, "hi");
    }

    #[tokio::test]
    async fn test_producer_death_resolves_with_sentinel_code() {
        let (tx, rx) = record_channel();
        let result = CommandResult::new("s", "crashy", rx);
        tx.line(OutputStream::Stdout, "partial".into());
        drop(tx);

        assert_eq!(result.exit_code().await, -1);
        assert!(result.is_resolved());
        assert_eq!(result.text().await, "partial");
    }

    #[tokio::test]
    async fn test_read_long_after_completion() {
        let (tx, rx) = record_channel();
        let result = CommandResult::new("s", "echo done", rx);
        tx.line(OutputStream::Stdout, "done".into());
        finished(&tx, 0);
        drop(tx);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(result.text().await, "done");
        assert_eq!(result.exit_code().await, 0);
    }
}
