//! Stream records and the order-preserving result queue.
//!
//! Every dispatched command gets exactly one record channel. The two
//! stream readers and the completion watcher are its producers; the
//! [`CommandResult`](crate::CommandResult) drain loop is its only
//! consumer. Delivery is FIFO across producers, so per-stream line
//! order is preserved and the control records arrive last as long as
//! producers respect the send protocol ([`RecordSender::exit_code`]
//! then [`RecordSender::end`], after both stream pumps have finished).

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// Identifies which stream a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One entry in a command's result queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRecord {
    /// A line of standard output.
    Stdout(String),
    /// A line of standard error.
    Stderr(String),
    /// Control record: the command's exit code is known.
    ExitCode(i32),
    /// Control record: nothing further will be produced.
    ///
    /// Emitted only after [`StreamRecord::ExitCode`].
    End,
}

/// Producer half of a command's record channel.
///
/// Cheap to clone; one clone per stream reader plus one for the
/// completion watcher.
#[derive(Debug, Clone)]
pub struct RecordSender {
    tx: mpsc::UnboundedSender<StreamRecord>,
}

impl RecordSender {
    /// Publish a line tagged with its stream identity.
    pub fn line(&self, stream: OutputStream, line: String) {
        let record = match stream {
            OutputStream::Stdout => StreamRecord::Stdout(line),
            OutputStream::Stderr => StreamRecord::Stderr(line),
        };
        // A dropped consumer means the result was discarded; output for
        // a discarded result is discarded too.
        let _ = self.tx.send(record);
    }

    /// Publish the resolved exit code.
    pub fn exit_code(&self, code: i32) {
        let _ = self.tx.send(StreamRecord::ExitCode(code));
    }

    /// Publish the end-of-command sentinel. Must follow [`exit_code`].
    ///
    /// [`exit_code`]: RecordSender::exit_code
    pub fn end(&self) {
        let _ = self.tx.send(StreamRecord::End);
    }
}

/// Consumer half of a command's record channel.
#[derive(Debug)]
pub struct RecordQueue {
    rx: mpsc::UnboundedReceiver<StreamRecord>,
}

impl RecordQueue {
    /// Receive the next record, waiting while the queue is empty.
    ///
    /// Returns `None` once the channel is closed and drained, which
    /// only happens early if every producer died without publishing
    /// the control records.
    pub async fn recv(&mut self) -> Option<StreamRecord> {
        self.rx.recv().await
    }
}

/// Create the record channel for one command.
pub fn record_channel() -> (RecordSender, RecordQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RecordSender { tx }, RecordQueue { rx })
}

/// Drain one async byte stream line by line into the queue.
///
/// Runs until end-of-stream. Each stream gets its own pump task so a
/// quiet stderr never starves stdout capture. Read failures terminate
/// the pump; completion is signaled by the control records, not here.
pub async fn pump_lines<R>(reader: R, stream: OutputStream, sender: RecordSender)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => sender.line(stream, line),
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(?stream, error = %err, "stream pump terminated");
                break;
            }
        }
    }
}

/// Incremental byte-to-line splitter for blocking transports.
///
/// The SSH and serial backends read raw chunks off their links; this
/// assembles them into lines with the same semantics as the async pump
/// (`\n` terminated, trailing `\r` stripped, unterminated tail flushed
/// at end-of-stream).
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning any lines completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the newline itself
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush the unterminated tail, if any. Call at end-of-stream.
    pub fn finish(self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buf).into_owned())
        }
    }
}
