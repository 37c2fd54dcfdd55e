//! Serial line backend.
//!
//! A raw serial link has no native exit-status channel, so completion
//! is inferred through a framing protocol: every dispatched command is
//! suffixed with `; echo <token> $?`, where `<token>` is a fresh
//! random token per command. The line consisting of exactly the token
//! followed by an integer is the control record. The console's echo of
//! the dispatched line also contains the token but never matches that
//! shape, and is suppressed from the output.
//!
//! The port is held locked for a command's entire lifetime, so
//! commands on one serial session execute strictly one at a time.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serialport::SerialPort;
use tokio::sync::oneshot;

use super::ExecutionBackend;
use crate::command::wrap_cwd;
use crate::error::{Result, ShellError};
use crate::record::{record_channel, LineAssembler, OutputStream, RecordQueue, RecordSender};

/// How long a single poll read waits before the loop spins again.
const POLL_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Payload bytes of encoded text per push command.
const PUSH_CHUNK_SIZE: usize = 512;

const READ_BUFFER_SIZE: usize = 256;

/// Connection parameters for a serial session.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial device path (`/dev/ttyUSB0`, `COM3`, ...).
    pub device: String,
    /// Line speed.
    pub baudrate: u32,
    /// Bound on the first read after dispatching a command.
    pub read_timeout: Option<Duration>,
}

/// Runs commands over a serial console assumed to sit at a ready
/// shell prompt. Login negotiation is not part of this backend.
pub struct SerialBackend {
    port: Arc<Mutex<Box<dyn SerialPort>>>,
    read_timeout: Option<Duration>,
}

impl std::fmt::Debug for SerialBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialBackend").finish_non_exhaustive()
    }
}

impl SerialBackend {
    /// Open the serial device.
    pub async fn connect(config: SerialConfig) -> Result<Self> {
        let read_timeout = config.read_timeout;
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&config.device, config.baudrate)
                .timeout(POLL_READ_TIMEOUT)
                .open()
        })
        .await
        .map_err(|err| ShellError::Connection(format!("serial open task: {err}")))??;
        Ok(Self {
            port: Arc::new(Mutex::new(port)),
            read_timeout,
        })
    }

    /// Run a command over the link and capture its stdout.
    async fn run_capture(&self, command: &str) -> Result<(i32, Vec<String>)> {
        let mut queue = self.open(command, None, None).await?;
        let mut lines = Vec::new();
        let mut code = -1;
        while let Some(record) = queue.recv().await {
            match record {
                crate::record::StreamRecord::Stdout(line) => lines.push(line),
                crate::record::StreamRecord::ExitCode(c) => code = c,
                crate::record::StreamRecord::End => break,
                crate::record::StreamRecord::Stderr(_) => {}
            }
        }
        Ok((code, lines))
    }

    async fn run_checked(&self, command: &str) -> Result<Vec<String>> {
        let (code, lines) = self.run_capture(command).await?;
        if code != 0 {
            return Err(ShellError::CommandFailed {
                command: command.to_string(),
                exit_code: code,
            });
        }
        Ok(lines)
    }
}

#[async_trait]
impl ExecutionBackend for SerialBackend {
    fn name(&self) -> &'static str {
        "serial"
    }

    async fn open(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<RecordQueue> {
        let token = sentinel_token();
        let framed = format!(
            "{}; echo {token} $?\n",
            wrap_cwd(command, cwd)
        );
        let port = Arc::clone(&self.port);
        let initial_bound = timeout.or(self.read_timeout);
        let (tx, queue) = record_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        tokio::task::spawn_blocking(move || {
            let mut guard = port.lock().unwrap_or_else(PoisonError::into_inner);
            drive_command(&mut *guard, &framed, &token, initial_bound, tx, ready_tx);
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(queue),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ShellError::Connection("serial worker died".to_string())),
        }
    }

    async fn pull_bytes(&self, local: &Path, remote: &str) -> Result<()> {
        let lines = self.run_checked(&format!("base64 '{remote}'")).await?;
        let encoded: String = lines.concat();
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|err| std::io::Error::other(format!("remote base64 output: {err}")))?;
        tokio::fs::write(local, bytes).await?;
        Ok(())
    }

    async fn push_bytes(&self, local: &Path, remote: &str) -> Result<()> {
        let bytes = tokio::fs::read(local).await?;
        let encoded = BASE64.encode(&bytes);
        let staging = format!("{remote}.b64");

        self.run_checked(&format!(": > '{staging}'")).await?;
        for chunk in encoded.as_bytes().chunks(PUSH_CHUNK_SIZE) {
            let text = std::str::from_utf8(chunk)
                .map_err(|err| std::io::Error::other(format!("base64 chunking: {err}")))?;
            self.run_checked(&format!("echo '{text}' >> '{staging}'"))
                .await?;
        }
        self.run_checked(&format!(
            "base64 -d '{staging}' > '{remote}' && rm -f '{staging}'"
        ))
        .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // Dropping the port closes the device; nothing to negotiate.
        Ok(())
    }
}

/// Dispatch one framed command over the link and pump its output.
///
/// The ready channel reports dispatch outcome: a write failure is an
/// error, an expired initial-read bound is [`ShellError::Timeout`],
/// and the first byte of output (or a successful write when no bound
/// is set) is success. After ready has fired, link failures terminate
/// the pump and the result resolves through the record channel.
fn drive_command<L: Read + Write + ?Sized>(
    link: &mut L,
    framed: &str,
    token: &str,
    initial_bound: Option<Duration>,
    tx: RecordSender,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let dispatched = link.write_all(framed.as_bytes());
    if let Err(err) = dispatched.and_then(|()| link.flush()) {
        let _ = ready_tx.send(Err(err.into()));
        return;
    }
    let mut ready_tx = Some(ready_tx);
    if initial_bound.is_none() {
        // Nothing left to bound; the caller can proceed.
        if let Some(ready) = ready_tx.take() {
            let _ = ready.send(Ok(()));
        }
    }

    let mut assembler = LineAssembler::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let started = Instant::now();
    let mut seen_data = false;

    loop {
        match link.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                seen_data = true;
                if let Some(ready) = ready_tx.take() {
                    let _ = ready.send(Ok(()));
                }
                for line in assembler.push(&buf[..n]) {
                    if let Some(code) = parse_sentinel(&line, token) {
                        tx.exit_code(code);
                        tx.end();
                        return;
                    }
                    if line.contains(token) {
                        // Console echo of the dispatched line.
                        continue;
                    }
                    tx.line(OutputStream::Stdout, line);
                }
            }
            Err(ref err)
                if err.kind() == std::io::ErrorKind::TimedOut
                    || err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                match ready_tx.take() {
                    Some(ready) => {
                        let _ = ready.send(Err(err.into()));
                    }
                    None => tracing::warn!(error = %err, "serial read failed"),
                }
                return;
            }
        }
        if !seen_data {
            if let Some(bound) = initial_bound {
                if started.elapsed() > bound {
                    if let Some(ready) = ready_tx.take() {
                        let _ = ready.send(Err(ShellError::Timeout(format!(
                            "no serial output within {bound:?}"
                        ))));
                    }
                    return;
                }
            }
        }
    }
}

/// A fresh random completion token. 32 hex characters cannot collide
/// with legitimate output short of the command echoing the token back.
fn sentinel_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Recognize the completion control line: the token, whitespace, and
/// an integer exit code, nothing else.
fn parse_sentinel(line: &str, token: &str) -> Option<i32> {
    let rest = line.trim().strip_prefix(token)?;
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    rest.parse().ok()
}
