//! SSH backend over libssh2.
//!
//! One authenticated [`ssh2::Session`] per backend, established
//! synchronously at construction. Commands run on exec channels; file
//! transfers use libssh2's built-in SCP. libssh2 serializes all I/O on
//! a session behind one lock, so commands on an SSH session execute
//! one at a time: the session mutex is held for a command's full
//! lifetime. Within a command the stdout and stderr streams are
//! polled non-blocking in one loop, so a quiet stream never starves
//! the other.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;

use super::ExecutionBackend;
use crate::command::wrap_cwd;
use crate::error::{Result, ShellError};
use crate::record::{record_channel, LineAssembler, OutputStream, RecordQueue, RecordSender};

/// libssh2's session-level timeout error code.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Poll interval while both channel streams are quiet.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

const READ_BUFFER_SIZE: usize = 4096;

/// Connection parameters for an SSH session.
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    /// Remote host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Login user; defaults to `$USER` when unset.
    pub username: Option<String>,
    /// Password; agent authentication is tried when unset.
    pub password: Option<String>,
    /// Bound on TCP connect and handshake.
    pub connect_timeout: Option<Duration>,
}

/// Runs commands over an authenticated SSH connection.
pub struct SshBackend {
    session: Arc<Mutex<Session>>,
}

impl std::fmt::Debug for SshBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshBackend").finish_non_exhaustive()
    }
}

impl SshBackend {
    /// Establish the TCP connection, handshake and authenticate.
    ///
    /// Fails with [`ShellError::Connection`] if any stage cannot be
    /// completed; nothing is retried internally.
    pub async fn connect(config: SshConfig) -> Result<Self> {
        let session = tokio::task::spawn_blocking(move || establish(&config))
            .await
            .map_err(|err| ShellError::Connection(format!("ssh connect task: {err}")))??;
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
        })
    }

    fn session(&self) -> Arc<Mutex<Session>> {
        Arc::clone(&self.session)
    }
}

#[async_trait]
impl ExecutionBackend for SshBackend {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn open(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<RecordQueue> {
        let composed = wrap_cwd(command, cwd);
        let session = self.session();
        let (tx, queue) = record_channel();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<Result<()>>();

        tokio::task::spawn_blocking(move || {
            let guard = session.lock().unwrap_or_else(PoisonError::into_inner);
            // The setup timeout bounds channel open and exec; the
            // command itself runs unbounded afterwards.
            guard.set_timeout(timeout.map_or(0, |t| t.as_millis() as u32));

            let channel = guard
                .channel_session()
                .map_err(|err| classify("channel open", err))
                .and_then(|mut chan| {
                    chan.exec(&composed).map_err(|err| classify("exec", err))?;
                    Ok(chan)
                });
            let mut channel = match channel {
                Ok(chan) => {
                    let _ = ready_tx.send(Ok(()));
                    chan
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };

            guard.set_blocking(false);
            pump_channel(&mut channel, &tx);
            guard.set_blocking(true);
            guard.set_timeout(0);

            let _ = channel.wait_close();
            let code = channel.exit_status().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "could not read remote exit status");
                -1
            });
            tx.exit_code(code);
            tx.end();
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(queue),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ShellError::Connection("ssh worker died".to_string())),
        }
    }

    async fn pull_bytes(&self, local: &Path, remote: &str) -> Result<()> {
        let session = self.session();
        let remote = PathBuf::from(remote);
        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let guard = session.lock().unwrap_or_else(PoisonError::into_inner);
            let (mut channel, stat) = guard.scp_recv(&remote)?;
            let mut bytes = Vec::with_capacity(stat.size() as usize);
            (&mut channel).take(stat.size()).read_to_end(&mut bytes)?;
            let _ = channel.send_eof();
            let _ = channel.wait_close();
            Ok(bytes)
        })
        .await
        .map_err(|err| ShellError::Connection(format!("scp task: {err}")))??;
        tokio::fs::write(local, bytes).await?;
        Ok(())
    }

    async fn push_bytes(&self, local: &Path, remote: &str) -> Result<()> {
        let bytes = tokio::fs::read(local).await?;
        let session = self.session();
        let remote = PathBuf::from(remote);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let guard = session.lock().unwrap_or_else(PoisonError::into_inner);
            // Modes travel separately: the session layer mirrors the
            // source mode with chmod after the bytes land.
            let mut channel = guard.scp_send(&remote, 0o644, bytes.len() as u64, None)?;
            channel.write_all(&bytes)?;
            let _ = channel.send_eof();
            let _ = channel.wait_eof();
            let _ = channel.wait_close();
            Ok(())
        })
        .await
        .map_err(|err| ShellError::Connection(format!("scp task: {err}")))?
    }

    async fn disconnect(&self) -> Result<()> {
        let session = self.session();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let guard = session.lock().unwrap_or_else(PoisonError::into_inner);
            guard.disconnect(None, "session closed", None)?;
            Ok(())
        })
        .await
        .map_err(|err| ShellError::Connection(format!("disconnect task: {err}")))?
    }
}

fn establish(config: &SshConfig) -> Result<Session> {
    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|err| ShellError::Connection(format!("resolve {}: {err}", config.host)))?
        .next()
        .ok_or_else(|| ShellError::Connection(format!("no address for {}", config.host)))?;

    let stream = match config.connect_timeout {
        Some(bound) => TcpStream::connect_timeout(&addr, bound).map_err(|err| {
            if err.kind() == std::io::ErrorKind::TimedOut {
                ShellError::Timeout(format!("connect to {addr}"))
            } else {
                ShellError::Connection(format!("connect to {addr}: {err}"))
            }
        })?,
        None => TcpStream::connect(addr)
            .map_err(|err| ShellError::Connection(format!("connect to {addr}: {err}")))?,
    };

    let mut session = Session::new().map_err(|err| classify("session init", err))?;
    session.set_tcp_stream(stream);
    session
        .handshake()
        .map_err(|err| classify("handshake", err))?;

    let username = match &config.username {
        Some(user) => user.clone(),
        None => std::env::var("USER")
            .map_err(|_| ShellError::Connection("no username given and $USER unset".to_string()))?,
    };
    match &config.password {
        Some(password) => session
            .userauth_password(&username, password)
            .map_err(|err| classify("password auth", err))?,
        None => session
            .userauth_agent(&username)
            .map_err(|err| classify("agent auth", err))?,
    }
    if !session.authenticated() {
        return Err(ShellError::Connection(format!(
            "authentication failed for {username}"
        )));
    }
    Ok(session)
}

/// Drain both channel streams in one non-blocking poll loop.
///
/// Each stream keeps its own line assembler so per-stream order is
/// exact while the two interleave freely in the queue. Stream 0 is
/// read through the channel's own `Read` impl; the stderr stream
/// object borrows the channel mutably, so it is constructed
/// transiently per poll.
fn pump_channel(channel: &mut ssh2::Channel, tx: &RecordSender) {
    let mut out_asm = LineAssembler::new();
    let mut err_asm = LineAssembler::new();
    let mut out_done = false;
    let mut err_done = false;
    let mut buf = [0u8; READ_BUFFER_SIZE];

    while !(out_done && err_done) {
        let mut progressed = false;
        if !out_done {
            progressed |= poll_stream(
                channel,
                &mut out_asm,
                OutputStream::Stdout,
                tx,
                &mut buf,
                &mut out_done,
            );
        }
        if !err_done {
            progressed |= poll_stream(
                &mut channel.stderr(),
                &mut err_asm,
                OutputStream::Stderr,
                tx,
                &mut buf,
                &mut err_done,
            );
        }
        if !progressed {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    if let Some(tail) = out_asm.finish() {
        tx.line(OutputStream::Stdout, tail);
    }
    if let Some(tail) = err_asm.finish() {
        tx.line(OutputStream::Stderr, tail);
    }
}

fn poll_stream<R: Read>(
    stream: &mut R,
    assembler: &mut LineAssembler,
    kind: OutputStream,
    tx: &RecordSender,
    buf: &mut [u8],
    done: &mut bool,
) -> bool {
    match stream.read(buf) {
        Ok(0) => {
            *done = true;
            true
        }
        Ok(n) => {
            for line in assembler.push(&buf[..n]) {
                tx.line(kind, line);
            }
            true
        }
        Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(err) => {
            tracing::debug!(stream = ?kind, error = %err, "ssh stream read failed");
            *done = true;
            true
        }
    }
}

fn classify(stage: &str, err: ssh2::Error) -> ShellError {
    match err.code() {
        ssh2::ErrorCode::Session(code) if code == LIBSSH2_ERROR_TIMEOUT => {
            ShellError::Timeout(format!("ssh {stage}"))
        }
        _ => ShellError::Connection(format!("ssh {stage}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_timeout_is_distinct() {
        let err = ssh2::Error::new(
            ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT),
            "timed out",
        );
        assert!(matches!(
            classify("channel open", err),
            ShellError::Timeout(_)
        ));
    }

    #[test]
    fn test_classify_other_is_connection() {
        let err = ssh2::Error::new(ssh2::ErrorCode::Session(-7), "socket gone");
        assert!(matches!(classify("exec", err), ShellError::Connection(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_surfaces_connection_error() {
        // Port 1 on localhost is essentially never listening.
        let config = SshConfig {
            host: "127.0.0.1".into(),
            port: 1,
            connect_timeout: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let err = SshBackend::connect(config).await.unwrap_err();
        assert!(matches!(
            err,
            ShellError::Connection(_) | ShellError::Timeout(_)
        ));
    }
}
