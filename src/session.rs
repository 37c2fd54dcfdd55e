//! Shell sessions: dispatch, policy, platform helpers and transfers.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::backend::{
    self, ExecutionBackend, LocalBackend, SerialBackend, SerialConfig, SshBackend, SshConfig,
};
use crate::command::{compose, CallOpts};
use crate::error::{Result, ShellError};
use crate::result::CommandResult;
use crate::uri::ShellUri;

/// Default policy and environment for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Raise [`ShellError::CommandFailed`] on non-zero exit codes.
    pub check_xc: bool,
    /// Raise [`ShellError::UnexpectedStderr`] when stderr is not empty.
    pub check_err: bool,
    /// Resolve results eagerly on a background task.
    pub wait: bool,
    /// Environment entries applied to every call.
    pub env: BTreeMap<String, String>,
    /// Bound on connection establishment for remote transports.
    pub connect_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            check_xc: false,
            check_err: false,
            wait: true,
            env: BTreeMap::new(),
            connect_timeout: None,
        }
    }
}

/// Operating system classification of the shell's far side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsType {
    /// A Linux host.
    Linux,
    /// A macOS host.
    Darwin,
    /// Anything that could not be classified.
    Unknown,
}

/// A configured, connected handle through which commands are issued.
///
/// One session owns one transport connection, reused across
/// sequential calls. Local and serial transports order overlapping
/// calls internally (serial holds its port for a command's lifetime,
/// SSH holds its session lock); the session layer itself adds no
/// cross-command mutual exclusion.
pub struct ShellSession {
    backend: Box<dyn ExecutionBackend>,
    id: String,
    env: BTreeMap<String, String>,
    check_xc: bool,
    check_err: bool,
    wait: bool,
    os_type: Mutex<Option<OsType>>,
    tools: Mutex<HashMap<String, Option<String>>>,
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("id", &self.id)
            .field("transport", &self.backend.name())
            .finish_non_exhaustive()
    }
}

impl ShellSession {
    /// Connect to the transport a URI names, with default policy.
    ///
    /// Schemes: `local://`, `ssh://[user[:pass]@]host[:port]`,
    /// `serial://port[?baudrate=N]`.
    pub async fn connect(uri: &str) -> Result<Self> {
        Self::connect_with(uri, SessionConfig::default()).await
    }

    /// Connect to the transport a URI names.
    pub async fn connect_with(uri: &str, config: SessionConfig) -> Result<Self> {
        let parsed = ShellUri::parse(uri)?;
        let backend = backend::from_uri(&parsed, config.connect_timeout).await?;
        Ok(Self::from_parts(backend, config))
    }

    /// A session on the local machine, with default policy.
    pub fn local() -> Self {
        Self::local_with(SessionConfig::default())
    }

    /// A session on the local machine.
    pub fn local_with(config: SessionConfig) -> Self {
        Self::from_parts(Box::new(LocalBackend::new()), config)
    }

    /// A session over SSH, with default policy. Connects immediately.
    pub async fn ssh(ssh: SshConfig) -> Result<Self> {
        Self::ssh_with(ssh, SessionConfig::default()).await
    }

    /// A session over SSH. Connects immediately.
    pub async fn ssh_with(mut ssh: SshConfig, config: SessionConfig) -> Result<Self> {
        if ssh.connect_timeout.is_none() {
            ssh.connect_timeout = config.connect_timeout;
        }
        let backend = SshBackend::connect(ssh).await?;
        Ok(Self::from_parts(Box::new(backend), config))
    }

    /// A session over a serial line, with default policy.
    pub async fn serial(serial: SerialConfig) -> Result<Self> {
        Self::serial_with(serial, SessionConfig::default()).await
    }

    /// A session over a serial line.
    pub async fn serial_with(serial: SerialConfig, config: SessionConfig) -> Result<Self> {
        let backend = SerialBackend::connect(serial).await?;
        Ok(Self::from_parts(Box::new(backend), config))
    }

    fn from_parts(backend: Box<dyn ExecutionBackend>, config: SessionConfig) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..16].to_uppercase();
        Self {
            backend,
            id,
            env: config.env,
            check_xc: config.check_xc,
            check_err: config.check_err,
            wait: config.wait,
            os_type: Mutex::new(None),
            tools: Mutex::new(HashMap::new()),
        }
    }

    /// This session's identifier, 16 hex characters.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The transport name (`local`, `ssh`, `serial`).
    pub fn transport(&self) -> &'static str {
        self.backend.name()
    }

    /// The session's default environment.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Mutable access to the session's default environment.
    pub fn env_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.env
    }

    /// Set a default environment entry for every future call.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Run a command with the session's default policy.
    pub async fn call(&self, command: &str) -> Result<CommandResult> {
        self.call_with(command, CallOpts::new()).await
    }

    /// Run a command with per-call overrides.
    ///
    /// The session environment is merged with the call's overrides
    /// (call wins), each entry is prefixed as `VAR=VAL; `, and the
    /// composed text goes to the transport. With `check_xc` the call
    /// resolves the result and fails on a non-zero exit code; with
    /// `check_err` it fails when anything was written to stderr.
    pub async fn call_with(&self, command: &str, opts: CallOpts) -> Result<CommandResult> {
        let check_xc = opts.check_xc.unwrap_or(self.check_xc);
        let check_err = opts.check_err.unwrap_or(self.check_err);
        let wait = opts.wait.unwrap_or(self.wait);

        let mut env = self.env.clone();
        env.extend(opts.env);
        let composed = compose(command, &env);

        tracing::info!(session = %self.id, transport = self.backend.name(), "$ {composed}");
        let queue = self
            .backend
            .open(&composed, opts.cwd.as_deref(), opts.timeout)
            .await?;
        let result = CommandResult::new(&self.id, command, queue);
        if wait {
            result.spawn_eager_drain();
        }

        if check_xc {
            let code = result.exit_code().await;
            if code != 0 {
                return Err(ShellError::CommandFailed {
                    command: command.to_string(),
                    exit_code: code,
                });
            }
        }
        if check_err {
            let stderr = result.stderr_text().await;
            if !stderr.is_empty() {
                return Err(ShellError::UnexpectedStderr {
                    command: command.to_string(),
                    stderr,
                });
            }
        }
        Ok(result)
    }

    /// Internal calls bypass the session's failure policy.
    fn probe_opts() -> CallOpts {
        CallOpts::new().check_xc(false).check_err(false).wait(false)
    }

    /// Probe for the first available executable among `candidates`.
    ///
    /// Each candidate is checked with `command -v`. With `mandatory`,
    /// a complete miss is [`ShellError::ToolNotFound`]; otherwise the
    /// probe returns `None`.
    pub async fn detect_command(
        &self,
        candidates: &[&str],
        mandatory: bool,
    ) -> Result<Option<String>> {
        for name in candidates {
            let result = self
                .call_with(&format!("command -v {name}"), Self::probe_opts())
                .await?;
            if result.exit_code().await == 0 && !result.text().await.trim().is_empty() {
                return Ok(Some((*name).to_string()));
            }
        }
        if mandatory {
            Err(ShellError::ToolNotFound {
                candidates: candidates.iter().map(|c| c.to_string()).collect(),
            })
        } else {
            Ok(None)
        }
    }

    /// Like [`detect_command`], but cached per logical tool name
    /// (the first candidate). The probe runs at most once per session.
    ///
    /// [`detect_command`]: ShellSession::detect_command
    pub async fn get_command(
        &self,
        candidates: &[&str],
        mandatory: bool,
    ) -> Result<Option<String>> {
        let key = match candidates.first() {
            Some(first) => (*first).to_string(),
            None => return Ok(None),
        };
        if let Some(cached) = self.lock_tools().get(&key) {
            return Ok(cached.clone());
        }
        let detected = self.detect_command(candidates, mandatory).await?;
        self.lock_tools().insert(key, detected.clone());
        Ok(detected)
    }

    /// Classify the operating system on the shell's far side.
    ///
    /// Runs `uname -s` once and caches the answer for the session's
    /// lifetime. Any failure degrades to [`OsType::Unknown`].
    pub async fn os_type(&self) -> OsType {
        if let Some(cached) = *self.lock_os() {
            return cached;
        }
        let detected = match self.call_with("uname -s", Self::probe_opts()).await {
            Ok(result) if result.exit_code().await == 0 => classify_os(&result.text().await),
            _ => OsType::Unknown,
        };
        *self.lock_os() = Some(detected);
        detected
    }

    /// Read a file's permission bits as an octal integer (e.g. 0o755).
    ///
    /// The `stat` flag conventions differ between Linux and Darwin;
    /// an unclassified platform yields
    /// [`ShellError::UnsupportedPlatform`].
    pub async fn permissions(&self, path: &str) -> Result<u32> {
        let stat_cmd = match self.os_type().await {
            OsType::Linux => format!("stat -c '%a' '{path}'"),
            OsType::Darwin => format!("stat -f '%A' '{path}'"),
            OsType::Unknown => return Err(ShellError::UnsupportedPlatform),
        };
        let result = self.call_with(&stat_cmd, Self::probe_opts()).await?;
        let code = result.exit_code().await;
        if code != 0 {
            return Err(ShellError::Permissions {
                path: path.to_string(),
                reason: format!("stat exited with {code}: {}", result.stderr_text().await),
            });
        }
        let output = result.text().await.trim().to_string();
        u32::from_str_radix(&output, 8).map_err(|_| ShellError::Permissions {
            path: path.to_string(),
            reason: format!("unexpected stat output '{output}'"),
        })
    }

    /// Set a file's permission bits with `chmod`.
    pub async fn set_permissions(&self, path: &str, mode: u32) -> Result<()> {
        let chmod = self
            .get_command(&["chmod"], true)
            .await?
            .unwrap_or_else(|| "chmod".to_string());
        let result = self
            .call_with(&format!("{chmod} {mode:o} '{path}'"), Self::probe_opts())
            .await?;
        let code = result.exit_code().await;
        if code != 0 {
            return Err(ShellError::Permissions {
                path: path.to_string(),
                reason: format!("chmod exited with {code}: {}", result.stderr_text().await),
            });
        }
        Ok(())
    }

    /// Fetch a remote file, then mirror its permission bits onto the
    /// local copy.
    ///
    /// The permission step is not transactional with the transfer: a
    /// failure between the two leaves the file transferred with
    /// default permissions.
    pub async fn pull(&self, local: impl AsRef<Path>, remote: &str) -> Result<()> {
        let local = local.as_ref();
        tracing::info!(session = %self.id, "'{}' <- '{remote}'", local.display());
        self.backend.pull_bytes(local, remote).await?;
        let mode = self.permissions(remote).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(local, std::fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        Ok(())
    }

    /// Send a local file, then set the remote copy's permission bits
    /// to match the source's mode.
    pub async fn push(&self, local: impl AsRef<Path>, remote: &str) -> Result<()> {
        let local = local.as_ref();
        tracing::info!(session = %self.id, "'{}' -> '{remote}'", local.display());
        self.backend.push_bytes(local, remote).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(local)?.permissions().mode() & 0o777;
            self.set_permissions(remote, mode).await?;
        }
        Ok(())
    }

    /// MD5 digest of a file, via whichever of `md5sum`/`md5` exists.
    ///
    /// Returns `None` when no digest tool is available (unless
    /// `mandatory`) or the file cannot be read.
    pub async fn md5(&self, path: &str, mandatory: bool) -> Result<Option<String>> {
        let Some(tool) = self.get_command(&["md5sum", "md5"], mandatory).await? else {
            return Ok(None);
        };
        let result = self
            .call_with(&format!("{tool} '{path}'"), Self::probe_opts())
            .await?;
        if result.exit_code().await != 0 {
            return Ok(None);
        }
        let text = result.text().await;
        Ok(find_md5_token(&text))
    }

    /// Hex dump of a file, via whichever of `hexdump`/`od` exists,
    /// normalized so both tools produce comparable output.
    pub async fn hexdump(&self, path: &str) -> Result<String> {
        let tool = self
            .get_command(&["hexdump", "od"], true)
            .await?
            .unwrap_or_else(|| "od".to_string());
        let command = match tool.as_str() {
            "hexdump" => format!("hexdump -C '{path}' | cut -c 10-60"),
            _ => format!("od -t x1 -An '{path}'"),
        };
        let result = self.call_with(&command, Self::probe_opts()).await?;
        let text = result.text().await.replace(' ', "");
        Ok(text.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Release the transport connection.
    pub async fn disconnect(&self) -> Result<()> {
        tracing::info!(session = %self.id, transport = self.backend.name(), "disconnecting");
        self.backend.disconnect().await
    }

    fn lock_tools(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Option<String>>> {
        self.tools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_os(&self) -> std::sync::MutexGuard<'_, Option<OsType>> {
        self.os_type.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn classify_os(uname: &str) -> OsType {
    let name = uname.trim().to_lowercase();
    if name.contains("linux") {
        OsType::Linux
    } else if name.contains("darwin") {
        OsType::Darwin
    } else {
        OsType::Unknown
    }
}

/// Pick the 32-hex-digit token out of a digest tool's output; the
/// position differs between `md5sum` and BSD `md5`.
fn find_md5_token(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .find(|token| token.len() == 32 && token.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_string)
}
