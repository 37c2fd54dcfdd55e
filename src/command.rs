//! Per-call options and command-line composition.

use std::collections::BTreeMap;
use std::time::Duration;

/// Per-call overrides for a single [`ShellSession::call_with`] dispatch.
///
/// Every field is optional; unset fields fall back to the session's
/// defaults. Environment entries layered here win over the session's
/// own environment.
///
/// [`ShellSession::call_with`]: crate::ShellSession::call_with
#[derive(Debug, Clone, Default)]
pub struct CallOpts {
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) cwd: Option<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) wait: Option<bool>,
    pub(crate) check_xc: Option<bool>,
    pub(crate) check_err: Option<bool>,
}

impl CallOpts {
    /// Create an empty set of overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an environment variable override for this call.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add multiple environment variable overrides.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    /// Run the command from this working directory.
    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Bound channel setup and initial read for this call.
    ///
    /// This does not kill a long-running command; it only limits how
    /// long the transport may take to open the channel and start
    /// answering.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Override the session's eager-resolution policy for this call.
    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = Some(wait);
        self
    }

    /// Override the session's exit-code checking policy for this call.
    pub fn check_xc(mut self, check: bool) -> Self {
        self.check_xc = Some(check);
        self
    }

    /// Override the session's stderr checking policy for this call.
    pub fn check_err(mut self, check: bool) -> Self {
        self.check_err = Some(check);
        self
    }
}

/// Prefix each environment entry as `VAR=VAL; ` ahead of the command.
///
/// Entries are emitted in key order so the composed text is
/// deterministic. POSIX shell assignment syntax; a non-POSIX target
/// shell would need its own composition.
pub(crate) fn compose(command: &str, env: &BTreeMap<String, String>) -> String {
    let mut composed = String::new();
    for (var, val) in env {
        composed.push_str(var);
        composed.push('=');
        composed.push_str(val);
        composed.push_str("; ");
    }
    composed.push_str(command);
    composed
}

/// Wrap a command with a working-directory change.
///
/// Used by transports that cannot set the spawn directory natively.
pub(crate) fn wrap_cwd(command: &str, cwd: Option<&str>) -> String {
    match cwd {
        Some(dir) => format!("cd \"{dir}\"; {command}"),
        None => command.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opts_builder_chain() {
        let opts = CallOpts::new()
            .env("FOO", "foo")
            .cwd("/tmp")
            .timeout(Duration::from_secs(5))
            .wait(false)
            .check_xc(true)
            .check_err(true);

        assert_eq!(opts.env.get("FOO"), Some(&"foo".to_string()));
        assert_eq!(opts.cwd.as_deref(), Some("/tmp"));
        assert_eq!(opts.timeout, Some(Duration::from_secs(5)));
        assert_eq!(opts.wait, Some(false));
        assert_eq!(opts.check_xc, Some(true));
        assert_eq!(opts.check_err, Some(true));
    }

    #[test]
    fn test_opts_default_leaves_policy_unset() {
        let opts = CallOpts::new();
        assert!(opts.env.is_empty());
        assert!(opts.wait.is_none());
        assert!(opts.check_xc.is_none());
        assert!(opts.check_err.is_none());
    }

    #[test]
    fn test_compose_no_env() {
        let env = BTreeMap::new();
        assert_eq!(compose("echo hi", &env), "echo hi");
    }

    #[test]
    fn test_compose_prefixes_entries_in_key_order() {
        let mut env = BTreeMap::new();
        env.insert("ZED".to_string(), "z".to_string());
        env.insert("ALPHA".to_string(), "a".to_string());
        assert_eq!(
            compose("echo $ALPHA$ZED", &env),
            "ALPHA=a; ZED=z; echo $ALPHA$ZED"
        );
    }

    #[test]
    fn test_wrap_cwd() {
        assert_eq!(wrap_cwd("ls", Some("/var/log")), "cd \"/var/log\"; ls");
        assert_eq!(wrap_cwd("ls", None), "ls");
    }

    #[test]
    fn test_opts_envs_bulk() {
        let opts = CallOpts::new().envs([("A", "1"), ("B", "2")]);
        assert_eq!(opts.env.len(), 2);
        assert_eq!(opts.env.get("B"), Some(&"2".to_string()));
    }
}
