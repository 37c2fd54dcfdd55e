//! Integration tests against the local transport.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use unishell::{CallOpts, OsType, SessionConfig, ShellError, ShellSession};

#[tokio::test]
async fn echo_hello_world() {
    let session = ShellSession::local();
    let result = session.call("echo Hello World").await.unwrap();
    assert_eq!(result.text().await, "Hello World");
    assert_eq!(result.exit_code().await, 0);
}

#[tokio::test]
async fn local_session_by_uri() {
    let session = ShellSession::connect("local://").await.unwrap();
    assert_eq!(session.transport(), "local");
    let result = session.call("echo Hello World").await.unwrap();
    assert_eq!(result.text().await, "Hello World");
}

#[tokio::test]
async fn check_xc_raises_with_exact_code() {
    let session = ShellSession::local();
    let err = session
        .call_with("exit 44", CallOpts::new().check_xc(true))
        .await
        .unwrap_err();
    match err {
        ShellError::CommandFailed { command, exit_code } => {
            assert_eq!(command, "exit 44");
            assert_eq!(exit_code, 44);
        }
        other => panic!("expected CommandFailed, got {other}"),
    }
}

#[tokio::test]
async fn check_xc_silent_on_success() {
    let config = SessionConfig {
        check_xc: true,
        ..Default::default()
    };
    let session = ShellSession::local_with(config);
    let result = session.call("true").await.unwrap();
    assert_eq!(result.exit_code().await, 0);
}

#[tokio::test]
async fn check_err_raises_on_stderr_output() {
    let session = ShellSession::local();
    let err = session
        .call_with("echo warning >&2", CallOpts::new().check_err(true))
        .await
        .unwrap_err();
    match err {
        ShellError::UnexpectedStderr { stderr, .. } => assert_eq!(stderr, "warning"),
        other => panic!("expected UnexpectedStderr, got {other}"),
    }
}

#[tokio::test]
async fn per_call_env_override() {
    let session = ShellSession::local();
    let result = session
        .call_with("echo $FOO", CallOpts::new().env("FOO", "foo"))
        .await
        .unwrap();
    assert_eq!(result.text().await, "foo");
}

#[tokio::test]
async fn session_env_applies_and_call_wins() {
    let mut session = ShellSession::local();
    session.set_env("FOO", "session");
    let result = session.call("echo $FOO").await.unwrap();
    assert_eq!(result.text().await, "session");

    let result = session
        .call_with("echo $FOO", CallOpts::new().env("FOO", "call"))
        .await
        .unwrap();
    assert_eq!(result.text().await, "call");
}

#[tokio::test]
async fn per_stream_order_survives_interleaving() {
    let session = ShellSession::local();
    let script = "echo out1; echo err1 >&2; echo out2; echo err2 >&2; echo out3";
    let result = session.call(script).await.unwrap();
    assert_eq!(result.stdout_lines().await, vec!["out1", "out2", "out3"]);
    assert_eq!(result.stderr_lines().await, vec!["err1", "err2"]);
    assert_eq!(result.exit_code().await, 0);
}

#[tokio::test]
async fn lazy_result_is_readable_long_after_completion() {
    let session = ShellSession::local();
    let result = session
        .call_with("echo done", CallOpts::new().wait(false))
        .await
        .unwrap();

    // Let the command finish long before anything reads the result.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let text = tokio::time::timeout(Duration::from_secs(5), result.text())
        .await
        .expect("reading a finished result must not deadlock");
    assert_eq!(text, "done");
    assert_eq!(result.exit_code().await, 0);
}

#[tokio::test]
async fn cwd_option_changes_directory() {
    let dir = tempfile::tempdir().unwrap();
    let session = ShellSession::local();
    let result = session
        .call_with("pwd", CallOpts::new().cwd(dir.path().to_str().unwrap()))
        .await
        .unwrap();
    // The tempdir may sit behind a symlink (macOS /tmp).
    assert!(result
        .text()
        .await
        .ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
}

#[tokio::test]
async fn multi_line_output_joins_with_newline() {
    let session = ShellSession::local();
    let result = session.call("printf 'a\\nb\\nc\\n'").await.unwrap();
    assert_eq!(result.text().await, "a\nb\nc");
}

#[tokio::test]
async fn get_command_caches_resolution() {
    let session = ShellSession::local();
    let first = session.get_command(&["sh"], true).await.unwrap();
    assert_eq!(first.as_deref(), Some("sh"));
    let second = session.get_command(&["sh"], true).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn get_command_falls_through_candidates() {
    let session = ShellSession::local();
    let found = session
        .get_command(&["definitely-not-a-real-tool-xyz", "sh"], true)
        .await
        .unwrap();
    assert_eq!(found.as_deref(), Some("sh"));
}

#[tokio::test]
async fn mandatory_tool_miss_is_an_error() {
    let session = ShellSession::local();
    let err = session
        .detect_command(&["definitely-not-a-real-tool-xyz"], true)
        .await
        .unwrap_err();
    assert!(matches!(err, ShellError::ToolNotFound { .. }));
}

#[tokio::test]
async fn optional_tool_miss_is_none() {
    let session = ShellSession::local();
    let found = session
        .detect_command(&["definitely-not-a-real-tool-xyz"], false)
        .await
        .unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn os_type_is_classified_and_cached() {
    let session = ShellSession::local();
    let os = session.os_type().await;
    assert!(matches!(os, OsType::Linux | OsType::Darwin));
    assert_eq!(session.os_type().await, os);
}

#[tokio::test]
async fn permissions_round_trip_through_stat_and_chmod() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mode.txt");
    std::fs::write(&path, b"contents").unwrap();

    let session = ShellSession::local();
    let path_str = path.to_str().unwrap();
    session.set_permissions(path_str, 0o640).await.unwrap();
    assert_eq!(session.permissions(path_str).await.unwrap(), 0o640);
}

#[tokio::test]
async fn pull_preserves_source_mode() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote.bin");
    let local = dir.path().join("local.bin");
    std::fs::write(&remote, b"payload").unwrap();
    std::fs::set_permissions(&remote, std::fs::Permissions::from_mode(0o640)).unwrap();

    let session = ShellSession::local();
    session
        .pull(&local, remote.to_str().unwrap())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&local).unwrap(), b"payload");
    let mode = std::fs::metadata(&local).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o640);
}

#[tokio::test]
async fn push_preserves_source_mode() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("local.bin");
    let remote = dir.path().join("remote.bin");
    std::fs::write(&local, b"payload").unwrap();
    std::fs::set_permissions(&local, std::fs::Permissions::from_mode(0o640)).unwrap();

    let session = ShellSession::local();
    session
        .push(&local, remote.to_str().unwrap())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&remote).unwrap(), b"payload");
    let mode = std::fs::metadata(&remote).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o640);
}

#[tokio::test]
async fn md5_digest_matches_known_value() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("digest.txt");
    std::fs::write(&path, b"").unwrap();

    let session = ShellSession::local();
    let digest = session.md5(path.to_str().unwrap(), false).await.unwrap();
    if let Some(digest) = digest {
        // MD5 of the empty input.
        assert_eq!(digest, "d41d8cd98f00b204e9800998ecf8427e");
    }
}

#[tokio::test]
async fn results_from_sequential_calls_are_independent() {
    let session = ShellSession::local();
    let first = session.call("echo first").await.unwrap();
    let second = session.call("echo second").await.unwrap();
    assert_eq!(first.text().await, "first");
    assert_eq!(second.text().await, "second");
    assert_eq!(first.text().await, "first");
}
