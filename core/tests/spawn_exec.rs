//! Integration tests for the exec spawn path
//!
//! These drive the real platform layer: a successful launch of a real
//! binary, reaped cleanly, and a missing binary reported as an error
//! without harming the caller process.

#![cfg(unix)]

use mirzam_core::spawn::spawn_exec;
use mirzam_core::CoreError;
use nix::sys::wait::{waitpid, WaitStatus};

#[test]
fn test_spawn_exec_returns_a_reapable_pid() {
    let pid = spawn_exec("/bin/true", &["true".to_string()], &[]).expect("spawn /bin/true");
    assert!(pid.as_raw() > 0);

    match waitpid(pid, None).expect("waitpid failed") {
        WaitStatus::Exited(reaped, code) => {
            assert_eq!(reaped, pid);
            assert_eq!(code, 0);
        }
        status => panic!("unexpected wait status: {:?}", status),
    }
}

#[test]
fn test_spawn_exec_missing_binary_reports_error() {
    let result = spawn_exec(
        "/nonexistent/mirzam-test-binary",
        &["mirzam-test-binary".to_string()],
        &[],
    );
    match result {
        Err(CoreError::ProcessExec { path, .. }) => {
            assert!(path.contains("nonexistent"));
        }
        other => panic!("expected ProcessExec error, got {:?}", other),
    }
}

#[test]
fn test_spawn_exec_passes_environment() {
    // /bin/sh -c 'test ...' exits 0 only when the variable came through.
    let pid = spawn_exec(
        "/bin/sh",
        &[
            "sh".to_string(),
            "-c".to_string(),
            "test \"$MIRZAM_SPAWN_TEST\" = 1".to_string(),
        ],
        &["MIRZAM_SPAWN_TEST=1".to_string()],
    )
    .expect("spawn /bin/sh");

    match waitpid(pid, None).expect("waitpid failed") {
        WaitStatus::Exited(_, code) => assert_eq!(code, 0),
        status => panic!("unexpected wait status: {:?}", status),
    }
}
