use std::path::PathBuf;
use std::time::{Duration, Instant};

use confine::sandbox::cgroup::CgroupError;
use confine::{
    Config, ConfigError, RequestOptions, SandboxError, SandboxResult, Si, SupervisorConnection,
};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use super::{SUPERVISOR, connect, expect_ok, rooted_options, run};

fn supervisor_is_gone(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None) == Err(Errno::ESRCH)
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_true_exits_zero() {
    let mut conn = connect();
    let (si, _, _) = expect_ok(run(&mut conn, &["/bin/true"], &RequestOptions::new()));
    assert_eq!(si, Si::exited(0));
    conn.shutdown().expect("Failed to shut down");
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_exit_code_is_reported() {
    let mut conn = connect();
    let (si, _, _) = expect_ok(run(&mut conn, &["/bin/sh", "-c", "exit 7"], &RequestOptions::new()));
    assert_eq!(si, Si::exited(7));
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_missing_program_exits_127() {
    let mut conn = connect();
    let (si, _, _) = expect_ok(run(&mut conn, &["/nonexistent"], &rooted_options()));
    assert_eq!(si, Si::exited(127));
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_setup_error_is_reported_and_connection_survives() {
    let mut conn = connect();
    let options = RequestOptions::new().with_mount(confine::MountOp::BindMount(
        confine::BindMount::new("/nonexistent-source", "/tmp"),
    ));
    let result = run(&mut conn, &["/bin/true"], &options);
    let SandboxResult::Error { description } = result else {
        panic!("expected setup error, got {result:?}");
    };
    assert!(description.contains("open_tree"), "{description}");

    let (si, _, _) = expect_ok(run(&mut conn, &["/bin/true"], &RequestOptions::new()));
    assert!(si.is_success());
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_empty_argv_is_rejected_locally() {
    let mut conn = connect();
    let err = conn
        .send_request::<&str>(&[], &RequestOptions::new())
        .unwrap_err();
    assert!(matches!(err, SandboxError::InvalidRequest(_)));
    assert_eq!(err.to_string(), "argv cannot be empty");
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_no_leftover_supervisor_after_drop() {
    let conn = connect();
    let pid = conn.supervisor_pid();
    drop(conn);
    assert!(supervisor_is_gone(pid));
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_drop_with_request_in_flight_is_prompt() {
    let mut conn = connect();
    let pid = conn.supervisor_pid();
    let _handle = conn
        .send_request(&["/bin/sleep", "10"], &RequestOptions::new())
        .expect("Failed to send request");
    // Give the sandbox time to start
    std::thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    conn.shutdown().expect("Failed to shut down");
    assert!(start.elapsed() < Duration::from_secs(3), "{:?}", start.elapsed());
    assert!(supervisor_is_gone(pid));
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_killed_supervisor_is_reported() {
    let mut conn = connect();
    let pid = conn.supervisor_pid();
    let handle = conn
        .send_request(&["/bin/sleep", "10"], &RequestOptions::new())
        .expect("Failed to send request");
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).expect("kill");

    let err = conn.await_result(handle).unwrap_err();
    let SandboxError::SupervisorDied { si, .. } = err else {
        panic!("expected SupervisorDied, got {err:?}");
    };
    assert_eq!(si, Si::killed(Signal::SIGKILL));

    let err = conn
        .send_request(&["/bin/true"], &RequestOptions::new())
        .unwrap_err();
    assert!(matches!(err, SandboxError::Broken));
}

#[test]
fn test_default_cgroup_root_works_or_is_refused_up_front() {
    let config = Config {
        supervisor_path: Some(PathBuf::from(SUPERVISOR)),
        ..Config::default()
    };
    match SupervisorConnection::spawn(&config) {
        // Only at the top of a delegated hierarchy
        Ok(conn) => drop(conn),
        Err(SandboxError::Config(ConfigError::Cgroup(err))) => {
            assert!(
                matches!(err, CgroupError::UnusableRoot { .. } | CgroupError::OwnCgroup(_)),
                "{err}"
            );
        }
        Err(err) => panic!("expected a usable root or a cgroup diagnostic, got {err:?}"),
    }
}
