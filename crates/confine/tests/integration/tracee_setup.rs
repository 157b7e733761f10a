use std::fs::{self, File};
use std::io::Write;
use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;
use std::time::Duration;

use confine::{CpuMaxBandwidth, RequestOptions, SandboxResult, Si};
use nix::sys::signal::Signal;

use super::{connect, expect_ok, rooted_options, run, run_capturing};

/// `BPF_RET | BPF_K`
const BPF_RET_K: u16 = 0x06;
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;

/// Write `bytes` to a fresh file and reopen it read-only
fn program_file(name: &str, bytes: &[u8]) -> File {
    let path: PathBuf = std::env::temp_dir().join(format!("confine-{name}-{}", std::process::id()));
    File::create(&path)
        .and_then(|mut f| f.write_all(bytes))
        .expect("write program");
    let file = File::open(&path).expect("open program");
    let _ = fs::remove_file(&path);
    file
}

/// A single `sock_filter` that kills the process on any syscall
fn kill_everything_filter() -> Vec<u8> {
    let mut filter = Vec::with_capacity(8);
    filter.extend_from_slice(&BPF_RET_K.to_ne_bytes());
    filter.extend_from_slice(&[0, 0]);
    filter.extend_from_slice(&SECCOMP_RET_KILL_PROCESS.to_ne_bytes());
    filter
}

// Seccomp

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_seccomp_filter_kills_at_execveat() {
    let mut conn = connect();
    let bpf = program_file("kill-all", &kill_everything_filter());
    let options = RequestOptions::new().with_seccomp_bpf(bpf.as_fd());
    let (si, _, _) = expect_ok(run(&mut conn, &["/bin/true"], &options));

    assert_eq!(si, Si::killed(Signal::SIGSYS));
    conn.shutdown().expect("Failed to shut down");
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_seccomp_program_of_partial_filter_is_a_setup_error() {
    let mut conn = connect();
    let bpf = program_file("partial", &kill_everything_filter()[..7]);
    let options = RequestOptions::new().with_seccomp_bpf(bpf.as_fd());

    match run(&mut conn, &["/bin/true"], &options) {
        SandboxResult::Error { description } => {
            assert!(description.contains("not a multiple of 8"), "{description}");
        }
        other => panic!("expected a setup error, got {other:?}"),
    }
    // The connection survives a failed setup
    let (si, _, _) = expect_ok(run(&mut conn, &["/bin/true"], &RequestOptions::new()));
    assert_eq!(si, Si::exited(0));
    conn.shutdown().expect("Failed to shut down");
}

// Executable and stdio

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_executable_passed_by_fd() {
    let mut conn = connect();
    let echo = File::open("/bin/echo").expect("open /bin/echo");
    // argv[0] names nothing on disk, the descriptor is what runs
    let options = RequestOptions::new().with_executable(echo.as_fd());
    let (result, out) = run_capturing(&mut conn, &["no-such-echo", "by", "fd"], options);

    let (si, _, _) = expect_ok(result);
    assert_eq!(si, Si::exited(0));
    assert_eq!(out, "by fd\n");
    conn.shutdown().expect("Failed to shut down");
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_stdin_is_piped_through() {
    let mut conn = connect();
    let (read, write): (OwnedFd, OwnedFd) = nix::unistd::pipe().expect("pipe");
    File::from(write)
        .write_all(b"through the sandbox\n")
        .expect("write stdin");
    let options = RequestOptions::new().with_stdin(read.as_fd());
    let (result, out) = run_capturing(&mut conn, &["/bin/cat"], options);

    let (si, _, _) = expect_ok(result);
    assert_eq!(si, Si::exited(0));
    assert_eq!(out, "through the sandbox\n");
    conn.shutdown().expect("Failed to shut down");
}

// Limits applied to the tracee

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_file_size_limit_raises_sigxfsz() {
    let mut conn = connect();
    let mut options = rooted_options().with_time_limit(Duration::from_secs(10));
    options.prlimit.max_file_size_in_bytes = Some(4096);
    let (si, _, _) = expect_ok(run(
        &mut conn,
        &["/bin/sh", "-c", "exec yes > /tmp/out"],
        &options,
    ));

    assert_eq!(si, Si::killed(Signal::SIGXFSZ));
    conn.shutdown().expect("Failed to shut down");
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_cpu_max_bandwidth_throttles_busy_loop() {
    let mut conn = connect();
    let mut options = RequestOptions::new().with_time_limit(Duration::from_secs(1));
    // 10% of one CPU
    options.cgroup.cpu_max_bandwidth = Some(CpuMaxBandwidth {
        max_usec: 10_000,
        period_usec: 100_000,
    });
    let (si, runtime, usage) = expect_ok(run(
        &mut conn,
        &["/bin/sh", "-c", "while :; do :; done"],
        &options,
    ));

    assert_eq!(si, Si::killed(Signal::SIGKILL));
    assert!(runtime >= Duration::from_secs(1), "{runtime:?}");
    assert!(
        usage.cpu_time.total() < Duration::from_millis(400),
        "{usage:?}"
    );
    conn.shutdown().expect("Failed to shut down");
}
