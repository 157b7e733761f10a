use std::time::Duration;

use confine::{RequestOptions, Si};
use nix::sys::signal::Signal;

use super::{connect, expect_ok, run};

const MIB: u64 = 1 << 20;

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_wall_time_limit_kills() {
    let mut conn = connect();
    let options = RequestOptions::new().with_time_limit(Duration::from_millis(100));
    let (si, runtime, _) = expect_ok(run(&mut conn, &["/bin/sleep", "10"], &options));

    assert_eq!(si, Si::killed(Signal::SIGKILL));
    assert!(runtime >= Duration::from_millis(100), "{runtime:?}");
    assert!(runtime < Duration::from_millis(1000), "{runtime:?}");
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_cpu_time_limit_kills_busy_loop() {
    let mut conn = connect();
    let options = RequestOptions::new()
        .with_cpu_time_limit(Duration::from_secs(1))
        .with_time_limit(Duration::from_secs(10));
    let (si, runtime, usage) = expect_ok(run(
        &mut conn,
        &["/bin/sh", "-c", "while :; do :; done"],
        &options,
    ));

    assert_eq!(si, Si::killed(Signal::SIGKILL));
    assert!(usage.cpu_time.total() >= Duration::from_secs(1), "{usage:?}");
    assert!(runtime < Duration::from_secs(3), "{runtime:?}");
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_allocation_under_memory_limit() {
    let mut conn = connect();
    let options = RequestOptions::new().with_memory_limit(64 * MIB);
    let (si, _, usage) = expect_ok(run(
        &mut conn,
        &["/bin/dd", "if=/dev/zero", "of=/dev/null", "bs=8M", "count=1"],
        &options,
    ));

    assert_eq!(si, Si::exited(0));
    assert!(usage.peak_memory_in_bytes >= 8 * MIB, "{usage:?}");
    assert!(usage.peak_memory_in_bytes <= 64 * MIB, "{usage:?}");
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_allocation_over_memory_limit_is_killed() {
    let mut conn = connect();
    let options = RequestOptions::new().with_memory_limit(32 * MIB);
    let (si, _, usage) = expect_ok(run(
        &mut conn,
        &["/bin/dd", "if=/dev/zero", "of=/dev/null", "bs=256M", "count=1"],
        &options,
    ));

    assert_eq!(si, Si::killed(Signal::SIGKILL));
    assert!(usage.peak_memory_in_bytes > 16 * MIB, "{usage:?}");
    assert!(usage.peak_memory_in_bytes <= 33 * MIB, "{usage:?}");
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_process_limit() {
    let mut conn = connect();
    let options = RequestOptions::new().with_process_num_limit(1);
    // The shell itself is the only process allowed, so the fork for /bin/true fails
    let (si, _, _) = expect_ok(run(&mut conn, &["/bin/sh", "-c", "/bin/true; exit $?"], &options));
    assert_ne!(si, Si::exited(0));
}
