use confine::Si;

use super::{connect, expect_ok, rooted_options, run, run_capturing};

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_program_is_pid_2() {
    let mut conn = connect();
    let (result, out) = run_capturing(&mut conn, &["/bin/sh", "-c", "echo $$"], rooted_options());
    let (si, _, _) = expect_ok(result);
    assert_eq!(si, Si::exited(0));
    assert_eq!(out.trim(), "2");
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_proc_shows_only_the_sandbox() {
    let mut conn = connect();
    let (result, out) = run_capturing(
        &mut conn,
        &["/bin/sh", "-c", "cd /proc && echo [0-9]*"],
        rooted_options(),
    );
    expect_ok(result);
    let pids: Vec<u32> = out
        .split_whitespace()
        .map(|p| p.parse().expect("numeric /proc entry"))
        .collect();
    assert!(pids.contains(&1), "{out}");
    assert!(pids.contains(&2), "{out}");
    assert!(pids.iter().all(|&p| p <= 3), "{out}");
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_only_mounted_paths_are_visible() {
    let mut conn = connect();
    let (result, out) = run_capturing(&mut conn, &["/bin/sh", "-c", "echo /*"], rooted_options());
    expect_ok(result);
    let mut entries: Vec<&str> = out.split_whitespace().collect();
    entries.sort_unstable();
    for entry in &entries {
        assert!(
            ["/bin", "/lib", "/lib64", "/proc", "/tmp", "/usr"].contains(entry),
            "unexpected {entry} in {out}"
        );
    }
    assert!(!entries.contains(&"/home"));
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_bind_mounts_are_read_only() {
    let mut conn = connect();
    let (si, _, _) = expect_ok(run(
        &mut conn,
        &["/bin/sh", "-c", "echo x > /usr/confine-write-test"],
        &rooted_options(),
    ));
    assert_ne!(si, Si::exited(0));
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_default_ids_inside() {
    let mut conn = connect();
    let (result, out) = run_capturing(&mut conn, &["/bin/sh", "-c", "id -u; id -g"], rooted_options());
    expect_ok(result);
    assert_eq!(out.split_whitespace().collect::<Vec<_>>(), ["1000", "1000"]);
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_network_is_private() {
    let mut conn = connect();
    let (result, out) = run_capturing(
        &mut conn,
        &["/bin/sh", "-c", "cat /proc/net/dev | tail -n +3"],
        rooted_options(),
    );
    expect_ok(result);
    // Only the loopback device exists in a fresh network namespace
    let devices: Vec<&str> = out
        .lines()
        .filter_map(|line| line.split(':').next())
        .map(str::trim)
        .collect();
    assert_eq!(devices, ["lo"]);
}
