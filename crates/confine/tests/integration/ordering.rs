use std::time::{Duration, Instant};

use confine::{RequestOptions, SandboxResult, Si};

use super::{connect, expect_ok};

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_results_come_back_in_request_order() {
    let mut conn = connect();
    let options = RequestOptions::new();
    // The first request finishes last
    let scripts = ["sleep 0.3; exit 1", "exit 2", "sleep 0.1; exit 3", "exit 4"];
    let handles: Vec<_> = scripts
        .iter()
        .map(|script| {
            conn.send_request(&["/bin/sh", "-c", script], &options)
                .expect("Failed to send request")
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let (si, _, _) = expect_ok(conn.await_result(handle).expect("Failed to await result"));
        assert_eq!(si, Si::exited(i as i32 + 1));
    }
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
fn test_pipelined_requests_run_in_parallel() {
    let mut conn = connect();
    let options = RequestOptions::new();
    let start = Instant::now();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            conn.send_request(&["/bin/sleep", "0.5"], &options)
                .expect("Failed to send request")
        })
        .collect();
    for handle in handles {
        let result = conn.await_result(handle).expect("Failed to await result");
        assert!(matches!(result, SandboxResult::Ok { .. }));
    }
    // Four sandboxes at once with the default of max_parallel_sandboxes = 4
    assert!(start.elapsed() < Duration::from_millis(1500), "{:?}", start.elapsed());
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
#[should_panic(expected = "awaited in the order")]
fn test_out_of_order_await_panics() {
    let mut conn = connect();
    let options = RequestOptions::new();
    let _first = conn.send_request(&["/bin/true"], &options).unwrap();
    let second = conn.send_request(&["/bin/true"], &options).unwrap();
    let _ = conn.await_result(second);
}

#[test]
#[ignore = "requires user namespaces and a delegated cgroup v2 subtree"]
#[should_panic(expected = "another supervisor connection")]
fn test_foreign_handle_panics() {
    let mut a = connect();
    let mut b = connect();
    let handle = a.send_request(&["/bin/true"], &RequestOptions::new()).unwrap();
    let _ = b.await_result(handle);
}
