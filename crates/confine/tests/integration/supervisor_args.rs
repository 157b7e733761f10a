//! Startup diagnostics of the supervisor binary; no sandboxes are started

use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Output};

use nix::unistd::geteuid;

use super::SUPERVISOR;

/// Run the supervisor with `args`, keeping `inherit` open across exec
fn supervisor(args: &[String], inherit: Option<i32>) -> Output {
    let mut command = Command::new(SUPERVISOR);
    command.args(args);
    if let Some(fd) = inherit {
        // SAFETY: only fcntl() runs between fork and exec
        unsafe {
            command.pre_exec(move || {
                if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    command.output().expect("Failed to run supervisor")
}

fn assert_fails_with(output: &Output, expected: &str) {
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    if geteuid().is_root() {
        assert!(stderr.contains("supervisor is not safe to be run by root"), "{stderr}");
    } else {
        assert!(stderr.contains(expected), "{stderr}");
    }
}

#[test]
fn test_usage_without_arguments() {
    let output = supervisor(&[], None);
    assert_fails_with(&output, "<unix socket file descriptor number>");
}

#[test]
fn test_invalid_fd_number() {
    let output = supervisor(&["three".to_string()], None);
    assert_fails_with(&output, "supervisor: invalid file descriptor number as argument");
}

#[test]
fn test_closed_fd() {
    let output = supervisor(&["1000".to_string()], None);
    assert_fails_with(&output, "supervisor: invalid file descriptor (getsockopt(): EBADF");
}

#[test]
fn test_tcp_socket_is_rejected() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let fd = listener.as_raw_fd();
    let output = supervisor(&[fd.to_string()], Some(fd));
    assert_fails_with(&output, "supervisor: invalid socket domain, expected AF_UNIX");
}
