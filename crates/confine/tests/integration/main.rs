//! Integration tests for confine
//!
//! Run with: cargo test -p confine --features integration-tests
//!
//! Tests that start sandboxes need unprivileged user namespaces and a delegated
//! cgroup v2 subtree, and are marked `#[ignore]`. Point `CONFINE_CGROUP_ROOT` at the
//! delegated directory and include them with:
//!    cargo test -p confine --features integration-tests -- --include-ignored

#![cfg(feature = "integration-tests")]

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};

use confine::{
    BindMount, Config, CreateDir, MountOp, MountProc, MountTmpfs, RequestOptions, SandboxResult,
    SupervisorConnection,
};

mod config_loading;
mod isolation;
mod lifecycle;
mod limits;
mod ordering;
mod supervisor_args;
mod tracee_setup;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Path of the supervisor built alongside the tests
pub(crate) const SUPERVISOR: &str = env!("CARGO_BIN_EXE_confine-supervisor");

/// Directory the sandbox root is built on; only ever mounted over inside the sandbox
const SANDBOX_ROOT: &str = "/tmp";

pub(crate) fn fixture_path(name: &str) -> PathBuf {
    Path::new(FIXTURES_PATH).join(name)
}

/// Config using the freshly built supervisor and `CONFINE_*` from the environment
pub(crate) fn test_config() -> Config {
    let mut config = Config::from_env().expect("invalid CONFINE_* environment");
    config.supervisor_path = Some(PathBuf::from(SUPERVISOR));
    config
}

pub(crate) fn connect() -> SupervisorConnection {
    SupervisorConnection::spawn(&test_config()).expect("Failed to spawn supervisor")
}

/// Options with a tmpfs root holding the system directories, /proc and /tmp
pub(crate) fn rooted_options<'a>() -> RequestOptions<'a> {
    let mut options = RequestOptions::new()
        .with_env(["PATH=/usr/bin:/bin"])
        .with_mount(MountOp::MountTmpfs(MountTmpfs::new(SANDBOX_ROOT)));
    for dir in ["/bin", "/lib", "/lib64", "/usr"] {
        if Path::new(dir).is_dir() {
            let dest = format!("{SANDBOX_ROOT}{dir}");
            options = options
                .with_mount(MountOp::CreateDir(CreateDir::new(&dest)))
                .with_mount(MountOp::BindMount(
                    BindMount::new(dir, dest).recursive(true).read_only(true),
                ));
        }
    }
    options
        .with_mount(MountOp::CreateDir(CreateDir::new(format!("{SANDBOX_ROOT}/proc"))))
        .with_mount(MountOp::MountProc(MountProc::new(format!("{SANDBOX_ROOT}/proc"))))
        .with_mount(MountOp::CreateDir(CreateDir::new(format!("{SANDBOX_ROOT}/tmp"))))
        .with_new_root(SANDBOX_ROOT)
}

/// Send one request and wait for its result
pub(crate) fn run(
    conn: &mut SupervisorConnection,
    argv: &[&str],
    options: &RequestOptions<'_>,
) -> SandboxResult {
    let handle = conn.send_request(argv, options).expect("Failed to send request");
    conn.await_result(handle).expect("Failed to await result")
}

/// Run `argv` with stdout captured
pub(crate) fn run_capturing(
    conn: &mut SupervisorConnection,
    argv: &[&str],
    options: RequestOptions<'_>,
) -> (SandboxResult, String) {
    let (read, write): (OwnedFd, OwnedFd) = nix::unistd::pipe().expect("pipe");
    let handle = {
        let options = options.with_stdout(write.as_fd());
        conn.send_request(argv, &options).expect("Failed to send request")
    };
    // The supervisor holds its own copy now
    drop(write);
    let result = conn.await_result(handle).expect("Failed to await result");
    let mut out = String::new();
    File::from(read).read_to_string(&mut out).expect("read stdout");
    (result, out)
}

/// `si` and runtime of an `Ok` result
pub(crate) fn expect_ok(result: SandboxResult) -> (confine::Si, std::time::Duration, confine::CgroupUsage) {
    match result {
        SandboxResult::Ok {
            si,
            runtime,
            cgroup,
        } => (si, runtime, cgroup),
        SandboxResult::Error { description } => panic!("sandbox error: {description}"),
    }
}
