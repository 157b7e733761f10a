//! A process-isolation sandbox for running untrusted programs.
//!
//! A client spawns one supervisor process per [`SupervisorConnection`] and streams
//! requests to it over a unix socket. The supervisor runs each request in a fresh set
//! of Linux namespaces, inside its own cgroup v2 leaf, and answers with a
//! [`SandboxResult`] in the order the requests were sent.
//!
//! # Features
//!
//! - **Namespaces**: user, mount, pid, network, IPC, UTS and cgroup, with a tmpfs or
//!   bind-mounted root built per request.
//! - **Limits**: cgroup pids, memory and cpu.max, POSIX rlimits, wall time and CPU time.
//! - **Seccomp**: a caller-compiled BPF program passed as a file descriptor.
//! - **Pipelining**: many requests in flight per supervisor, results in FIFO order.
//!
//! ```no_run
//! use confine::{RequestOptions, SandboxResult, spawn_supervisor};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), confine::SandboxError> {
//! let mut conn = spawn_supervisor()?;
//! let options = RequestOptions::new().with_time_limit(Duration::from_secs(1));
//! let handle = conn.send_request(&["/bin/true"], &options)?;
//! if let SandboxResult::Ok { si, .. } = conn.await_result(handle)? {
//!     println!("{si}");
//! }
//! conn.shutdown()
//! # }
//! ```

pub use crate::client::{RequestHandle, SandboxError, SupervisorConnection, spawn_supervisor};
pub use crate::config::{Config, ConfigError, EXAMPLE_CONFIG};
pub use crate::types::{
    BindMount, CgroupLimits, CgroupUsage, CpuMaxBandwidth, CpuTime, CreateDir, CreateFile,
    InvalidRequest, LinuxNamespaces, MountNamespace, MountOp, MountProc, MountTmpfs, Prlimit,
    RequestOptions, SandboxResult, Si, SiCode, UserNamespace,
};

pub mod client;
pub mod config;
pub mod sandbox;
pub mod supervisor;
pub mod sys;
pub mod types;
pub mod wire;
