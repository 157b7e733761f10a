use std::fmt;
use std::os::fd::BorrowedFd;
use std::path::{Component, Path};
use std::time::Duration;

use nix::sys::signal::Signal;
use thiserror::Error;

/// Default uid and gid of the sandboxed program inside its user namespace
pub const DEFAULT_INSIDE_ID: u32 = 1000;

/// Reasons a request is refused before it reaches a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRequest {
    #[error("argv cannot be empty")]
    EmptyArgv,

    #[error("{what} contains a NUL byte")]
    NulByte { what: &'static str },

    #[error("mount path must be absolute: {0}")]
    RelativePath(String),

    #[error("mount path may not contain '..' components: {0}")]
    ParentComponent(String),

    #[error("cpu.max period must be in [1000, 1000000] usec and max at least 1000 usec")]
    CpuMaxBandwidth,
}

/// cgroup v2 limits written to the sandbox's leaf before anything runs in it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupLimits {
    /// `pids.max`
    pub process_num_limit: Option<u32>,
    /// `memory.max`, also disables swap for the leaf
    pub memory_limit_in_bytes: Option<u64>,
    /// `cpu.max`
    pub cpu_max_bandwidth: Option<CpuMaxBandwidth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMaxBandwidth {
    pub max_usec: u32,
    pub period_usec: u32,
}

/// POSIX resource limits applied to the sandboxed program (soft = hard)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prlimit {
    pub max_address_space_size_in_bytes: Option<u64>,
    pub max_core_file_size_in_bytes: Option<u64>,
    pub cpu_time_limit_in_seconds: Option<u64>,
    pub max_file_size_in_bytes: Option<u64>,
    pub max_open_files: Option<u64>,
    pub max_stack_size_in_bytes: Option<u64>,
}

impl Default for Prlimit {
    fn default() -> Self {
        Self {
            max_address_space_size_in_bytes: None,
            max_core_file_size_in_bytes: Some(0),
            cpu_time_limit_in_seconds: None,
            max_file_size_in_bytes: None,
            max_open_files: None,
            max_stack_size_in_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserNamespace {
    pub inside_uid: Option<u32>,
    pub inside_gid: Option<u32>,
}

impl UserNamespace {
    pub fn uid(&self) -> u32 {
        self.inside_uid.unwrap_or(DEFAULT_INSIDE_ID)
    }

    pub fn gid(&self) -> u32 {
        self.inside_gid.unwrap_or(DEFAULT_INSIDE_ID)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountNamespace {
    /// Applied in order before pivoting into `new_root_mount_path`
    pub operations: Vec<MountOp>,
    pub new_root_mount_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinuxNamespaces {
    pub user: UserNamespace,
    pub mount: MountNamespace,
}

/// One step of building the sandbox's filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOp {
    MountTmpfs(MountTmpfs),
    MountProc(MountProc),
    BindMount(BindMount),
    CreateDir(CreateDir),
    CreateFile(CreateFile),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTmpfs {
    pub path: String,
    /// `None` means unlimited, `Some(0)` is clamped to the smallest possible size
    pub max_total_size_of_files_in_bytes: Option<u64>,
    /// Does not count the root directory
    pub inode_limit: Option<u64>,
    pub root_dir_mode: u32,
    pub read_only: bool,
    pub no_exec: bool,
}

impl MountTmpfs {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            max_total_size_of_files_in_bytes: None,
            inode_limit: None,
            root_dir_mode: 0o755,
            read_only: false,
            no_exec: true,
        }
    }

    pub fn with_size_limit(mut self, bytes: u64) -> Self {
        self.max_total_size_of_files_in_bytes = Some(bytes);
        self
    }

    pub fn with_inode_limit(mut self, inodes: u64) -> Self {
        self.inode_limit = Some(inodes);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn no_exec(mut self, no_exec: bool) -> Self {
        self.no_exec = no_exec;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountProc {
    pub path: String,
    pub read_only: bool,
    pub no_exec: bool,
}

impl MountProc {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
            no_exec: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: String,
    pub dest: String,
    pub recursive: bool,
    pub read_only: bool,
    pub no_exec: bool,
    pub symlink_nofollow: bool,
}

impl BindMount {
    /// Read-only, no-exec, recursive bind mount
    pub fn new(source: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            recursive: true,
            read_only: true,
            no_exec: true,
            symlink_nofollow: false,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn no_exec(mut self, no_exec: bool) -> Self {
        self.no_exec = no_exec;
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn symlink_nofollow(mut self, nofollow: bool) -> Self {
        self.symlink_nofollow = nofollow;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDir {
    pub path: String,
    pub mode: u32,
}

impl CreateDir {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: 0o755,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateFile {
    pub path: String,
    pub mode: u32,
}

impl CreateFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: 0o644,
        }
    }
}

impl MountOp {
    /// Every path the operation touches, in the order they are used
    pub fn paths(&self) -> Vec<&str> {
        match self {
            MountOp::MountTmpfs(op) => vec![&op.path],
            MountOp::MountProc(op) => vec![&op.path],
            MountOp::BindMount(op) => vec![&op.source, &op.dest],
            MountOp::CreateDir(op) => vec![&op.path],
            MountOp::CreateFile(op) => vec![&op.path],
        }
    }
}

/// Check that a mount path is absolute and cannot climb out through `..`
pub fn validate_mount_path(path: &str) -> Result<(), InvalidRequest> {
    if path.contains('\0') {
        return Err(InvalidRequest::NulByte { what: "mount path" });
    }
    let p = Path::new(path);
    if !p.is_absolute() {
        return Err(InvalidRequest::RelativePath(path.to_string()));
    }
    if p.components().any(|c| c == Component::ParentDir) {
        return Err(InvalidRequest::ParentComponent(path.to_string()));
    }
    Ok(())
}

/// Options of a single request, everything apart from argv
///
/// File descriptors are borrowed: the kernel duplicates them into the supervisor
/// when the request is sent, so they only have to outlive the `send_request` call.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions<'a> {
    pub env: Vec<String>,
    /// `/dev/null` opened for reading when absent
    pub stdin: Option<BorrowedFd<'a>>,
    /// `/dev/null` opened for writing when absent
    pub stdout: Option<BorrowedFd<'a>>,
    /// `/dev/null` opened for writing when absent
    pub stderr: Option<BorrowedFd<'a>>,
    /// Executed with `execveat()` instead of looking up `argv[0]` inside the sandbox
    pub executable: Option<BorrowedFd<'a>>,
    /// Compiled seccomp-bpf program: an array of `struct sock_filter`
    pub seccomp_bpf: Option<BorrowedFd<'a>>,
    pub cgroup: CgroupLimits,
    pub prlimit: Prlimit,
    pub linux_namespaces: LinuxNamespaces,
    /// Wall time measured from exec
    pub time_limit: Option<Duration>,
    /// User + system time of the whole sandbox measured from exec
    pub cpu_time_limit: Option<Duration>,
}

impl<'a> RequestOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stdin(mut self, fd: BorrowedFd<'a>) -> Self {
        self.stdin = Some(fd);
        self
    }

    pub fn with_stdout(mut self, fd: BorrowedFd<'a>) -> Self {
        self.stdout = Some(fd);
        self
    }

    pub fn with_stderr(mut self, fd: BorrowedFd<'a>) -> Self {
        self.stderr = Some(fd);
        self
    }

    pub fn with_executable(mut self, fd: BorrowedFd<'a>) -> Self {
        self.executable = Some(fd);
        self
    }

    pub fn with_seccomp_bpf(mut self, fd: BorrowedFd<'a>) -> Self {
        self.seccomp_bpf = Some(fd);
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_cpu_time_limit(mut self, limit: Duration) -> Self {
        self.cpu_time_limit = Some(limit);
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.cgroup.memory_limit_in_bytes = Some(bytes);
        self
    }

    pub fn with_process_num_limit(mut self, limit: u32) -> Self {
        self.cgroup.process_num_limit = Some(limit);
        self
    }

    pub fn with_mount(mut self, op: MountOp) -> Self {
        self.linux_namespaces.mount.operations.push(op);
        self
    }

    pub fn with_new_root(mut self, path: impl Into<String>) -> Self {
        self.linux_namespaces.mount.new_root_mount_path = Some(path.into());
        self
    }
}

/// Validate the parts of a request that do not depend on file descriptors
pub fn validate_request(
    argv: &[String],
    env: &[String],
    cgroup: &CgroupLimits,
    namespaces: &LinuxNamespaces,
) -> Result<(), InvalidRequest> {
    if argv.is_empty() {
        return Err(InvalidRequest::EmptyArgv);
    }
    if argv.iter().any(|arg| arg.contains('\0')) {
        return Err(InvalidRequest::NulByte { what: "argv" });
    }
    if env.iter().any(|var| var.contains('\0')) {
        return Err(InvalidRequest::NulByte { what: "env" });
    }
    if let Some(bw) = cgroup.cpu_max_bandwidth
        && (!(1000..=1_000_000).contains(&bw.period_usec) || bw.max_usec < 1000)
    {
        return Err(InvalidRequest::CpuMaxBandwidth);
    }
    for op in &namespaces.mount.operations {
        for path in op.paths() {
            validate_mount_path(path)?;
        }
    }
    if let Some(root) = &namespaces.mount.new_root_mount_path {
        validate_mount_path(root)?;
    }
    Ok(())
}

/// How a process changed state, as reported by `waitid()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiCode {
    Exited,
    Killed,
    Dumped,
    Trapped,
    Stopped,
    Continued,
}

impl SiCode {
    pub fn from_raw(code: i32) -> Option<Self> {
        match code {
            libc::CLD_EXITED => Some(SiCode::Exited),
            libc::CLD_KILLED => Some(SiCode::Killed),
            libc::CLD_DUMPED => Some(SiCode::Dumped),
            libc::CLD_TRAPPED => Some(SiCode::Trapped),
            libc::CLD_STOPPED => Some(SiCode::Stopped),
            libc::CLD_CONTINUED => Some(SiCode::Continued),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            SiCode::Exited => libc::CLD_EXITED,
            SiCode::Killed => libc::CLD_KILLED,
            SiCode::Dumped => libc::CLD_DUMPED,
            SiCode::Trapped => libc::CLD_TRAPPED,
            SiCode::Stopped => libc::CLD_STOPPED,
            SiCode::Continued => libc::CLD_CONTINUED,
        }
    }
}

/// Exit status of a process: `si_code` and `si_status` of `waitid()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Si {
    pub code: SiCode,
    /// Exit code for [`SiCode::Exited`], signal number otherwise
    pub status: i32,
}

impl Si {
    pub fn exited(status: i32) -> Self {
        Self {
            code: SiCode::Exited,
            status,
        }
    }

    pub fn killed(signal: Signal) -> Self {
        Self {
            code: SiCode::Killed,
            status: signal as i32,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == SiCode::Exited && self.status == 0
    }

    /// The signal that ended or stopped the process, if any
    pub fn signal(&self) -> Option<Signal> {
        match self.code {
            SiCode::Exited => None,
            _ => Signal::try_from(self.status).ok(),
        }
    }
}

impl fmt::Display for Si {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.code {
            SiCode::Exited => return write!(f, "exited with {}", self.status),
            SiCode::Killed => "killed by signal",
            SiCode::Dumped => "killed and dumped by signal",
            SiCode::Trapped => "trapped by signal",
            SiCode::Stopped => "stopped by signal",
            SiCode::Continued => "continued by signal",
        };
        match Signal::try_from(self.status) {
            Ok(sig) => {
                let name = sig.as_str();
                write!(f, "{prefix} {}", name.strip_prefix("SIG").unwrap_or(name))
            }
            Err(_) => write!(f, "{prefix} with number {}", self.status),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTime {
    pub user: Duration,
    pub system: Duration,
}

impl CpuTime {
    pub fn total(&self) -> Duration {
        self.user + self.system
    }
}

/// Resource usage of the sandbox's cgroup, counted from exec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupUsage {
    pub cpu_time: CpuTime,
    pub peak_memory_in_bytes: u64,
}

/// Outcome of one request
///
/// Whatever the program did, including being killed for exceeding a limit, is
/// `Ok`. `Error` means the sandbox could not be built and nothing ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxResult {
    Ok {
        si: Si,
        cgroup: CgroupUsage,
        runtime: Duration,
    },
    Error {
        description: String,
    },
}

impl SandboxResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, SandboxResult::Ok { .. })
    }

    pub fn si(&self) -> Option<Si> {
        match self {
            SandboxResult::Ok { si, .. } => Some(*si),
            SandboxResult::Error { .. } => None,
        }
    }
}
