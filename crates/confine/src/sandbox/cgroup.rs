//! cgroup v2 tree owned by one supervisor
//!
//! ```text
//! <root>/confine-<pid>/
//!     supervisor/     the supervisor process itself
//!     pid1/           every sandbox's pid1, no limits
//!     sandbox-<n>/    one leaf per sandbox, limits written before the tracee is born
//! ```

use std::ffi::{CStr, CString};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::unistd::{Pid, getpid, getppid};
use thiserror::Error;
use tracing::{debug, warn};

use crate::sys::{self, CloneArgs, CloneResult, PidFd};
use crate::types::{CgroupLimits, CpuTime, Si};

const CGROUP_MOUNT: &str = "/sys/fs/cgroup";
const CONTROLLER_NAMES: [&str; 3] = ["pids", "memory", "cpu"];
const CONTROLLERS: &str = "+pids +memory +cpu";
const NSDELEGATE_CHECK: &str = "nsdelegate-check";

/// Errors from reading or writing cgroup files
#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("{op}({}): {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot determine own cgroup: {0}")]
    OwnCgroup(String),

    #[error("malformed {file}: {content:?}")]
    Malformed { file: &'static str, content: String },

    #[error("cgroup root {} is not usable: {reason}", path.display())]
    UnusableRoot { path: PathBuf, reason: String },

    #[error("nsdelegate check: {0}")]
    NsDelegate(String),
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> CgroupError + 'a {
    move |source| CgroupError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

fn write_file(path: &Path, data: &str) -> Result<(), CgroupError> {
    fs::write(path, data).map_err(io_err("write", path))
}

fn read_file(path: &Path) -> Result<String, CgroupError> {
    fs::read_to_string(path).map_err(io_err("read", path))
}

/// Write a file that older kernels may lack
fn write_optional_file(path: &Path, data: &str) -> Result<(), CgroupError> {
    match fs::write(path, data) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "cgroup file not supported, skipping");
            Ok(())
        }
        res => res.map_err(io_err("write", path)),
    }
}

/// The cgroup this process lives in, from the `0::` line of `/proc/self/cgroup`
pub fn own_cgroup() -> Result<PathBuf, CgroupError> {
    let content = read_file(Path::new("/proc/self/cgroup"))?;
    parse_own_cgroup(&content)
}

fn parse_own_cgroup(content: &str) -> Result<PathBuf, CgroupError> {
    let relative = content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .ok_or_else(|| CgroupError::OwnCgroup("no cgroup v2 entry in /proc/self/cgroup".into()))?;
    if relative.ends_with(" (deleted)") {
        return Err(CgroupError::OwnCgroup(format!(
            "own cgroup was removed: {relative}"
        )));
    }
    Ok(Path::new(CGROUP_MOUNT).join(relative.trim_start_matches('/')))
}

/// Controllers of [`CONTROLLER_NAMES`] missing from a space separated list
fn missing_controllers(list: &str) -> Vec<&'static str> {
    CONTROLLER_NAMES
        .into_iter()
        .filter(|name| !list.split_whitespace().any(|c| c == *name))
        .collect()
}

/// Check that supervisor trees can be built under `root`
///
/// The pids, memory and cpu controllers must be delegated to `root`, and `root` must
/// be able to pass them on: either they are on in its `cgroup.subtree_control`
/// already, or it holds no processes of its own.
pub fn check_root(root: &Path) -> Result<(), CgroupError> {
    let unusable = |reason: String| CgroupError::UnusableRoot {
        path: root.to_path_buf(),
        reason,
    };
    let controllers = root.join("cgroup.controllers");
    let available = match fs::read_to_string(&controllers) {
        Ok(available) => available,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(unusable("not a cgroup v2 directory".to_string()));
        }
        Err(e) => return Err(io_err("read", &controllers)(e)),
    };
    if let Some(missing) = missing_controllers(&available).first() {
        return Err(unusable(format!(
            "the {missing} controller is not delegated to it"
        )));
    }

    let enabled = read_file(&root.join("cgroup.subtree_control"))?;
    if missing_controllers(&enabled).is_empty() {
        return Ok(());
    }
    // The top of the hierarchy has no cgroup.type and may hold processes
    let is_top = !root.join("cgroup.type").exists();
    let procs = read_file(&root.join("cgroup.procs"))?;
    if !is_top && !procs.trim().is_empty() {
        return Err(unusable(
            "it holds processes, so it cannot enable controllers for its children; \
             set cgroup_root to an empty delegated directory"
                .to_string(),
        ));
    }
    Ok(())
}

/// Turn the controllers on for the children of `dir` unless they already are
fn enable_controllers(dir: &Path) -> Result<(), CgroupError> {
    let subtree_control = dir.join("cgroup.subtree_control");
    if missing_controllers(&read_file(&subtree_control)?).is_empty() {
        return Ok(());
    }
    write_file(&subtree_control, CONTROLLERS)
}

fn path_cstring(path: &Path) -> Result<CString, CgroupError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| CgroupError::Io {
        op: "open",
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"),
    })
}

/// Make sure a cgroup namespace is a delegation boundary
///
/// A tracee owns the files of its leaf. Without the `nsdelegate` mount option it could
/// mount cgroup2 in its own namespaces and raise its limits, or leave its leaf.
fn check_nsdelegate(base: &Path) -> Result<(), CgroupError> {
    let test = base.join(NSDELEGATE_CHECK);
    match fs::create_dir(&test) {
        Err(e) if e.kind() != io::ErrorKind::AlreadyExists => {
            return Err(io_err("mkdir", &test)(e));
        }
        _ => {}
    }
    let res = nsdelegate_child(base, &test);
    let removed = fs::remove_dir(&test).map_err(io_err("rmdir", &test));
    res.and(removed)
}

const NSDELEGATE_OK: i32 = 0;
const NSDELEGATE_CROSSED: i32 = 1;
const NSDELEGATE_OPEN_FAILED: i32 = 2;
const NSDELEGATE_ORPHANED: i32 = 3;

fn nsdelegate_child(base: &Path, test: &Path) -> Result<(), CgroupError> {
    let outside_procs = path_cstring(&base.join("cgroup.procs"))?;
    let root_pids_max = path_cstring(&test.join("pids.max"))?;
    let test_dir = open_dir_path(test)?;
    let supervisor = getpid();
    let sys_err = |op: &'static str| move |errno: Errno| io_err(op, test)(errno.into());

    let mut pidfd: libc::c_int = -1;
    let mut clone_args = CloneArgs {
        flags: (libc::CLONE_NEWUSER | libc::CLONE_NEWCGROUP) as u64
            | sys::CLONE_PIDFD
            | sys::CLONE_INTO_CGROUP,
        pidfd: &mut pidfd as *mut libc::c_int as u64,
        exit_signal: 0,
        cgroup: test_dir.as_raw_fd() as u64,
        ..Default::default()
    };
    // SAFETY: runs before the supervisor starts any thread; the child makes plain
    // syscalls only and leaves through _exit()
    match unsafe { sys::clone3(&mut clone_args) }.map_err(sys_err("clone3"))? {
        CloneResult::Child => nsdelegate_child_main(supervisor, &outside_procs, &root_pids_max),
        CloneResult::Parent { .. } => {}
    }
    // SAFETY: CLONE_PIDFD stored a fresh descriptor we now own
    let child = PidFd::from_owned(unsafe { OwnedFd::from_raw_fd(pidfd) });
    let si = child.wait().map_err(sys_err("waitid"))?;
    nsdelegate_verdict(si)
}

fn nsdelegate_verdict(si: Si) -> Result<(), CgroupError> {
    if si == Si::exited(NSDELEGATE_OK) {
        Ok(())
    } else if si == Si::exited(NSDELEGATE_CROSSED) {
        Err(CgroupError::NsDelegate(
            "cgroup2 is not mounted with nsdelegate, sandboxes could escape their limits"
                .to_string(),
        ))
    } else {
        Err(CgroupError::NsDelegate(format!(
            "the child process died of unexpected reason: {si}"
        )))
    }
}

/// From inside a new user and cgroup namespace rooted at the check cgroup, neither
/// leaving the root nor writing its limits may succeed
fn nsdelegate_child_main(supervisor: Pid, outside_procs: &CStr, root_pids_max: &CStr) -> ! {
    // Opened here: the namespace of the opener is what the kernel checks
    let open = |path: &CStr| {
        // SAFETY: path is NUL terminated
        unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) }
    };
    let write_errno = |fd: libc::c_int, data: &[u8]| {
        // SAFETY: data is valid for data.len() bytes
        let res = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        Errno::result(res).err()
    };

    let procs = open(outside_procs);
    // A dead supervisor's pid may be reused, and with it the path just opened
    if getppid() != supervisor {
        sys::exit_now(NSDELEGATE_ORPHANED);
    }
    if procs < 0 {
        sys::exit_now(NSDELEGATE_OPEN_FAILED);
    }
    if write_errno(procs, b"0") != Some(Errno::ENOENT) {
        sys::exit_now(NSDELEGATE_CROSSED);
    }
    let pids_max = open(root_pids_max);
    if pids_max < 0 {
        sys::exit_now(NSDELEGATE_OPEN_FAILED);
    }
    if write_errno(pids_max, b"max") != Some(Errno::EPERM) {
        sys::exit_now(NSDELEGATE_CROSSED);
    }
    sys::exit_now(NSDELEGATE_OK)
}

/// Directory of the tree a supervisor with `pid` creates under `root`
pub fn tree_path(root: &Path, pid: u32) -> PathBuf {
    root.join(format!("confine-{pid}"))
}

/// Remove a supervisor's tree after the supervisor is gone
///
/// Only the empty directories the supervisor leaves behind are removed; anything
/// still populated stays. Every directory is tried, and the first failure is
/// reported once the rest are gone.
pub fn remove_tree(root: &Path, pid: u32) -> Result<(), CgroupError> {
    let base = tree_path(root, pid);
    let entries = match fs::read_dir(&base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_err("opendir", &base)(e)),
    };
    let mut first_err = None;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                first_err.get_or_insert(io_err("readdir", &base)(e));
                continue;
            }
        };
        if !entry.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        let path = entry.path();
        if let Err(e) = fs::remove_dir(&path) {
            debug!(path = %path.display(), error = %e, "cgroup left behind");
            first_err.get_or_insert(io_err("rmdir", &path)(e));
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => fs::remove_dir(&base).map_err(io_err("rmdir", &base)),
    }
}

/// User and system time from the content of `cpu.stat`
pub fn parse_cpu_stat(content: &str) -> Result<CpuTime, CgroupError> {
    let mut user = None;
    let mut system = None;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let slot = match key {
            "user_usec" => &mut user,
            "system_usec" => &mut system,
            _ => continue,
        };
        *slot = Some(value.parse::<u64>().map_err(|_| CgroupError::Malformed {
            file: "cpu.stat",
            content: content.to_string(),
        })?);
    }
    match (user, system) {
        (Some(user), Some(system)) => Ok(CpuTime {
            user: Duration::from_micros(user),
            system: Duration::from_micros(system),
        }),
        _ => Err(CgroupError::Malformed {
            file: "cpu.stat",
            content: content.to_string(),
        }),
    }
}

fn parse_u64_file(file: &'static str, content: &str) -> Result<u64, CgroupError> {
    content.trim().parse().map_err(|_| CgroupError::Malformed {
        file,
        content: content.to_string(),
    })
}

fn open_dir_path(path: &Path) -> Result<OwnedFd, CgroupError> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_PATH | libc::O_DIRECTORY)
        .open(path)
        .map(OwnedFd::from)
        .map_err(io_err("open", path))
}

/// The supervisor's cgroup subtree
#[derive(Debug)]
pub struct CgroupTree {
    base: PathBuf,
    pid1: PathBuf,
    next_leaf: AtomicU64,
}

impl CgroupTree {
    /// Create the tree under `root` and move the calling process into its
    /// `supervisor` leaf
    ///
    /// Must run before the process starts any other thread.
    pub fn setup(root: &Path) -> Result<Self, CgroupError> {
        check_root(root)?;
        let base = tree_path(root, std::process::id());
        let supervisor = base.join("supervisor");
        let pid1 = base.join("pid1");

        enable_controllers(root)?;

        for dir in [&base, &supervisor, &pid1] {
            match fs::create_dir(dir) {
                Err(e) if e.kind() != io::ErrorKind::AlreadyExists => {
                    return Err(io_err("mkdir", dir)(e));
                }
                _ => {}
            }
        }

        // Leave the base empty so it may enable controllers for its children
        write_file(&supervisor.join("cgroup.procs"), "0")?;
        write_file(&base.join("cgroup.subtree_control"), CONTROLLERS)?;
        write_optional_file(&supervisor.join("cgroup.pressure"), "0")?;
        write_optional_file(&pid1.join("cgroup.pressure"), "0")?;
        check_nsdelegate(&base)?;

        debug!(base = %base.display(), "cgroup tree ready");
        Ok(Self {
            base,
            pid1,
            next_leaf: AtomicU64::new(0),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `O_PATH` descriptor of the shared pid1 leaf, for `CLONE_INTO_CGROUP`
    pub fn open_pid1_dir(&self) -> Result<OwnedFd, CgroupError> {
        open_dir_path(&self.pid1)
    }

    /// Create a fresh leaf with `limits` already applied
    pub fn create_leaf(&self, limits: &CgroupLimits) -> Result<CgroupLeaf, CgroupError> {
        let id = self.next_leaf.fetch_add(1, Ordering::Relaxed);
        let path = self.base.join(format!("sandbox-{id}"));
        fs::create_dir(&path).map_err(io_err("mkdir", &path))?;
        let leaf = CgroupLeaf {
            path,
            removed: false,
        };
        leaf.apply_limits(limits)?;
        Ok(leaf)
    }
}

impl Drop for CgroupTree {
    fn drop(&mut self) {
        // The supervisor leaf and the base still hold us; the client removes them
        if let Err(e) = fs::remove_dir(&self.pid1) {
            debug!(path = %self.pid1.display(), error = %e, "could not remove pid1 leaf");
        }
    }
}

/// One sandbox's leaf cgroup; killed and removed on drop
#[derive(Debug)]
pub struct CgroupLeaf {
    path: PathBuf,
    removed: bool,
}

impl CgroupLeaf {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn apply_limits(&self, limits: &CgroupLimits) -> Result<(), CgroupError> {
        let pids = limits
            .process_num_limit
            .map_or_else(|| "max".to_string(), |n| n.to_string());
        write_file(&self.path.join("pids.max"), &pids)?;

        match limits.memory_limit_in_bytes {
            Some(bytes) => {
                write_file(&self.path.join("memory.max"), &bytes.to_string())?;
                write_optional_file(&self.path.join("memory.swap.max"), "0")?;
            }
            None => write_file(&self.path.join("memory.max"), "max")?,
        }

        if let Some(bw) = limits.cpu_max_bandwidth {
            write_file(
                &self.path.join("cpu.max"),
                &format!("{} {}", bw.max_usec, bw.period_usec),
            )?;
        }

        write_optional_file(&self.path.join("cgroup.pressure"), "0")
    }

    /// `O_PATH` descriptor of the leaf, for `CLONE_INTO_CGROUP`
    pub fn open_dir(&self) -> Result<OwnedFd, CgroupError> {
        open_dir_path(&self.path)
    }

    /// `cpu.stat` opened for reading from inside the sandbox
    pub fn open_cpu_stat(&self) -> Result<File, CgroupError> {
        let path = self.path.join("cpu.stat");
        File::open(&path).map_err(io_err("open", &path))
    }

    /// SIGKILL every process in the leaf
    pub fn kill(&self) -> Result<(), CgroupError> {
        write_file(&self.path.join("cgroup.kill"), "1")
    }

    pub fn cpu_times(&self) -> Result<CpuTime, CgroupError> {
        parse_cpu_stat(&read_file(&self.path.join("cpu.stat"))?)
    }

    /// `memory.peak`, or `memory.current` on kernels without it
    pub fn peak_memory(&self) -> Result<u64, CgroupError> {
        match fs::read_to_string(self.path.join("memory.peak")) {
            Ok(content) => parse_u64_file("memory.peak", &content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                parse_u64_file("memory.current", &read_file(&self.path.join("memory.current"))?)
            }
            Err(e) => Err(io_err("read", &self.path.join("memory.peak"))(e)),
        }
    }

    /// Try to remove the leaf; `Ok(false)` while processes are still leaving it
    pub fn try_remove(&mut self) -> Result<bool, CgroupError> {
        if self.removed {
            return Ok(true);
        }
        match fs::remove_dir(&self.path) {
            Ok(()) => {
                self.removed = true;
                Ok(true)
            }
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Ok(false),
            Err(e) => Err(io_err("rmdir", &self.path)(e)),
        }
    }
}

impl Drop for CgroupLeaf {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = self.kill() {
            warn!(path = %self.path.display(), error = %e, "failed to kill cgroup");
        }
        for _ in 0..100 {
            match self.try_remove() {
                Ok(true) => return,
                Ok(false) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => {
                    warn!(error = %e, "failed to remove cgroup");
                    return;
                }
            }
        }
        warn!(path = %self.path.display(), "cgroup still populated, leaving it behind");
    }
}
