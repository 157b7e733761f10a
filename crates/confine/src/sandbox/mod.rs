//! One sandbox, from a decoded request to its result
//!
//! The supervisor runs each request as a task of its own. The task creates the leaf
//! cgroup, clones pid1 (which clones the tracee), arms the watchdogs once the tracee
//! announces its exec, waits for pid1 to exit and turns what the processes left in the
//! shared state into a [`SandboxResult`].
//!
//! Dropping the task at any point kills and reaps pid1 and removes the leaf.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::future::pending;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::unistd::{getegid, geteuid, pipe2};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, instrument, warn};

use crate::sandbox::cgroup::{CgroupError, CgroupLeaf, CgroupTree};
use crate::sandbox::pid1::Pid1Args;
use crate::sandbox::shared::{Outcome, SharedState};
use crate::sandbox::tracee::TraceeArgs;
use crate::sandbox::watchdog::{CpuCheck, CpuWatchdog};
use crate::sys::{self, CloneArgs, CloneResult, PidFd};
use crate::types::{CgroupUsage, CpuTime, InvalidRequest, SandboxResult, Si, validate_request};
use crate::wire::Request;

pub mod cgroup;
mod mount;
mod pid1;
pub mod shared;
mod tracee;
pub mod watchdog;

/// Why a sandbox could not be built
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("{call}: {errno:?}: {}", errno.desc())]
    Sys { call: String, errno: Errno },

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Request(#[from] InvalidRequest),

    #[error(transparent)]
    Cgroup(#[from] CgroupError),
}

impl SetupError {
    pub fn sys(call: impl Into<String>, errno: Errno) -> Self {
        SetupError::Sys {
            call: call.into(),
            errno,
        }
    }

    pub fn io(call: impl Into<String>, err: io::Error) -> Self {
        let errno = err.raw_os_error().map_or(Errno::EIO, Errno::from_raw);
        Self::sys(call, errno)
    }
}

/// Names the syscall behind an `Errno`
pub(crate) trait SysContext<T> {
    fn call(self, call: &str) -> Result<T, SetupError>;
    fn with_call(self, call: impl FnOnce() -> String) -> Result<T, SetupError>;
}

impl<T> SysContext<T> for Result<T, Errno> {
    fn call(self, call: &str) -> Result<T, SetupError> {
        self.map_err(|errno| SetupError::sys(call, errno))
    }

    fn with_call(self, call: impl FnOnce() -> String) -> Result<T, SetupError> {
        self.map_err(|errno| SetupError::sys(call(), errno))
    }
}

/// What every sandbox of one supervisor shares
#[derive(Debug)]
pub struct SandboxContext {
    pub cgroups: CgroupTree,
    pub available_parallelism: usize,
}

impl SandboxContext {
    pub fn new(cgroups: CgroupTree) -> Self {
        let available_parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            cgroups,
            available_parallelism,
        }
    }
}

/// Run one request to completion
#[instrument(skip_all, fields(argv0 = request.argv.first().map(String::as_str).unwrap_or("")))]
pub async fn run(request: Request, ctx: Arc<SandboxContext>) -> SandboxResult {
    match run_sandbox(request, &ctx).await {
        Ok(result) => result,
        Err(err) => {
            debug!(error = %err, "sandbox setup failed");
            SandboxResult::Error {
                description: err.to_string(),
            }
        }
    }
}

async fn run_sandbox(request: Request, ctx: &SandboxContext) -> Result<SandboxResult, SetupError> {
    validate_request(
        &request.argv,
        &request.env,
        &request.cgroup,
        &request.linux_namespaces,
    )?;

    let mut leaf = ctx.cgroups.create_leaf(&request.cgroup)?;
    let shared = SharedState::new().call("mmap()")?;
    let (exec_read, exec_write) = pipe2(OFlag::O_CLOEXEC).call("pipe2()")?;
    sys::set_nonblocking(exec_read.as_fd()).call("fcntl(O_NONBLOCK)")?;

    let pid1 = spawn_pid1(&request, ctx, &leaf, &shared, exec_write)?;
    let pid1 = Pid1Guard::new(pid1)?;
    let exec_notify = AsyncFd::new(File::from(exec_read)).map_err(|e| SetupError::io("epoll_ctl()", e))?;

    let parallelism = watchdog::max_parallelism(
        request.cgroup.process_num_limit,
        ctx.available_parallelism,
    );
    let mut watching_exec = true;
    let mut wall_deadline: Option<Instant> = None;
    let mut cpu_watchdog: Option<(CpuWatchdog, Instant)> = None;

    loop {
        tokio::select! {
            ready = pid1.fd.readable() => {
                let mut guard = ready.map_err(|e| SetupError::io("epoll_wait()", e))?;
                if pid1.has_exited()? {
                    break;
                }
                guard.clear_ready();
            }
            ready = exec_notify.readable(), if watching_exec => {
                let mut guard = ready.map_err(|e| SetupError::io("epoll_wait()", e))?;
                let mut byte = [0u8; 1];
                match guard.try_io(|file| {
                    let mut file: &File = file.get_ref();
                    file.read(&mut byte)
                }) {
                    Ok(Ok(0)) => watching_exec = false,
                    Ok(Ok(_)) => {
                        watching_exec = false;
                        let Some((_, start_cpu)) = shared.exec_start() else {
                            continue;
                        };
                        let now = Instant::now();
                        debug!("tracee started, arming watchdogs");
                        wall_deadline = request
                            .time_limit
                            .and_then(|limit| watchdog::deadline_after(now, watchdog::wall_timer(limit)));
                        cpu_watchdog = request.cpu_time_limit.and_then(|limit| {
                            let wd = CpuWatchdog::new(start_cpu.total(), limit, parallelism);
                            watchdog::deadline_after(now, wd.first_arm(start_cpu.total()))
                                .map(|at| (wd, at))
                        });
                    }
                    Ok(Err(e)) => return Err(SetupError::io("read(exec notification)", e)),
                    Err(_would_block) => continue,
                }
            }
            () = sleep_until_some(wall_deadline) => {
                debug!("time limit reached");
                wall_deadline = None;
                cpu_watchdog = None;
                leaf.kill()?;
            }
            () = sleep_until_some(cpu_watchdog.map(|(_, at)| at)) => {
                let Some((wd, _)) = cpu_watchdog else {
                    continue;
                };
                match wd.check(leaf.cpu_times()?.total()) {
                    CpuCheck::Kill => {
                        debug!("cpu time limit reached");
                        wall_deadline = None;
                        cpu_watchdog = None;
                        leaf.kill()?;
                    }
                    CpuCheck::Rearm(delay) => {
                        cpu_watchdog = watchdog::deadline_after(Instant::now(), delay)
                            .map(|at| (wd, at));
                    }
                }
            }
        }
    }

    let pid1_si = pid1.reap()?;
    let final_cpu = leaf.cpu_times()?;
    let peak_memory_in_bytes = leaf.peak_memory()?;
    remove_leaf(&mut leaf).await;

    let usage = Usage {
        exec_start: shared.exec_start(),
        waitid_time: shared.waitid_time(),
        final_cpu,
        peak_memory_in_bytes,
    };
    Ok(interpret(shared.outcome(), usage, pid1_si))
}

/// What the cgroup and the shared state said once pid1 was reaped
#[derive(Debug, Clone, Copy)]
struct Usage {
    exec_start: Option<(Duration, CpuTime)>,
    waitid_time: Option<Duration>,
    final_cpu: CpuTime,
    peak_memory_in_bytes: u64,
}

fn interpret(outcome: Outcome, usage: Usage, pid1_si: Si) -> SandboxResult {
    match outcome {
        Outcome::Error(description) => SandboxResult::Error { description },
        Outcome::None => SandboxResult::Error {
            description: format!("pid1 process {pid1_si} without result or error message"),
        },
        Outcome::Ok(si) => match usage.exec_start {
            None => SandboxResult::Error {
                description: format!(
                    "tracee process died unexpectedly before execveat() without an error message: {si}"
                ),
            },
            Some((start, start_cpu)) => SandboxResult::Ok {
                si,
                runtime: usage
                    .waitid_time
                    .map_or(Duration::ZERO, |end| end.saturating_sub(start)),
                cgroup: CgroupUsage {
                    cpu_time: CpuTime {
                        user: usage.final_cpu.user.saturating_sub(start_cpu.user),
                        system: usage.final_cpu.system.saturating_sub(start_cpu.system),
                    },
                    peak_memory_in_bytes: usage.peak_memory_in_bytes,
                },
            },
        },
    }
}

/// Clone pid1 with everything it and the tracee need
fn spawn_pid1(
    request: &Request,
    ctx: &SandboxContext,
    leaf: &CgroupLeaf,
    shared: &SharedState,
    exec_write: OwnedFd,
) -> Result<PidFd, SetupError> {
    let to_cstrings = |what: &'static str, items: &[String]| {
        items
            .iter()
            .map(|s| CString::new(s.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| SetupError::Request(InvalidRequest::NulByte { what }))
    };
    let argv = to_cstrings("argv", &request.argv)?;
    let env = to_cstrings("env", &request.env)?;

    let dev_null = |write: bool| {
        OpenOptions::new()
            .read(!write)
            .write(write)
            .open("/dev/null")
            .map(OwnedFd::from)
            .map_err(|e| SetupError::io("open(\"/dev/null\")", e))
    };
    let stdin = match &request.fds.stdin {
        Some(_) => None,
        None => Some(dev_null(false)?),
    };
    let stdout = match &request.fds.stdout {
        Some(_) => None,
        None => Some(dev_null(true)?),
    };
    let stderr = match &request.fds.stderr {
        Some(_) => None,
        None => Some(dev_null(true)?),
    };
    fn pick<'x>(
        given: &'x Option<OwnedFd>,
        fallback: &'x Option<OwnedFd>,
    ) -> Result<BorrowedFd<'x>, SetupError> {
        given
            .as_ref()
            .or(fallback.as_ref())
            .map(|fd| fd.as_fd())
            .ok_or_else(|| SetupError::Invalid("missing standard stream".to_string()))
    }

    let leaf_dir = leaf.open_dir()?;
    let cpu_stat = leaf.open_cpu_stat()?;
    let pid1_cgroup = ctx.cgroups.open_pid1_dir()?;
    let supervisor = PidFd::open(std::process::id() as libc::pid_t).call("pidfd_open()")?;

    let args = Pid1Args {
        shared,
        supervisor,
        outside_uid: geteuid().as_raw(),
        outside_gid: getegid().as_raw(),
        mount: &request.linux_namespaces.mount,
        tracee_cgroup: leaf_dir.as_fd(),
        tracee: TraceeArgs {
            shared,
            argv,
            env,
            stdin: pick(&request.fds.stdin, &stdin)?,
            stdout: pick(&request.fds.stdout, &stdout)?,
            stderr: pick(&request.fds.stderr, &stderr)?,
            executable: request.fds.executable.as_ref().map(|fd| fd.as_fd()),
            seccomp_bpf: request.fds.seccomp_bpf.as_ref().map(|fd| fd.as_fd()),
            cpu_stat: cpu_stat.as_fd(),
            exec_notify: exec_write.as_fd(),
            user: &request.linux_namespaces.user,
            prlimit: &request.prlimit,
        },
    };

    let mut pidfd: libc::c_int = -1;
    let mut clone_args = CloneArgs {
        flags: (libc::CLONE_NEWUSER
            | libc::CLONE_NEWNS
            | libc::CLONE_NEWPID
            | libc::CLONE_NEWNET
            | libc::CLONE_NEWIPC
            | libc::CLONE_NEWUTS) as u64
            | sys::CLONE_PIDFD
            | sys::CLONE_INTO_CGROUP,
        pidfd: &mut pidfd as *mut libc::c_int as u64,
        exit_signal: libc::SIGCHLD as u64,
        cgroup: pid1_cgroup.as_raw_fd() as u64,
        ..Default::default()
    };
    // SAFETY: the supervisor runs on a single thread and pid1 leaves through _exit()
    match unsafe { sys::clone3(&mut clone_args) }.call("clone3()")? {
        CloneResult::Child => pid1::main(args),
        CloneResult::Parent { pid } => {
            debug!(pid, "pid1 cloned");
            // SAFETY: CLONE_PIDFD stored a fresh descriptor we now own
            Ok(PidFd::from_owned(unsafe { OwnedFd::from_raw_fd(pidfd) }))
        }
    }
}

/// pid1 of a running sandbox; killed and reaped if dropped before [`Pid1Guard::reap`]
struct Pid1Guard {
    fd: AsyncFd<PidFd>,
    reaped: bool,
}

impl Pid1Guard {
    fn new(pidfd: PidFd) -> Result<Self, SetupError> {
        match AsyncFd::try_new(pidfd) {
            Ok(fd) => Ok(Self { fd, reaped: false }),
            Err(err) => {
                let (pidfd, e) = err.into_parts();
                kill_and_reap(&pidfd);
                Err(SetupError::io("epoll_ctl()", e))
            }
        }
    }

    fn has_exited(&self) -> Result<bool, SetupError> {
        self.fd
            .get_ref()
            .poll_exit(Duration::ZERO)
            .call("poll(pid1)")
    }

    fn reap(mut self) -> Result<Si, SetupError> {
        let si = self.fd.get_ref().wait().call("waitid(pid1)")?;
        self.reaped = true;
        Ok(si)
    }
}

impl Drop for Pid1Guard {
    fn drop(&mut self) {
        if !self.reaped {
            kill_and_reap(self.fd.get_ref());
        }
    }
}

fn kill_and_reap(pidfd: &PidFd) {
    if let Err(e) = pidfd.send_signal(Signal::SIGKILL) {
        warn!(error = %e, "failed to kill pid1");
    }
    if let Err(e) = pidfd.wait() {
        warn!(error = %e, "failed to reap pid1");
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Remove the leaf once its last process is gone; the leaf's drop retries otherwise
async fn remove_leaf(leaf: &mut CgroupLeaf) {
    for _ in 0..1000 {
        match leaf.try_remove() {
            Ok(true) => return,
            Ok(false) => sleep(Duration::from_millis(1)).await,
            Err(e) => {
                warn!(error = %e, "failed to remove sandbox cgroup");
                return;
            }
        }
    }
}
