//! The init process of a sandbox's pid namespace
//!
//! pid1 builds the filesystem, clones the tracee into the sandbox's leaf cgroup, then
//! reaps every process in the namespace until the tracee itself is gone. Its own exit
//! takes whatever is left of the namespace with it.

use std::fs::{self, File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::time::Duration;

use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::unistd::setsid;

use crate::sandbox::shared::SharedState;
use crate::sandbox::tracee::{self, TraceeArgs};
use crate::sandbox::{SetupError, SysContext, mount};
use crate::sys::{self, CloneArgs, CloneResult, PidFd};
use crate::types::{MountNamespace, Si};

/// Everything pid1 needs, prepared by the supervisor before the clone
#[derive(Debug)]
pub struct Pid1Args<'a> {
    pub shared: &'a SharedState,
    pub supervisor: PidFd,
    pub outside_uid: u32,
    pub outside_gid: u32,
    pub mount: &'a MountNamespace,
    pub tracee_cgroup: BorrowedFd<'a>,
    pub tracee: TraceeArgs<'a>,
}

/// Entry point of pid1; never returns
pub fn main(args: Pid1Args<'_>) -> ! {
    let shared = args.shared;
    match run(args) {
        Ok(code) => sys::exit_now(code),
        Err(err) => {
            shared.write_error(&format!("pid1: {err}"));
            sys::exit_now(1)
        }
    }
}

fn run(args: Pid1Args<'_>) -> Result<i32, SetupError> {
    prctl::set_name(c"pid1").call("prctl(SET_NAME)")?;
    watch_supervisor(args.supervisor)?;
    setsid().call("setsid()")?;
    set_up_user_namespace(args.outside_uid, args.outside_gid)?;
    sys::lock_securebits().call("prctl(SET_SECUREBITS)")?;

    let mut keep = args.tracee.fds();
    keep.push(args.tracee_cgroup.as_raw_fd());
    sys::close_fds_except(&mut keep).call("close_range()")?;

    let proc_dir = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open("/proc")
        .map_err(|e| SetupError::io("open(\"/proc\")", e))?;

    mount::apply(args.mount)?;
    sys::drop_all_capabilities().call("capset()")?;

    let tracee_pid = clone_tracee(args.tracee, args.tracee_cgroup, &proc_dir)?;
    drop(proc_dir);

    // pid1 itself needs nothing past this point; this also closes its end of the
    // exec notification pipe so the supervisor sees EOF once the tracee is gone
    sys::close_fds_except(&mut []).call("close_range()")?;

    let (si, waitid_time) = reap_until(tracee_pid)?;

    if args.shared.has_error() {
        // The tracee already described what went wrong
        return Ok(1);
    }
    args.shared.set_waitid_time(waitid_time);
    args.shared.write_ok(si);
    Ok(0)
}

/// Die with the supervisor, including when it died before we asked
fn watch_supervisor(supervisor: PidFd) -> Result<(), SetupError> {
    prctl::set_pdeathsig(Signal::SIGKILL).call("prctl(PR_SET_PDEATHSIG)")?;
    // getppid() is 0 in a fresh pid namespace, so the pidfd is the only way to know
    if supervisor.poll_exit(Duration::ZERO).call("poll()")? {
        return Err(SetupError::Invalid("supervisor died".to_string()));
    }
    Ok(())
}

fn set_up_user_namespace(outside_uid: u32, outside_gid: u32) -> Result<(), SetupError> {
    let write = |path: &str, data: String| {
        fs::write(path, data).map_err(|e| SetupError::io(format!("write({path})"), e))
    };
    write("/proc/self/uid_map", format!("0 {outside_uid} 1"))?;
    write("/proc/self/setgroups", "deny".to_string())?;
    write("/proc/self/gid_map", format!("0 {outside_gid} 1"))
}

fn clone_tracee(
    args: TraceeArgs<'_>,
    cgroup: BorrowedFd<'_>,
    proc_dir: &File,
) -> Result<libc::pid_t, SetupError> {
    // A new user and mount namespace lock the mount tree built above
    let mut clone_args = CloneArgs {
        flags: (libc::CLONE_NEWUSER | libc::CLONE_NEWNS | libc::CLONE_NEWCGROUP) as u64
            | sys::CLONE_INTO_CGROUP,
        exit_signal: libc::SIGCHLD as u64,
        cgroup: cgroup.as_raw_fd() as u64,
        ..Default::default()
    };
    // SAFETY: pid1 is single threaded and the child leaves through _exit()
    match unsafe { sys::clone3(&mut clone_args) }.call("clone3()")? {
        CloneResult::Child => tracee::main(args, proc_dir.as_fd()),
        CloneResult::Parent { pid } => Ok(pid),
    }
}

/// Reap every child until the tracee exits; returns its status and when it was reaped
fn reap_until(tracee_pid: libc::pid_t) -> Result<(Si, Duration), SetupError> {
    loop {
        match sys::wait_any().call("waitid()")? {
            Some((pid, si)) if pid == tracee_pid => {
                let waitid_time = sys::monotonic_raw_now().call("clock_gettime()")?;
                return Ok((si, waitid_time));
            }
            Some(_) => continue,
            None => return Err(SetupError::Invalid("tracee vanished without being reaped".to_string())),
        }
    }
}
