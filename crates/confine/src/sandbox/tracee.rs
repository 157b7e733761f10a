//! The sandboxed program's process, from its birth in pid1 up to exec

use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::resource::{Resource, setrlimit};
use nix::unistd::setsid;

use crate::sandbox::cgroup::parse_cpu_stat;
use crate::sandbox::shared::SharedState;
use crate::sandbox::{SetupError, SysContext};
use crate::sys;
use crate::types::{Prlimit, UserNamespace};

/// Size of one `struct sock_filter`
const SOCK_FILTER_SIZE: usize = 8;

/// Exit code of a tracee whose exec failed
pub const EXEC_FAILED_EXIT_CODE: i32 = 127;

/// Everything the tracee needs, prepared by the supervisor before any clone
#[derive(Debug)]
pub struct TraceeArgs<'a> {
    pub shared: &'a SharedState,
    pub argv: Vec<CString>,
    pub env: Vec<CString>,
    pub stdin: BorrowedFd<'a>,
    pub stdout: BorrowedFd<'a>,
    pub stderr: BorrowedFd<'a>,
    pub executable: Option<BorrowedFd<'a>>,
    pub seccomp_bpf: Option<BorrowedFd<'a>>,
    pub cpu_stat: BorrowedFd<'a>,
    pub exec_notify: BorrowedFd<'a>,
    pub user: &'a UserNamespace,
    pub prlimit: &'a Prlimit,
}

impl TraceeArgs<'_> {
    /// Descriptors that have to survive pid1 closing everything else
    pub fn fds(&self) -> Vec<i32> {
        let mut fds = vec![
            self.stdin.as_raw_fd(),
            self.stdout.as_raw_fd(),
            self.stderr.as_raw_fd(),
            self.cpu_stat.as_raw_fd(),
            self.exec_notify.as_raw_fd(),
        ];
        fds.extend(self.executable.map(|fd| fd.as_raw_fd()));
        fds.extend(self.seccomp_bpf.map(|fd| fd.as_raw_fd()));
        fds
    }
}

/// Entry point of the tracee process; never returns
pub fn main(args: TraceeArgs<'_>, proc_dir: BorrowedFd<'_>) -> ! {
    let shared = args.shared;
    let err = match run(args, proc_dir) {
        Ok(never) => match never {},
        Err(err) => err,
    };
    shared.write_error(&format!("tracee: {err}"));
    sys::exit_now(1)
}

fn run(args: TraceeArgs<'_>, proc_dir: BorrowedFd<'_>) -> Result<std::convert::Infallible, SetupError> {
    setsid().call("setsid()")?;
    set_up_user_namespace(args.user, proc_dir)?;

    sys::dup_onto(args.stdin, libc::STDIN_FILENO).call("dup3(stdin)")?;
    sys::dup_onto(args.stdout, libc::STDOUT_FILENO).call("dup3(stdout)")?;
    sys::dup_onto(args.stderr, libc::STDERR_FILENO).call("dup3(stderr)")?;

    apply_prlimit(args.prlimit)?;
    sys::drop_all_capabilities().call("capset()")?;
    // Read before the filter goes in, it may forbid read()
    let seccomp = args.seccomp_bpf.map(read_seccomp_program).transpose()?;

    // Wall time first, so the tracee's wall time is never below its CPU time
    let start = sys::monotonic_raw_now().call("clock_gettime()")?;
    // Lets cpu.stat catch up with what was just spent
    // SAFETY: plain syscall
    unsafe { libc::sched_yield() };
    let cpu_stat = sys::read_all_at_start(args.cpu_stat)
        .map_err(|e| SetupError::io("read(cpu.stat)", e))?;
    let cpu = parse_cpu_stat(&String::from_utf8_lossy(&cpu_stat))
        .map_err(|e| SetupError::Invalid(format!("read_cpu_times(): {e}")))?;
    args.shared.set_exec_start(start, cpu);

    nix::unistd::write(args.exec_notify, b"x").call("write(exec notification)")?;

    // Last, so the filter only ever judges execveat() and the program itself
    if let Some(program) = seccomp {
        sys::install_seccomp_filter(&program).call("seccomp()")?;
    }

    let errno = sys::exec(args.executable, &args.argv, &args.env);
    report_exec_failure(&args.argv[0], errno)
}

/// Map the chosen ids onto pid1's root, through a /proc opened before the mounts
fn set_up_user_namespace(user: &UserNamespace, proc_dir: BorrowedFd<'_>) -> Result<(), SetupError> {
    write_at(proc_dir, c"self/uid_map", &format!("{} 0 1", user.uid()))?;
    write_at(proc_dir, c"self/setgroups", "deny")?;
    write_at(proc_dir, c"self/gid_map", &format!("{} 0 1", user.gid()))
}

fn write_at(dir: BorrowedFd<'_>, name: &CStr, data: &str) -> Result<(), SetupError> {
    let call = || format!("openat({})", name.to_string_lossy());
    // SAFETY: name is NUL terminated and dir is an open directory
    let fd = unsafe {
        libc::openat(
            dir.as_raw_fd(),
            name.as_ptr(),
            libc::O_WRONLY | libc::O_TRUNC | libc::O_CLOEXEC,
        )
    };
    let fd = Errno::result(fd).with_call(call)?;
    // SAFETY: fd was just returned by the kernel
    let mut file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });
    file.write_all(data.as_bytes())
        .map_err(|e| SetupError::io(format!("write({})", name.to_string_lossy()), e))
}

fn apply_prlimit(prlimit: &Prlimit) -> Result<(), SetupError> {
    let limits = [
        (Resource::RLIMIT_AS, prlimit.max_address_space_size_in_bytes),
        (Resource::RLIMIT_CORE, prlimit.max_core_file_size_in_bytes),
        (Resource::RLIMIT_CPU, prlimit.cpu_time_limit_in_seconds),
        (Resource::RLIMIT_FSIZE, prlimit.max_file_size_in_bytes),
        (Resource::RLIMIT_NOFILE, prlimit.max_open_files),
        (Resource::RLIMIT_STACK, prlimit.max_stack_size_in_bytes),
    ];
    for (resource, limit) in limits {
        if let Some(limit) = limit {
            setrlimit(resource, limit, limit).with_call(|| format!("prlimit({resource:?})"))?;
        }
    }
    Ok(())
}

/// Check the length of a raw `sock_filter` array; returns the instruction count
pub fn seccomp_program_len(bytes: usize) -> Result<u16, SetupError> {
    if bytes == 0 {
        return Err(SetupError::Invalid(
            "invalid seccomp_bpf_fd length: the program is empty".to_string(),
        ));
    }
    if bytes % SOCK_FILTER_SIZE != 0 {
        return Err(SetupError::Invalid(format!(
            "invalid seccomp_bpf_fd length: {bytes} is not a multiple of {SOCK_FILTER_SIZE}"
        )));
    }
    u16::try_from(bytes / SOCK_FILTER_SIZE)
        .map_err(|_| SetupError::Invalid("seccomp_bpf_fd is too big".to_string()))
}

fn read_seccomp_program(fd: BorrowedFd<'_>) -> Result<Vec<u8>, SetupError> {
    let program = sys::read_all_at_start(fd).map_err(|e| SetupError::io("read(seccomp_bpf_fd)", e))?;
    seccomp_program_len(program.len())?;
    Ok(program)
}

/// Tell the program's own stderr why it never started, then exit like a shell does
fn report_exec_failure(argv0: &CStr, errno: Errno) -> ! {
    let msg = format!(
        "execve({}): {errno:?}: {}\n",
        argv0.to_string_lossy(),
        errno.desc()
    );
    // SAFETY: fd 2 is the sandbox's stderr, owned by this process until exit
    let mut stderr = std::mem::ManuallyDrop::new(unsafe { File::from_raw_fd(libc::STDERR_FILENO) });
    let _ = stderr.write_all(msg.as_bytes());
    sys::exit_now(EXEC_FAILED_EXIT_CODE)
}
