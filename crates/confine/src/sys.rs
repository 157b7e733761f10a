//! Thin wrappers over the Linux syscalls that `nix` does not cover
//!
//! Everything that hands out a kernel resource returns an owned handle.

use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;

use crate::types::{Si, SiCode};

pub const CLONE_PIDFD: u64 = 0x0000_1000;
pub const CLONE_INTO_CGROUP: u64 = 0x2_0000_0000;

const P_PIDFD: libc::idtype_t = 3;
const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;

pub const OPEN_TREE_CLONE: u32 = 1;
pub const AT_RECURSIVE: u32 = 0x8000;
pub const MOVE_MOUNT_F_EMPTY_PATH: u32 = 0x0000_0004;
pub const MOUNT_ATTR_RDONLY: u64 = 0x0000_0001;
pub const MOUNT_ATTR_NOSUID: u64 = 0x0000_0002;
pub const MOUNT_ATTR_NOEXEC: u64 = 0x0000_0008;

/// `struct clone_args` of `clone3()`
#[repr(C)]
#[derive(Debug, Default)]
pub struct CloneArgs {
    pub flags: u64,
    pub pidfd: u64,
    pub child_tid: u64,
    pub parent_tid: u64,
    pub exit_signal: u64,
    pub stack: u64,
    pub stack_size: u64,
    pub tls: u64,
    pub set_tid: u64,
    pub set_tid_size: u64,
    pub cgroup: u64,
}

#[repr(C)]
struct MountAttr {
    attr_set: u64,
    attr_clr: u64,
    propagation: u64,
    userns_fd: u64,
}

pub enum CloneResult {
    Child,
    Parent { pid: libc::pid_t },
}

/// `clone3()` without a separate stack: the child continues like after `fork()`.
///
/// # Safety
///
/// Same rules as `fork()`: in the child only async-signal-safe work may be done if
/// the parent had other threads, and the child must leave through `_exit()`.
pub unsafe fn clone3(args: &mut CloneArgs) -> Result<CloneResult, Errno> {
    // SAFETY: args points to a properly sized clone_args
    let res = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            args as *mut CloneArgs,
            mem::size_of::<CloneArgs>(),
        )
    };
    match Errno::result(res)? {
        0 => Ok(CloneResult::Child),
        pid => Ok(CloneResult::Parent {
            pid: pid as libc::pid_t,
        }),
    }
}

/// A file descriptor referring to a process
#[derive(Debug)]
pub struct PidFd {
    fd: OwnedFd,
}

impl PidFd {
    pub fn open(pid: libc::pid_t) -> Result<Self, Errno> {
        // SAFETY: plain syscall, the returned fd is owned by us
        let res = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
        let fd = Errno::result(res)? as RawFd;
        // SAFETY: fd was just returned by the kernel
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn send_signal(&self, signal: Signal) -> Result<(), Errno> {
        // SAFETY: plain syscall on a valid pidfd
        let res = unsafe {
            libc::syscall(
                libc::SYS_pidfd_send_signal,
                self.fd.as_raw_fd(),
                signal as libc::c_int,
                std::ptr::null::<libc::siginfo_t>(),
                0,
            )
        };
        Errno::result(res).map(drop)
    }

    /// Blocks until the process exits and reaps it
    pub fn wait(&self) -> Result<Si, Errno> {
        self.waitid(0)?.ok_or(Errno::ECHILD)
    }

    /// Reaps the process if it already exited
    pub fn try_wait(&self) -> Result<Option<Si>, Errno> {
        self.waitid(libc::WNOHANG)
    }

    fn waitid(&self, flags: libc::c_int) -> Result<Option<Si>, Errno> {
        // SAFETY: zeroed siginfo_t is valid, si_pid stays 0 when WNOHANG finds nothing
        let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
        loop {
            // SAFETY: info is a valid out pointer
            let res = unsafe {
                libc::waitid(
                    P_PIDFD,
                    self.fd.as_raw_fd() as libc::id_t,
                    &mut info,
                    libc::WEXITED | libc::__WALL | flags,
                )
            };
            match Errno::result(res) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
        // SAFETY: the kernel filled the SIGCHLD part of info
        let (pid, status) = unsafe { (info.si_pid(), info.si_status()) };
        if pid == 0 {
            return Ok(None);
        }
        Ok(si_from_raw(info.si_code, status))
    }

    /// Waits at most `timeout` for the process to exit, without reaping it
    pub fn poll_exit(&self, timeout: Duration) -> Result<bool, Errno> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        loop {
            // SAFETY: pfd is a single valid pollfd
            let res = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            match Errno::result(res) {
                Ok(n) => return Ok(n > 0),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl AsFd for PidFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PidFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

pub fn si_from_raw(code: libc::c_int, status: libc::c_int) -> Option<Si> {
    SiCode::from_raw(code).map(|code| Si { code, status })
}

/// Reap any child; returns `None` once there are no children left
pub fn wait_any() -> Result<Option<(libc::pid_t, Si)>, Errno> {
    // SAFETY: zeroed siginfo_t is valid
    let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
    loop {
        // SAFETY: info is a valid out pointer
        let res = unsafe { libc::waitid(libc::P_ALL, 0, &mut info, libc::WEXITED | libc::__WALL) };
        match Errno::result(res) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    // SAFETY: the kernel filled the SIGCHLD part of info
    let (pid, status) = unsafe { (info.si_pid(), info.si_status()) };
    let si = si_from_raw(info.si_code, status).unwrap_or(Si::exited(status));
    Ok(Some((pid, si)))
}

pub fn open_tree(path: &CStr, flags: u32) -> Result<OwnedFd, Errno> {
    // SAFETY: path is NUL terminated
    let res = unsafe {
        libc::syscall(
            libc::SYS_open_tree,
            libc::AT_FDCWD,
            path.as_ptr(),
            flags | libc::O_CLOEXEC as u32,
        )
    };
    let fd = Errno::result(res)? as RawFd;
    // SAFETY: fd was just returned by the kernel
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn mount_setattr(fd: BorrowedFd<'_>, recursive: bool, attr_set: u64) -> Result<(), Errno> {
    let attr = MountAttr {
        attr_set,
        attr_clr: 0,
        propagation: 0,
        userns_fd: 0,
    };
    let mut flags = libc::AT_EMPTY_PATH as u32;
    if recursive {
        flags |= AT_RECURSIVE;
    }
    // SAFETY: attr outlives the call and its size is passed along
    let res = unsafe {
        libc::syscall(
            libc::SYS_mount_setattr,
            fd.as_raw_fd(),
            c"".as_ptr(),
            flags,
            &attr as *const MountAttr,
            mem::size_of::<MountAttr>(),
        )
    };
    Errno::result(res).map(drop)
}

pub fn move_mount(fd: BorrowedFd<'_>, dest: &CStr) -> Result<(), Errno> {
    // SAFETY: both paths are NUL terminated
    let res = unsafe {
        libc::syscall(
            libc::SYS_move_mount,
            fd.as_raw_fd(),
            c"".as_ptr(),
            libc::AT_FDCWD,
            dest.as_ptr(),
            MOVE_MOUNT_F_EMPTY_PATH,
        )
    };
    Errno::result(res).map(drop)
}

/// Close every descriptor above stderr that is not in `keep`
pub fn close_fds_except(keep: &mut [RawFd]) -> Result<(), Errno> {
    keep.sort_unstable();
    let mut first = libc::STDERR_FILENO as libc::c_uint + 1;
    for &fd in keep.iter() {
        let fd = fd as libc::c_uint;
        if fd < first {
            continue;
        }
        if fd > first {
            close_range(first, fd - 1)?;
        }
        first = fd + 1;
    }
    close_range(first, libc::c_uint::MAX)
}

fn close_range(first: libc::c_uint, last: libc::c_uint) -> Result<(), Errno> {
    // SAFETY: plain syscall
    let res = unsafe { libc::syscall(libc::SYS_close_range, first, last, 0) };
    Errno::result(res).map(drop)
}

pub fn memfd_create(name: &CStr) -> Result<OwnedFd, Errno> {
    // SAFETY: name is NUL terminated
    let fd = Errno::result(unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) })?;
    // SAFETY: fd was just returned by the kernel
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn set_cloexec(fd: BorrowedFd<'_>, cloexec: bool) -> Result<(), Errno> {
    let flags = if cloexec { libc::FD_CLOEXEC } else { 0 };
    // SAFETY: fcntl on a borrowed, open fd
    Errno::result(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, flags) }).map(drop)
}

pub fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<(), Errno> {
    // SAFETY: fcntl on a borrowed, open fd
    let flags = Errno::result(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) })?;
    // SAFETY: as above
    Errno::result(unsafe {
        libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK)
    })
    .map(drop)
}

/// Read the whole content of `fd` from offset 0 without moving its file position
pub fn read_all_at_start(fd: BorrowedFd<'_>) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        // SAFETY: chunk is a valid writable buffer of the given length
        let res = unsafe {
            libc::pread(
                fd.as_raw_fd(),
                chunk.as_mut_ptr().cast(),
                chunk.len(),
                data.len() as libc::off_t,
            )
        };
        match Errno::result(res) {
            Ok(0) => return Ok(data),
            Ok(n) => data.extend_from_slice(&chunk[..n as usize]),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Drop every capability in the current user namespace
pub fn drop_all_capabilities() -> Result<(), Errno> {
    #[repr(C)]
    struct CapHeader {
        version: u32,
        pid: libc::c_int,
    }
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct CapData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }
    const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

    let header = CapHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [CapData {
        effective: 0,
        permitted: 0,
        inheritable: 0,
    }; 2];
    // SAFETY: header and data have the layout capset() expects for version 3
    let res = unsafe { libc::syscall(libc::SYS_capset, &header, data.as_ptr()) };
    Errno::result(res).map(drop)
}

/// Locked securebits: root gets no special treatment on exec in this process tree
pub fn lock_securebits() -> Result<(), Errno> {
    const SECBIT_NOROOT: libc::c_ulong = 1 << 0;
    const SECBIT_NOROOT_LOCKED: libc::c_ulong = 1 << 1;
    const SECBIT_NO_SETUID_FIXUP: libc::c_ulong = 1 << 2;
    const SECBIT_NO_SETUID_FIXUP_LOCKED: libc::c_ulong = 1 << 3;
    const SECBIT_KEEP_CAPS_LOCKED: libc::c_ulong = 1 << 5;
    const SECBIT_NO_CAP_AMBIENT_RAISE: libc::c_ulong = 1 << 6;
    const SECBIT_NO_CAP_AMBIENT_RAISE_LOCKED: libc::c_ulong = 1 << 7;

    let bits = SECBIT_NOROOT
        | SECBIT_NOROOT_LOCKED
        | SECBIT_NO_SETUID_FIXUP
        | SECBIT_NO_SETUID_FIXUP_LOCKED
        | SECBIT_KEEP_CAPS_LOCKED
        | SECBIT_NO_CAP_AMBIENT_RAISE
        | SECBIT_NO_CAP_AMBIENT_RAISE_LOCKED;
    // SAFETY: plain prctl
    Errno::result(unsafe { libc::prctl(libc::PR_SET_SECUREBITS, bits, 0, 0, 0) }).map(drop)
}

/// Install a seccomp-bpf program given as raw `struct sock_filter` bytes
pub fn install_seccomp_filter(program: &[u8]) -> Result<(), Errno> {
    let filter_size = mem::size_of::<libc::sock_filter>();
    let len = program.len() / filter_size;
    let filters: Vec<libc::sock_filter> = program
        .chunks_exact(filter_size)
        .map(|c| libc::sock_filter {
            code: u16::from_ne_bytes([c[0], c[1]]),
            jt: c[2],
            jf: c[3],
            k: u32::from_ne_bytes([c[4], c[5], c[6], c[7]]),
        })
        .collect();
    let prog = libc::sock_fprog {
        len: len as libc::c_ushort,
        filter: filters.as_ptr() as *mut libc::sock_filter,
    };
    // SAFETY: prog points to `len` valid filters that outlive the call
    let res = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0,
            &prog as *const libc::sock_fprog,
        )
    };
    Errno::result(res).map(drop)
}

/// `CLOCK_MONOTONIC_RAW`, the clock every sandbox timestamp is taken with
pub fn monotonic_raw_now() -> Result<Duration, Errno> {
    // SAFETY: zeroed timespec is valid
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    // SAFETY: ts is a valid out pointer
    Errno::result(unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts) })?;
    Ok(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}

/// `dup3()` onto `target`, clearing close-on-exec when the descriptor is already there
pub fn dup_onto(fd: BorrowedFd<'_>, target: RawFd) -> Result<(), Errno> {
    if fd.as_raw_fd() == target {
        return set_cloexec(fd, false);
    }
    // SAFETY: target is replaced atomically, fd stays open
    Errno::result(unsafe { libc::dup3(fd.as_raw_fd(), target, 0) }).map(drop)
}

/// `execveat(fd, "", AT_EMPTY_PATH)` or `execve(argv[0])`; only returns on failure
pub fn exec(executable: Option<BorrowedFd<'_>>, argv: &[CString], env: &[CString]) -> Errno {
    let Some(path) = argv.first() else {
        return Errno::EINVAL;
    };
    let argv_ptrs: Vec<*const libc::c_char> = argv
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let env_ptrs: Vec<*const libc::c_char> = env
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    // SAFETY: both arrays are NULL terminated and point into live CStrings
    unsafe {
        match executable {
            Some(fd) => {
                libc::syscall(
                    libc::SYS_execveat,
                    fd.as_raw_fd(),
                    c"".as_ptr(),
                    argv_ptrs.as_ptr(),
                    env_ptrs.as_ptr(),
                    libc::AT_EMPTY_PATH,
                );
            }
            None => {
                libc::execve(path.as_ptr(), argv_ptrs.as_ptr(), env_ptrs.as_ptr());
            }
        }
    }
    Errno::last()
}

/// Leave the process immediately, without unwinding or running atexit handlers
pub fn exit_now(code: i32) -> ! {
    // SAFETY: _exit never returns and is async-signal-safe
    unsafe { libc::_exit(code) }
}
