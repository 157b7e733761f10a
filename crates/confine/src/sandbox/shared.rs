//! State shared between the supervisor, pid1 and the tracee
//!
//! An anonymous `MAP_SHARED` page inherited across `clone3()`. Only atomics live in it,
//! so each process reads and writes it without locks. The outcome is claimed by a
//! single compare-exchange: whoever gets there first decides it.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use nix::errno::Errno;

use crate::types::{CpuTime, Si, SiCode};

const STATE_NONE: u32 = 0;
const STATE_WRITING: u32 = 1;
const STATE_OK: u32 = 2;
const STATE_ERROR: u32 = 3;

const PAGE_SIZE: usize = 4096;
const HEADER_SIZE: usize = 64;
const ERROR_CAPACITY: usize = PAGE_SIZE - HEADER_SIZE;

#[repr(C)]
struct Layout {
    state: AtomicU32,
    si_code: AtomicI32,
    si_status: AtomicI32,
    error_len: AtomicU32,
    // Times are stored plus one, zero means not recorded
    exec_start_nanos: AtomicU64,
    exec_start_user_usec: AtomicU64,
    exec_start_system_usec: AtomicU64,
    waitid_nanos: AtomicU64,
    _reserved: [AtomicU64; 2],
    error: [AtomicU8; ERROR_CAPACITY],
}

const _: () = assert!(std::mem::size_of::<Layout>() == PAGE_SIZE);

/// What the sandbox's processes reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    None,
    Ok(Si),
    Error(String),
}

/// The shared page, unmapped on drop
#[derive(Debug)]
pub struct SharedState {
    ptr: NonNull<Layout>,
}

// SAFETY: the mapping only holds atomics
unsafe impl Send for SharedState {}
// SAFETY: as above
unsafe impl Sync for SharedState {}

impl SharedState {
    pub fn new() -> Result<Self, Errno> {
        // SAFETY: anonymous mapping, the kernel zero-fills it which is the initial state
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Errno::last());
        }
        let ptr = NonNull::new(ptr.cast::<Layout>()).ok_or(Errno::ENOMEM)?;
        Ok(Self { ptr })
    }

    fn layout(&self) -> &Layout {
        // SAFETY: the mapping lives as long as self and all-zero is a valid Layout
        unsafe { self.ptr.as_ref() }
    }

    fn claim(&self) -> bool {
        self.layout()
            .state
            .compare_exchange(STATE_NONE, STATE_WRITING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record the tracee's exit status unless an outcome is already set
    pub fn write_ok(&self, si: Si) -> bool {
        if !self.claim() {
            return false;
        }
        let l = self.layout();
        l.si_code.store(si.code.as_raw(), Ordering::Relaxed);
        l.si_status.store(si.status, Ordering::Relaxed);
        l.state.store(STATE_OK, Ordering::Release);
        true
    }

    /// Record a setup failure unless an outcome is already set
    ///
    /// Messages longer than the page are truncated on a character boundary.
    pub fn write_error(&self, message: &str) -> bool {
        if !self.claim() {
            return false;
        }
        let l = self.layout();
        let mut len = message.len().min(ERROR_CAPACITY);
        while !message.is_char_boundary(len) {
            len -= 1;
        }
        for (slot, byte) in l.error.iter().zip(&message.as_bytes()[..len]) {
            slot.store(*byte, Ordering::Relaxed);
        }
        l.error_len.store(len as u32, Ordering::Relaxed);
        l.state.store(STATE_ERROR, Ordering::Release);
        true
    }

    pub fn has_error(&self) -> bool {
        self.layout().state.load(Ordering::Acquire) == STATE_ERROR
    }

    pub fn outcome(&self) -> Outcome {
        let l = self.layout();
        match l.state.load(Ordering::Acquire) {
            STATE_OK => {
                let code = l.si_code.load(Ordering::Relaxed);
                let status = l.si_status.load(Ordering::Relaxed);
                match SiCode::from_raw(code) {
                    Some(code) => Outcome::Ok(Si { code, status }),
                    None => Outcome::Error(format!("invalid si_code {code} reported by pid1")),
                }
            }
            STATE_ERROR => {
                let len = (l.error_len.load(Ordering::Relaxed) as usize).min(ERROR_CAPACITY);
                let bytes: Vec<u8> = l.error[..len]
                    .iter()
                    .map(|b| b.load(Ordering::Relaxed))
                    .collect();
                Outcome::Error(String::from_utf8_lossy(&bytes).into_owned())
            }
            _ => Outcome::None,
        }
    }

    pub fn set_exec_start(&self, time: Duration, cpu: CpuTime) {
        let l = self.layout();
        l.exec_start_user_usec
            .store(cpu.user.as_micros() as u64 + 1, Ordering::Relaxed);
        l.exec_start_system_usec
            .store(cpu.system.as_micros() as u64 + 1, Ordering::Relaxed);
        l.exec_start_nanos
            .store(time.as_nanos() as u64 + 1, Ordering::Release);
    }

    /// Monotonic time and cgroup CPU usage right before exec
    pub fn exec_start(&self) -> Option<(Duration, CpuTime)> {
        let l = self.layout();
        let time = l.exec_start_nanos.load(Ordering::Acquire).checked_sub(1)?;
        let user = l.exec_start_user_usec.load(Ordering::Relaxed).checked_sub(1)?;
        let system = l.exec_start_system_usec.load(Ordering::Relaxed).checked_sub(1)?;
        Some((
            Duration::from_nanos(time),
            CpuTime {
                user: Duration::from_micros(user),
                system: Duration::from_micros(system),
            },
        ))
    }

    pub fn set_waitid_time(&self, time: Duration) {
        self.layout()
            .waitid_nanos
            .store(time.as_nanos() as u64 + 1, Ordering::Release);
    }

    pub fn waitid_time(&self) -> Option<Duration> {
        let nanos = self.layout().waitid_nanos.load(Ordering::Acquire);
        nanos.checked_sub(1).map(Duration::from_nanos)
    }
}

impl Drop for SharedState {
    fn drop(&mut self) {
        // SAFETY: ptr came from mmap with PAGE_SIZE and nothing borrows it anymore
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), PAGE_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::signal::Signal;

    use super::*;

    #[test]
    fn starts_empty() {
        let state = SharedState::new().unwrap();
        assert_eq!(state.outcome(), Outcome::None);
        assert_eq!(state.exec_start(), None);
        assert_eq!(state.waitid_time(), None);
        assert!(!state.has_error());
    }

    #[test]
    fn first_writer_wins() {
        let state = SharedState::new().unwrap();
        assert!(state.write_error("tracee: setsid(): EPERM"));
        assert!(!state.write_ok(Si::exited(0)));
        assert!(!state.write_error("pid1: later"));
        assert_eq!(
            state.outcome(),
            Outcome::Error("tracee: setsid(): EPERM".to_string())
        );
        assert!(state.has_error());
    }

    #[test]
    fn ok_outcome() {
        let state = SharedState::new().unwrap();
        assert!(state.write_ok(Si::killed(Signal::SIGKILL)));
        assert_eq!(state.outcome(), Outcome::Ok(Si::killed(Signal::SIGKILL)));
    }

    #[test]
    fn long_error_is_truncated_on_char_boundary() {
        let state = SharedState::new().unwrap();
        let msg = "ż".repeat(ERROR_CAPACITY);
        state.write_error(&msg);
        let Outcome::Error(stored) = state.outcome() else {
            panic!("expected error");
        };
        assert!(stored.len() <= ERROR_CAPACITY);
        assert!(stored.chars().all(|c| c == 'ż'));
    }

    #[test]
    fn zero_times_are_distinguishable_from_unset() {
        let state = SharedState::new().unwrap();
        state.set_exec_start(Duration::ZERO, CpuTime::default());
        state.set_waitid_time(Duration::from_millis(5));
        assert_eq!(
            state.exec_start(),
            Some((Duration::ZERO, CpuTime::default()))
        );
        assert_eq!(state.waitid_time(), Some(Duration::from_millis(5)));
    }

    #[test]
    fn visible_across_fork() {
        let state = SharedState::new().unwrap();
        // SAFETY: the child only touches the shared page and exits
        match unsafe { nix::unistd::fork() }.unwrap() {
            nix::unistd::ForkResult::Child => {
                state.write_ok(Si::exited(3));
                // SAFETY: leave without running the test harness' destructors
                unsafe { libc::_exit(0) };
            }
            nix::unistd::ForkResult::Parent { child } => {
                nix::sys::wait::waitpid(child, None).unwrap();
            }
        }
        assert_eq!(state.outcome(), Outcome::Ok(Si::exited(3)));
    }
}
