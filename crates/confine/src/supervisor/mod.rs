//! The supervisor process: one per client, serving requests over a unix socket
//!
//! The supervisor reads frames as fast as they arrive so that EOF is noticed
//! immediately, runs up to `max_parallel_sandboxes` of them at once and writes the
//! results back in request order.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::unistd::geteuid;
use thiserror::Error;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, instrument, warn};

use crate::sandbox::cgroup::CgroupError;
use crate::sandbox::{self, SandboxContext};
use crate::sys;
use crate::types::SandboxResult;
use crate::wire::{self, LEN_PREFIX, WireError};

/// Bytes asked for per `recvmsg()`
const READ_CHUNK: usize = 64 << 10;

/// Complete frames kept waiting for a free slot before reading pauses
///
/// While paused only the end of the stream is watched for, so the input buffer and
/// the queue of received descriptors hold at most this many frames plus one partial.
pub const MAX_QUEUED_FRAMES: usize = 4;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("supervisor is not safe to be run by root")]
    RunAsRoot,

    #[error("Usage: {argv0} <unix socket file descriptor number>")]
    Usage { argv0: String },

    #[error("supervisor: invalid file descriptor number as argument")]
    InvalidFdNumber,

    #[error("supervisor: invalid file descriptor (getsockopt(): {errno:?}: {})", errno.desc())]
    InvalidFd { errno: Errno },

    #[error("supervisor: invalid socket domain, expected AF_UNIX")]
    InvalidDomain,

    #[error("supervisor: invalid socket type, expected SOCK_STREAM")]
    InvalidType,

    #[error("supervisor: {call}: {errno:?}: {}", errno.desc())]
    Sys { call: &'static str, errno: Errno },

    #[error("supervisor: socket: {0}")]
    Io(#[from] io::Error),

    #[error("supervisor: malformed frame: {0}")]
    Wire(#[from] WireError),

    #[error("supervisor: cgroup: {0}")]
    Cgroup(#[from] CgroupError),
}

/// Refuse to supervise anything as root
pub fn check_not_root() -> Result<(), SupervisorError> {
    if geteuid().is_root() {
        return Err(SupervisorError::RunAsRoot);
    }
    Ok(())
}

/// Take the socket named by the only argument, after checking it is a unix stream socket
pub fn socket_from_args(args: &[String]) -> Result<OwnedFd, SupervisorError> {
    let [_, fd_arg] = args else {
        let argv0 = args.first().cloned().unwrap_or_else(|| "confine-supervisor".to_string());
        return Err(SupervisorError::Usage { argv0 });
    };
    let fd: RawFd = fd_arg
        .parse()
        .ok()
        .filter(|fd| *fd >= 0)
        .ok_or(SupervisorError::InvalidFdNumber)?;

    check_socket(fd)?;
    // SAFETY: fd was handed to us by our parent and nothing else in this process owns it
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };
    sys::set_cloexec(socket.as_fd(), true).map_err(|errno| SupervisorError::Sys {
        call: "fcntl(F_SETFD)",
        errno,
    })?;
    Ok(socket)
}

fn check_socket(fd: RawFd) -> Result<(), SupervisorError> {
    let domain = getsockopt_int(fd, libc::SO_DOMAIN).map_err(|errno| SupervisorError::InvalidFd { errno })?;
    if domain != libc::AF_UNIX {
        return Err(SupervisorError::InvalidDomain);
    }
    let ty = getsockopt_int(fd, libc::SO_TYPE).map_err(|errno| SupervisorError::InvalidFd { errno })?;
    if ty != libc::SOCK_STREAM {
        return Err(SupervisorError::InvalidType);
    }
    Ok(())
}

fn getsockopt_int(fd: RawFd, option: libc::c_int) -> Result<libc::c_int, Errno> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value and len describe a valid c_int buffer
    let res = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            (&mut value as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    Errno::result(res)?;
    Ok(value)
}

/// Set `no_new_privs` so nothing below the supervisor can gain privileges through exec
pub fn set_no_new_privs() -> Result<(), SupervisorError> {
    nix::sys::prctl::set_no_new_privs().map_err(|errno| SupervisorError::Sys {
        call: "prctl(PR_SET_NO_NEW_PRIVS)",
        errno,
    })
}

/// Serve requests until the client closes its end of the socket
///
/// Returns once every in-flight sandbox has been torn down. An error means the
/// stream can no longer be trusted; in-flight sandboxes are torn down all the same.
#[instrument(skip(socket, ctx))]
pub async fn serve(
    socket: OwnedFd,
    ctx: Arc<SandboxContext>,
    max_parallel: usize,
) -> Result<(), SupervisorError> {
    sys::set_nonblocking(socket.as_fd()).map_err(|errno| SupervisorError::Sys {
        call: "fcntl(O_NONBLOCK)",
        errno,
    })?;
    let socket = AsyncFd::new(socket)?;
    let mut server = Server {
        ctx,
        max_parallel: max_parallel.max(1),
        inbuf: Vec::new(),
        fds: VecDeque::new(),
        in_flight: VecDeque::new(),
        outbuf: Vec::new(),
        unread_input: false,
    };

    let res = server.run(&socket).await;
    server.shutdown().await;
    res
}

struct Server {
    ctx: Arc<SandboxContext>,
    max_parallel: usize,
    inbuf: Vec<u8>,
    fds: VecDeque<OwnedFd>,
    in_flight: VecDeque<JoinHandle<SandboxResult>>,
    outbuf: Vec<u8>,
    /// Readiness was cleared while paused, so input may be waiting without a new edge
    unread_input: bool,
}

impl Server {
    async fn run(&mut self, socket: &AsyncFd<OwnedFd>) -> Result<(), SupervisorError> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            self.start_buffered()?;
            let paused = self.in_flight.len() >= self.max_parallel
                && queued_frames(&self.inbuf) >= MAX_QUEUED_FRAMES;

            if !paused && self.unread_input {
                self.unread_input = false;
                match socket.try_io(Interest::READABLE, |fd| {
                    wire::recv_with_fds(fd.as_fd(), &mut chunk, &mut self.fds)
                }) {
                    Ok(0) => {
                        debug!(in_flight = self.in_flight.len(), "client closed the connection");
                        return Ok(());
                    }
                    Ok(n) => {
                        self.inbuf.extend_from_slice(&chunk[..n]);
                        continue;
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                        ) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            tokio::select! {
                ready = socket.ready(Interest::READABLE), if paused => {
                    let mut guard = ready?;
                    if guard.ready().is_read_closed() {
                        debug!(in_flight = self.in_flight.len(), "client closed the connection");
                        return Ok(());
                    }
                    guard.clear_ready();
                    self.unread_input = true;
                }
                ready = socket.readable(), if !paused => {
                    let mut guard = ready?;
                    match guard.try_io(|fd| wire::recv_with_fds(fd.get_ref().as_fd(), &mut chunk, &mut self.fds)) {
                        Ok(Ok(0)) => {
                            debug!(in_flight = self.in_flight.len(), "client closed the connection");
                            return Ok(());
                        }
                        Ok(Ok(n)) => self.inbuf.extend_from_slice(&chunk[..n]),
                        Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                        Ok(Err(e)) => return Err(e.into()),
                        Err(_would_block) => {}
                    }
                }
                ready = socket.writable(), if !self.outbuf.is_empty() => {
                    let mut guard = ready?;
                    match guard.try_io(|fd| write_some(fd.get_ref().as_fd(), &self.outbuf)) {
                        Ok(Ok(n)) => {
                            self.outbuf.drain(..n);
                        }
                        Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                        Ok(Err(e)) => return Err(e.into()),
                        Err(_would_block) => {}
                    }
                }
                res = next_result(&mut self.in_flight) => {
                    self.in_flight.pop_front();
                    let result = res.unwrap_or_else(|e| task_failed(&e));
                    self.outbuf.extend(wire::encode_response(&result)?);
                }
            }
        }
    }

    /// Start every fully buffered frame while there is room
    fn start_buffered(&mut self) -> Result<(), SupervisorError> {
        while self.in_flight.len() < self.max_parallel {
            let Some(len) = wire::frame_len(&self.inbuf)? else {
                return Ok(());
            };
            if self.inbuf.len() < len {
                return Ok(());
            }
            let request = wire::decode_request(&self.inbuf[LEN_PREFIX..len], &mut self.fds)?;
            self.inbuf.drain(..len);
            debug!(argv = ?request.argv, "starting sandbox");
            let task = tokio::spawn(sandbox::run(request, Arc::clone(&self.ctx)));
            self.in_flight.push_back(task);
        }
        Ok(())
    }

    /// Abort every sandbox and wait until each one has been torn down
    async fn shutdown(&mut self) {
        for task in &self.in_flight {
            task.abort();
        }
        while let Some(task) = self.in_flight.pop_front() {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                warn!(?e, "sandbox task failed during shutdown");
            }
        }
    }
}

/// Number of complete frames at the front of `buf`
fn queued_frames(mut buf: &[u8]) -> usize {
    let mut count = 0;
    while let Ok(Some(len)) = wire::frame_len(buf) {
        if buf.len() < len {
            break;
        }
        buf = &buf[len..];
        count += 1;
    }
    count
}

/// Result of the oldest in-flight sandbox; pending while there is none
async fn next_result(
    in_flight: &mut VecDeque<JoinHandle<SandboxResult>>,
) -> Result<SandboxResult, JoinError> {
    match in_flight.front_mut() {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

fn task_failed(e: &JoinError) -> SandboxResult {
    warn!(?e, "sandbox task failed");
    SandboxResult::Error {
        description: format!("sandbox task failed: {e}"),
    }
}

fn write_some(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for buf.len() bytes
    let res = unsafe {
        libc::send(
            fd.as_raw_fd(),
            buf.as_ptr().cast(),
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    Errno::result(res)
        .map(|n| n as usize)
        .map_err(io::Error::from)
}
