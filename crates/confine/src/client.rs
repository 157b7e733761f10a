//! The client side: spawning a supervisor and talking to it
//!
//! A [`SupervisorConnection`] is synchronous. [`SupervisorConnection::send_request`]
//! only waits for socket buffer space, [`SupervisorConnection::await_result`] blocks
//! until the oldest outstanding request is answered.

use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use crate::config::{Config, ConfigError, ENV_PREFIX};
use crate::sandbox::cgroup;
use crate::sys::{self, PidFd};
use crate::types::{InvalidRequest, RequestOptions, SandboxResult, Si, validate_request};
use crate::wire::{self, LEN_PREFIX, WireError};

/// Name of the memfd the supervisor writes its diagnostics to
const ERROR_MEMFD_NAME: &std::ffi::CStr = c"confine supervisor errors";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn supervisor {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("supervisor died unexpectedly ({si}): {message}")]
    SupervisorDied { si: Si, message: String },

    #[error("connection to the supervisor is broken")]
    Broken,

    #[error(transparent)]
    InvalidRequest(#[from] InvalidRequest),

    #[error("failed to encode request: {0}")]
    Encode(#[from] WireError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("supervisor connection: {0}")]
    Io(#[from] io::Error),
}

/// Ticket for one sent request, redeemed by [`SupervisorConnection::await_result`]
#[derive(Debug)]
#[must_use = "every request has to be awaited in order"]
pub struct RequestHandle {
    seq: u64,
    token: u32,
}

/// A running supervisor and the socket to it
#[derive(Debug)]
pub struct SupervisorConnection {
    socket: Option<UnixStream>,
    supervisor: PidFd,
    supervisor_pid: u32,
    error_memfd: OwnedFd,
    cgroup_root: PathBuf,
    shutdown_timeout: Duration,
    next_send: u64,
    next_await: u64,
    /// Set once the supervisor was reaped; later calls only see [`SandboxError::Broken`]
    finished: bool,
}

/// Spawn a supervisor configured from the `CONFINE_*` environment
pub fn spawn_supervisor() -> Result<SupervisorConnection, SandboxError> {
    SupervisorConnection::spawn(&Config::from_env()?)
}

impl SupervisorConnection {
    /// Start a supervisor for `config`
    #[instrument(skip(config))]
    pub fn spawn(config: &Config) -> Result<Self, SandboxError> {
        config.validate()?;
        let path = config.supervisor_binary();
        let spawn_err = |source: io::Error| SandboxError::Spawn {
            path: path.clone(),
            source,
        };

        // Both ends share one root: the client reaps the tree the supervisor builds
        let cgroup_root = config.effective_cgroup_root()?;
        cgroup::check_root(&cgroup_root).map_err(ConfigError::from)?;
        let forwarded = Config {
            cgroup_root: Some(cgroup_root.clone()),
            ..config.clone()
        };

        let (client_end, supervisor_end) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| spawn_err(e.into()))?;
        let error_memfd = sys::memfd_create(ERROR_MEMFD_NAME).map_err(|e| spawn_err(e.into()))?;
        let stderr = error_memfd.try_clone().map_err(spawn_err)?;

        let supervisor_fd = supervisor_end.as_raw_fd();
        let mut command = Command::new(&path);
        command
            .arg(supervisor_fd.to_string())
            .env_clear()
            .envs(forwarded.to_env())
            .envs(log_filter_env())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr));
        // SAFETY: only async-signal-safe fcntl() runs between fork and exec
        unsafe {
            command.pre_exec(move || {
                if libc::fcntl(supervisor_fd, libc::F_SETFD, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let mut child = command.spawn().map_err(spawn_err)?;
        drop(supervisor_end);

        let supervisor_pid = child.id();
        // The child is not reaped before the pidfd exists, so the pid cannot be reused
        let supervisor = match PidFd::open(supervisor_pid as libc::pid_t) {
            Ok(pidfd) => pidfd,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(spawn_err(e.into()));
            }
        };
        drop(child);
        debug!(pid = supervisor_pid, path = %path.display(), "supervisor spawned");

        Ok(Self {
            socket: Some(UnixStream::from(client_end)),
            supervisor,
            supervisor_pid,
            error_memfd,
            cgroup_root,
            shutdown_timeout: config.shutdown_timeout(),
            next_send: 0,
            next_await: 0,
            finished: false,
        })
    }

    /// Pid of the supervisor process
    pub fn supervisor_pid(&self) -> u32 {
        self.supervisor_pid
    }

    /// Send a request without waiting for it to be processed
    #[instrument(skip(self, argv, options), fields(argv0 = argv.first().map(|a| a.as_ref()).unwrap_or("")))]
    pub fn send_request<S: AsRef<str>>(
        &mut self,
        argv: &[S],
        options: &RequestOptions<'_>,
    ) -> Result<RequestHandle, SandboxError> {
        if self.finished {
            return Err(SandboxError::Broken);
        }
        let argv: Vec<String> = argv.iter().map(|s| s.as_ref().to_string()).collect();
        validate_request(
            &argv,
            &options.env,
            &options.cgroup,
            &options.linux_namespaces,
        )?;
        let (frame, fds) = wire::encode_request(&argv, options)?;

        let Some(socket) = &self.socket else {
            return Err(SandboxError::Broken);
        };
        if let Err(e) = send_frame(socket, &frame, &fds) {
            debug!(?e, "sending request failed");
            return Err(self.supervisor_died());
        }

        let handle = RequestHandle {
            seq: self.next_send,
            token: self.supervisor_pid,
        };
        self.next_send += 1;
        debug!(seq = handle.seq, len = frame.len(), "request sent");
        Ok(handle)
    }

    /// Block until the result of `handle` arrives
    ///
    /// # Panics
    ///
    /// If `handle` comes from another connection or an older request is still
    /// waiting to be awaited.
    pub fn await_result(&mut self, handle: RequestHandle) -> Result<SandboxResult, SandboxError> {
        assert_eq!(
            handle.token, self.supervisor_pid,
            "request handle belongs to another supervisor connection"
        );
        assert_eq!(
            handle.seq, self.next_await,
            "request handles must be awaited in the order their requests were sent"
        );
        self.next_await += 1;

        if self.finished {
            return Err(SandboxError::Broken);
        }
        let Some(socket) = &mut self.socket else {
            return Err(SandboxError::Broken);
        };
        match read_response(socket) {
            Ok(result) => Ok(result),
            Err(e) => {
                debug!(?e, "reading response failed");
                Err(self.supervisor_died())
            }
        }
    }

    /// Close the connection and wait for the supervisor to exit
    ///
    /// Requests not yet awaited are cancelled.
    pub fn shutdown(mut self) -> Result<(), SandboxError> {
        self.finish()
    }

    /// Kill and reap a supervisor that broke the protocol, returning why it died
    fn supervisor_died(&mut self) -> SandboxError {
        self.socket = None;
        if let Err(e) = self.supervisor.send_signal(Signal::SIGKILL) {
            warn!(?e, "failed to kill supervisor");
        }
        match self.reap() {
            Ok(si) => SandboxError::SupervisorDied {
                si,
                message: self.error_message(),
            },
            Err(e) => e,
        }
    }

    fn finish(&mut self) -> Result<(), SandboxError> {
        if self.finished {
            return Ok(());
        }
        self.socket = None;

        let exited = self
            .supervisor
            .poll_exit(self.shutdown_timeout)
            .map_err(io::Error::from)?;
        let mut killed = false;
        if !exited {
            warn!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "supervisor did not exit in time, killing it"
            );
            self.supervisor
                .send_signal(Signal::SIGKILL)
                .map_err(io::Error::from)?;
            killed = true;
        }

        let si = self.reap()?;
        if si.is_success() || (killed && si == Si::killed(Signal::SIGKILL)) {
            Ok(())
        } else {
            Err(SandboxError::SupervisorDied {
                si,
                message: self.error_message(),
            })
        }
    }

    fn reap(&mut self) -> Result<Si, SandboxError> {
        let si = self.supervisor.wait().map_err(io::Error::from)?;
        self.finished = true;
        debug!(%si, "supervisor reaped");
        if let Err(e) = cgroup::remove_tree(&self.cgroup_root, self.supervisor_pid) {
            warn!(?e, "failed to remove supervisor cgroup");
        }
        Ok(si)
    }

    /// Everything the supervisor wrote to its stderr
    fn error_message(&self) -> String {
        match sys::read_all_at_start(self.error_memfd.as_fd()) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).trim_end().to_string(),
            Err(e) => format!("<cannot read supervisor stderr: {e}>"),
        }
    }
}

impl Drop for SupervisorConnection {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            if std::thread::panicking() {
                error!(%e, "supervisor shutdown failed");
            } else {
                panic!("supervisor shutdown failed: {e}");
            }
        }
    }
}

/// `CONFINE_LOG` is forwarded so the supervisor's verbosity can be raised from outside
fn log_filter_env() -> Option<(String, String)> {
    let key = format!("{ENV_PREFIX}_LOG");
    std::env::var(&key).ok().map(|value| (key, value))
}

fn send_frame(
    socket: &UnixStream,
    frame: &[u8],
    fds: &[std::os::fd::BorrowedFd<'_>],
) -> io::Result<()> {
    let mut sent = 0;
    let mut fds = fds;
    while sent < frame.len() {
        match wire::send_with_fds(socket.as_fd(), &frame[sent..], fds) {
            Ok(n) => {
                sent += n;
                // The descriptors went out with the first accepted byte
                fds = &[];
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[derive(Debug, Error)]
enum ReadError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}

fn read_response(socket: &mut UnixStream) -> Result<SandboxResult, ReadError> {
    let mut prefix = [0u8; LEN_PREFIX];
    socket.read_exact(&mut prefix)?;
    let len = wire::frame_len(&prefix)?.unwrap_or(LEN_PREFIX);
    let mut body = vec![0u8; len - LEN_PREFIX];
    socket.read_exact(&mut body)?;
    Ok(wire::decode_response(&body)?)
}

impl RequestHandle {
    /// Position of the request among those sent on its connection
    pub fn seq(&self) -> u64 {
        self.seq
    }
}
