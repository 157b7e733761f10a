use std::collections::VecDeque;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::time::Duration;

use crate::types::{
    BindMount, CgroupLimits, CpuMaxBandwidth, CreateDir, CreateFile, LinuxNamespaces,
    MountNamespace, MountOp, MountProc, MountTmpfs, Prlimit, RequestOptions, UserNamespace,
};
use crate::wire::{Decoder, Encoder, WireError};

/// Which optional descriptors accompany a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdMask(u8);

impl FdMask {
    pub const STDIN: u8 = 1 << 0;
    pub const STDOUT: u8 = 1 << 1;
    pub const STDERR: u8 = 1 << 2;
    pub const EXECUTABLE: u8 = 1 << 3;
    pub const SECCOMP_BPF: u8 = 1 << 4;
    const ALL: u8 = Self::STDIN | Self::STDOUT | Self::STDERR | Self::EXECUTABLE | Self::SECCOMP_BPF;

    pub fn from_bits(bits: u8) -> Result<Self, WireError> {
        if bits & !Self::ALL != 0 {
            return Err(WireError::InvalidFdMask(bits));
        }
        Ok(Self(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// The optional descriptors of a request, in wire order
#[derive(Debug)]
pub struct RequestFds<F> {
    pub stdin: Option<F>,
    pub stdout: Option<F>,
    pub stderr: Option<F>,
    pub executable: Option<F>,
    pub seccomp_bpf: Option<F>,
}

impl<F> Default for RequestFds<F> {
    fn default() -> Self {
        Self {
            stdin: None,
            stdout: None,
            stderr: None,
            executable: None,
            seccomp_bpf: None,
        }
    }
}

impl<F> RequestFds<F> {
    pub fn mask(&self) -> FdMask {
        let mut bits = 0;
        for (present, bit) in [
            (self.stdin.is_some(), FdMask::STDIN),
            (self.stdout.is_some(), FdMask::STDOUT),
            (self.stderr.is_some(), FdMask::STDERR),
            (self.executable.is_some(), FdMask::EXECUTABLE),
            (self.seccomp_bpf.is_some(), FdMask::SECCOMP_BPF),
        ] {
            if present {
                bits |= bit;
            }
        }
        FdMask(bits)
    }

    pub fn into_vec(self) -> Vec<F> {
        [
            self.stdin,
            self.stdout,
            self.stderr,
            self.executable,
            self.seccomp_bpf,
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn from_ordered(mask: FdMask, mut fds: impl Iterator<Item = F>) -> Self {
        let mut take = |bit| if mask.has(bit) { fds.next() } else { None };
        Self {
            stdin: take(FdMask::STDIN),
            stdout: take(FdMask::STDOUT),
            stderr: take(FdMask::STDERR),
            executable: take(FdMask::EXECUTABLE),
            seccomp_bpf: take(FdMask::SECCOMP_BPF),
        }
    }
}

/// A request as received by the supervisor, owning its descriptors
#[derive(Debug, Default)]
pub struct Request {
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub fds: RequestFds<OwnedFd>,
    pub cgroup: CgroupLimits,
    pub prlimit: Prlimit,
    pub linux_namespaces: LinuxNamespaces,
    pub time_limit: Option<Duration>,
    pub cpu_time_limit: Option<Duration>,
}

const TAG_TMPFS: u8 = 0;
const TAG_PROC: u8 = 1;
const TAG_BIND: u8 = 2;
const TAG_CREATE_DIR: u8 = 3;
const TAG_CREATE_FILE: u8 = 4;

/// Encode a request into a frame plus the descriptors to attach to it
pub fn encode_request<'a>(
    argv: &[String],
    options: &RequestOptions<'a>,
) -> Result<(Vec<u8>, Vec<BorrowedFd<'a>>), WireError> {
    let fds = RequestFds {
        stdin: options.stdin,
        stdout: options.stdout,
        stderr: options.stderr,
        executable: options.executable,
        seccomp_bpf: options.seccomp_bpf,
    };

    let mut enc = Encoder::new();
    enc.u8(fds.mask().bits());
    enc.strings(argv)?;
    enc.strings(&options.env)?;
    encode_cgroup(&mut enc, &options.cgroup);
    encode_prlimit(&mut enc, &options.prlimit);
    encode_namespaces(&mut enc, &options.linux_namespaces)?;
    enc.opt_duration(options.time_limit);
    enc.opt_duration(options.cpu_time_limit);
    Ok((enc.finish()?, fds.into_vec()))
}

/// Decode a request body, taking its descriptors from the front of `fds`
pub fn decode_request(body: &[u8], fds: &mut VecDeque<OwnedFd>) -> Result<Request, WireError> {
    let mut dec = Decoder::new(body);
    let mask = FdMask::from_bits(dec.u8()?)?;
    if mask.count() > fds.len() {
        return Err(WireError::MissingFds {
            expected: mask.count(),
            received: fds.len(),
        });
    }
    let request_fds = RequestFds::from_ordered(mask, fds.drain(..mask.count()));

    let request = Request {
        argv: dec.strings()?,
        env: dec.strings()?,
        fds: request_fds,
        cgroup: decode_cgroup(&mut dec)?,
        prlimit: decode_prlimit(&mut dec)?,
        linux_namespaces: decode_namespaces(&mut dec)?,
        time_limit: dec.opt_duration()?,
        cpu_time_limit: dec.opt_duration()?,
    };
    dec.finish()?;
    Ok(request)
}

fn encode_cgroup(enc: &mut Encoder, cgroup: &CgroupLimits) {
    enc.opt_u32(cgroup.process_num_limit);
    enc.opt_u64(cgroup.memory_limit_in_bytes);
    enc.bool(cgroup.cpu_max_bandwidth.is_some());
    if let Some(bw) = cgroup.cpu_max_bandwidth {
        enc.u32(bw.max_usec);
        enc.u32(bw.period_usec);
    }
}

fn decode_cgroup(dec: &mut Decoder<'_>) -> Result<CgroupLimits, WireError> {
    Ok(CgroupLimits {
        process_num_limit: dec.opt_u32()?,
        memory_limit_in_bytes: dec.opt_u64()?,
        cpu_max_bandwidth: if dec.bool()? {
            Some(CpuMaxBandwidth {
                max_usec: dec.u32()?,
                period_usec: dec.u32()?,
            })
        } else {
            None
        },
    })
}

fn encode_prlimit(enc: &mut Encoder, prlimit: &Prlimit) {
    enc.opt_u64(prlimit.max_address_space_size_in_bytes);
    enc.opt_u64(prlimit.max_core_file_size_in_bytes);
    enc.opt_u64(prlimit.cpu_time_limit_in_seconds);
    enc.opt_u64(prlimit.max_file_size_in_bytes);
    enc.opt_u64(prlimit.max_open_files);
    enc.opt_u64(prlimit.max_stack_size_in_bytes);
}

fn decode_prlimit(dec: &mut Decoder<'_>) -> Result<Prlimit, WireError> {
    Ok(Prlimit {
        max_address_space_size_in_bytes: dec.opt_u64()?,
        max_core_file_size_in_bytes: dec.opt_u64()?,
        cpu_time_limit_in_seconds: dec.opt_u64()?,
        max_file_size_in_bytes: dec.opt_u64()?,
        max_open_files: dec.opt_u64()?,
        max_stack_size_in_bytes: dec.opt_u64()?,
    })
}

fn encode_namespaces(enc: &mut Encoder, ns: &LinuxNamespaces) -> Result<(), WireError> {
    enc.opt_u32(ns.user.inside_uid);
    enc.opt_u32(ns.user.inside_gid);

    let ops = &ns.mount.operations;
    enc.u32(u32::try_from(ops.len()).map_err(|_| WireError::FrameTooLarge(ops.len()))?);
    for op in ops {
        match op {
            MountOp::MountTmpfs(m) => {
                enc.u8(TAG_TMPFS);
                enc.str(&m.path)?;
                enc.opt_u64(m.max_total_size_of_files_in_bytes);
                enc.opt_u64(m.inode_limit);
                enc.u32(m.root_dir_mode);
                enc.bool(m.read_only);
                enc.bool(m.no_exec);
            }
            MountOp::MountProc(m) => {
                enc.u8(TAG_PROC);
                enc.str(&m.path)?;
                enc.bool(m.read_only);
                enc.bool(m.no_exec);
            }
            MountOp::BindMount(m) => {
                enc.u8(TAG_BIND);
                enc.str(&m.source)?;
                enc.str(&m.dest)?;
                enc.bool(m.recursive);
                enc.bool(m.read_only);
                enc.bool(m.no_exec);
                enc.bool(m.symlink_nofollow);
            }
            MountOp::CreateDir(m) => {
                enc.u8(TAG_CREATE_DIR);
                enc.str(&m.path)?;
                enc.u32(m.mode);
            }
            MountOp::CreateFile(m) => {
                enc.u8(TAG_CREATE_FILE);
                enc.str(&m.path)?;
                enc.u32(m.mode);
            }
        }
    }
    enc.opt_str(ns.mount.new_root_mount_path.as_deref())
}

fn decode_namespaces(dec: &mut Decoder<'_>) -> Result<LinuxNamespaces, WireError> {
    let user = UserNamespace {
        inside_uid: dec.opt_u32()?,
        inside_gid: dec.opt_u32()?,
    };

    let count = dec.u32()?;
    let mut operations = Vec::new();
    for _ in 0..count {
        let op = match dec.u8()? {
            TAG_TMPFS => MountOp::MountTmpfs(MountTmpfs {
                path: dec.string()?,
                max_total_size_of_files_in_bytes: dec.opt_u64()?,
                inode_limit: dec.opt_u64()?,
                root_dir_mode: dec.u32()?,
                read_only: dec.bool()?,
                no_exec: dec.bool()?,
            }),
            TAG_PROC => MountOp::MountProc(MountProc {
                path: dec.string()?,
                read_only: dec.bool()?,
                no_exec: dec.bool()?,
            }),
            TAG_BIND => MountOp::BindMount(BindMount {
                source: dec.string()?,
                dest: dec.string()?,
                recursive: dec.bool()?,
                read_only: dec.bool()?,
                no_exec: dec.bool()?,
                symlink_nofollow: dec.bool()?,
            }),
            TAG_CREATE_DIR => MountOp::CreateDir(CreateDir {
                path: dec.string()?,
                mode: dec.u32()?,
            }),
            TAG_CREATE_FILE => MountOp::CreateFile(CreateFile {
                path: dec.string()?,
                mode: dec.u32()?,
            }),
            tag => {
                return Err(WireError::UnknownTag {
                    what: "mount operation",
                    tag,
                });
            }
        };
        operations.push(op);
    }

    Ok(LinuxNamespaces {
        user,
        mount: MountNamespace {
            operations,
            new_root_mount_path: dec.opt_string()?,
        },
    })
}
