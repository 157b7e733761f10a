//! Building the sandbox filesystem inside pid1's mount namespace

use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, mkdir, pivot_root};

use crate::sandbox::{SetupError, SysContext};
use crate::sys;
use crate::types::{BindMount, MountNamespace, MountOp, MountTmpfs};

/// Apply every operation in order, then pivot into the new root if one is set
pub fn apply(ns: &MountNamespace) -> Result<(), SetupError> {
    chdir("/").call("chdir(\"/\")")?;

    let mut empty_tmpfs_inodes = None;
    for op in &ns.operations {
        match op {
            MountOp::MountTmpfs(op) => {
                let empty = match empty_tmpfs_inodes {
                    Some(n) => n,
                    None => *empty_tmpfs_inodes.insert(probe_empty_tmpfs_inodes(&op.path)?),
                };
                mount_tmpfs(op, empty)?;
            }
            MountOp::MountProc(op) => {
                let flags = ms_flags(op.read_only, op.no_exec);
                mount(Some("proc"), op.path.as_str(), Some("proc"), flags, None::<&str>)
                    .with_call(|| format!("mount(proc at {:?})", op.path))?;
            }
            MountOp::BindMount(op) => bind_mount(op)?,
            MountOp::CreateDir(op) => {
                mkdir(op.path.as_str(), Mode::from_bits_truncate(op.mode))
                    .with_call(|| format!("mkdir({:?})", op.path))?;
            }
            MountOp::CreateFile(op) => {
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(op.mode)
                    .open(&op.path)
                    .map_err(|e| SetupError::io(format!("open({:?}, O_CREAT | O_EXCL)", op.path), e))?;
            }
        }
    }

    if let Some(new_root) = &ns.new_root_mount_path {
        chdir(new_root.as_str()).call("chdir(new_root_mount_path)")?;
        // Must happen in the user namespace that owns the mounts; the tracee's
        // CLONE_NEWUSER | CLONE_NEWNS then locks the whole tree
        pivot_root(".", ".").call("pivot_root(\".\", \".\")")?;
        umount2(".", MntFlags::MNT_DETACH).call("umount2(\".\")")?;
    }
    Ok(())
}

fn ms_flags(read_only: bool, no_exec: bool) -> MsFlags {
    let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_SILENT;
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    if no_exec {
        flags |= MsFlags::MS_NOEXEC;
    }
    flags
}

/// tmpfs mount options for `op` when an empty tmpfs takes `empty_inodes` inodes
pub fn tmpfs_options(op: &MountTmpfs, empty_inodes: u64) -> String {
    // 0 means unlimited for both, so a zero size limit becomes the smallest real one
    let size = match op.max_total_size_of_files_in_bytes {
        None => 0,
        Some(0) => 1,
        Some(n) => n,
    };
    let nr_inodes = match op.inode_limit {
        None => 0,
        Some(n) => n.checked_add(empty_inodes).unwrap_or(0),
    };
    format!(
        "size={size},nr_inodes={nr_inodes},mode={:04o}",
        op.root_dir_mode & 0o7777
    )
}

fn mount_tmpfs(op: &MountTmpfs, empty_inodes: u64) -> Result<(), SetupError> {
    let options = tmpfs_options(op, empty_inodes);
    mount(
        Some("tmpfs"),
        op.path.as_str(),
        Some("tmpfs"),
        ms_flags(op.read_only, op.no_exec),
        Some(options.as_str()),
    )
    .with_call(|| format!("mount(tmpfs at {:?})", op.path))
}

/// How many inodes an empty tmpfs uses for itself; 1 on most kernels, 2 on some
fn probe_empty_tmpfs_inodes(at: &str) -> Result<u64, SetupError> {
    mount(
        Some("tmpfs"),
        at,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_SILENT | MsFlags::MS_NOEXEC,
        Some("size=0,nr_inodes=2,mode=0755"),
    )
    .with_call(|| format!("probing mount(tmpfs at {at:?})"))?;

    let probe = format!("{}/probe", at.trim_end_matches('/'));
    let empty = match mkdir(probe.as_str(), Mode::from_bits_truncate(0o755)) {
        Ok(()) => 1,
        Err(Errno::ENOSPC) => 2,
        Err(e) => return Err(SetupError::sys(format!("probing mkdir({probe:?})"), e)),
    };
    umount2(at, MntFlags::MNT_DETACH).with_call(|| format!("umount2({at:?})"))?;
    Ok(empty)
}

fn bind_mount(op: &BindMount) -> Result<(), SetupError> {
    let source = CString::new(op.source.as_str())
        .map_err(|_| SetupError::Invalid(format!("bind mount source {:?} contains NUL", op.source)))?;
    let dest = CString::new(op.dest.as_str())
        .map_err(|_| SetupError::Invalid(format!("bind mount dest {:?} contains NUL", op.dest)))?;

    let mut flags = sys::OPEN_TREE_CLONE;
    if op.symlink_nofollow {
        flags |= libc::AT_SYMLINK_NOFOLLOW as u32;
    }
    if op.recursive {
        flags |= sys::AT_RECURSIVE;
    }
    let tree = sys::open_tree(&source, flags).with_call(|| format!("open_tree({:?})", op.source))?;

    let mut attr = sys::MOUNT_ATTR_NOSUID;
    if op.read_only {
        attr |= sys::MOUNT_ATTR_RDONLY;
    }
    if op.no_exec {
        attr |= sys::MOUNT_ATTR_NOEXEC;
    }
    sys::mount_setattr(tree.as_fd(), op.recursive, attr).call("mount_setattr()")?;
    sys::move_mount(tree.as_fd(), &dest).with_call(|| format!("move_mount(dest: {:?})", op.dest))
}
