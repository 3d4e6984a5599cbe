//! The host operations the lifecycle engine depends on
//!
//! [Kernel] is the seam between container setup and the system calls that
//! carry it out, so setup order and unwind order can be checked against a
//! recording implementation.

use crate::{blockdev, errors::ContainerError, jail::wait_for_child};
use nix::{
    mount::{mount, umount, umount2, MntFlags, MsFlags},
    sched::{setns, CloneFlags},
    sys::{
        stat::{major, makedev, minor, mknod, stat, Mode, SFlag},
        wait::WaitStatus,
    },
    unistd::{self, fork, ForkResult, Gid, Pid, Uid},
};
use std::{
    fs::{self, File},
    os::unix::{fs::PermissionsExt, io::AsRawFd},
    path::{Path, PathBuf},
};

/// Closure run by [Kernel::run_in_namespaces()] in a helper process
pub type NamespaceFn<'a> = &'a dyn Fn() -> Result<(), ContainerError>;

pub trait Kernel: Send + Sync {
    /// Whether we are allowed to create device nodes and edit device cgroups
    fn is_privileged(&self) -> bool;

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fs_type: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()>;

    fn unmount(&self, target: &Path) -> nix::Result<()>;

    /// Lazy unmount, leaving nested mounts to be cleaned up by the kernel
    fn detach(&self, target: &Path) -> nix::Result<()>;

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, major: u32, minor: u32) -> nix::Result<()>;

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> nix::Result<()>;

    fn chmod(&self, path: &Path, mode: u32) -> std::io::Result<()>;

    /// Major and minor number of the device node at `path`
    fn device_numbers(&self, path: &Path) -> nix::Result<(u32, u32)>;

    /// Attach `backing` to a free loop device and return the device path
    fn attach_loop(&self, backing: &Path) -> Result<PathBuf, ContainerError>;

    fn detach_loop(&self, device: &Path) -> Result<(), ContainerError>;

    /// Create the dm-verity target `name` over `source`, returning its
    /// device path
    fn setup_verity(&self, name: &str, source: &Path, table: &str) -> Result<PathBuf, ContainerError>;

    fn remove_verity(&self, name: &str) -> Result<(), ContainerError>;

    /// Run `f` in a helper process that has joined the namespaces of `pid`
    fn run_in_namespaces(
        &self,
        pid: Pid,
        namespaces: CloneFlags,
        f: NamespaceFn,
    ) -> Result<(), ContainerError>;
}

/// The running kernel, through `nix`
#[derive(Debug, Default)]
pub struct HostKernel;

impl HostKernel {
    pub fn new() -> Self {
        HostKernel
    }
}

const NAMESPACE_FILES: &[(CloneFlags, &str)] = &[
    (CloneFlags::CLONE_NEWUSER, "user"),
    (CloneFlags::CLONE_NEWIPC, "ipc"),
    (CloneFlags::CLONE_NEWNET, "net"),
    (CloneFlags::CLONE_NEWPID, "pid"),
    (CloneFlags::CLONE_NEWNS, "mnt"),
    (CloneFlags::CLONE_NEWCGROUP, "cgroup"),
];

impl Kernel for HostKernel {
    fn is_privileged(&self) -> bool {
        unistd::getuid().is_root()
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fs_type: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()> {
        mount(source, target, fs_type, flags, data)
    }

    fn unmount(&self, target: &Path) -> nix::Result<()> {
        umount(target)
    }

    fn detach(&self, target: &Path) -> nix::Result<()> {
        umount2(target, MntFlags::MNT_DETACH)
    }

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, major: u32, minor: u32) -> nix::Result<()> {
        mknod(path, kind, perm, makedev(major as u64, minor as u64))
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> nix::Result<()> {
        unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
    }

    fn chmod(&self, path: &Path, mode: u32) -> std::io::Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    fn device_numbers(&self, path: &Path) -> nix::Result<(u32, u32)> {
        let st = stat(path)?;
        Ok((major(st.st_rdev) as u32, minor(st.st_rdev) as u32))
    }

    fn attach_loop(&self, backing: &Path) -> Result<PathBuf, ContainerError> {
        blockdev::attach_loop(backing)
    }

    fn detach_loop(&self, device: &Path) -> Result<(), ContainerError> {
        blockdev::detach_loop(device)
    }

    fn setup_verity(&self, name: &str, source: &Path, table: &str) -> Result<PathBuf, ContainerError> {
        blockdev::setup_verity(name, source, table)
    }

    fn remove_verity(&self, name: &str) -> Result<(), ContainerError> {
        blockdev::remove_verity(name)
    }

    fn run_in_namespaces(
        &self,
        pid: Pid,
        namespaces: CloneFlags,
        f: NamespaceFn,
    ) -> Result<(), ContainerError> {
        // Open everything before forking so the helper only makes setns calls
        let mut files = Vec::new();
        for (flag, name) in NAMESPACE_FILES {
            if namespaces.contains(*flag) {
                files.push((*flag, File::open(format!("/proc/{}/ns/{}", pid, name))?));
            }
        }
        match unsafe { fork() }? {
            ForkResult::Child => {
                let result = files
                    .iter()
                    .try_for_each(|(flag, file)| setns(file.as_raw_fd(), *flag))
                    .map_err(ContainerError::from)
                    .and_then(|()| f());
                let code = match result {
                    Ok(()) => 0,
                    Err(e) => {
                        eprintln!("namespace helper for {} failed: {}", pid, e);
                        1
                    }
                };
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => match wait_for_child(child)? {
                WaitStatus::Exited(_, 0) => Ok(()),
                status => Err(ContainerError::NamespaceHelper(status)),
            },
        }
    }
}
