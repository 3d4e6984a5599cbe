//! Recording stand-ins for the kernel and the jail, used by unit tests

use crate::{
    errors::ContainerError,
    hook::HOOK_EVENTS,
    jail::{close_fds_except, wait_for_child, Jail, JailPolicy},
    kernel::{Kernel, NamespaceFn},
};
use nix::{
    errno::Errno,
    mount::MsFlags,
    sched::CloneFlags,
    sys::{
        signal::Signal,
        stat::{Mode, SFlag},
        wait::WaitStatus,
    },
    unistd::{execv, fork, ForkResult, Pid},
};
use std::{
    collections::{HashMap, HashSet},
    ffi::CString,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Call {
    Mount {
        source: Option<PathBuf>,
        target: PathBuf,
        fs_type: Option<String>,
        flags: MsFlags,
        data: Option<String>,
    },
    Unmount(PathBuf),
    Detach(PathBuf),
    Mknod {
        path: PathBuf,
        kind: SFlag,
        perm: Mode,
        major: u32,
        minor: u32,
    },
    Chown {
        path: PathBuf,
        uid: u32,
        gid: u32,
    },
    Chmod {
        path: PathBuf,
        mode: u32,
    },
    AttachLoop(PathBuf),
    DetachLoop(PathBuf),
    SetupVerity {
        name: String,
        source: PathBuf,
        table: String,
    },
    RemoveVerity(String),
    RunInNamespaces {
        pid: Pid,
        namespaces: CloneFlags,
    },
}

/// Kernel that records every call and touches nothing
#[derive(Debug, Default)]
pub struct FakeKernel {
    privileged: bool,
    host_devices: HashMap<PathBuf, (u32, u32)>,
    calls: Mutex<Vec<Call>>,
    nodes: Mutex<HashSet<PathBuf>>,
    fail_mount: Mutex<Option<PathBuf>>,
    fail_mknod: Mutex<Option<Errno>>,
    loop_count: Mutex<usize>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Pretend the host has a device node at `path`
    pub fn host_device<P: AsRef<Path>>(mut self, path: P, major: u32, minor: u32) -> Self {
        self.host_devices
            .insert(path.as_ref().to_path_buf(), (major, minor));
        self
    }

    pub fn fail_mount_on<P: AsRef<Path>>(&self, target: P) {
        *self.fail_mount.lock().unwrap() = Some(target.as_ref().to_path_buf());
    }

    pub fn fail_mknod(&self, errno: Errno) {
        *self.fail_mknod.lock().unwrap() = Some(errno);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Targets still mounted, in mount order
    pub fn mounted(&self) -> Vec<PathBuf> {
        let mut mounted: Vec<PathBuf> = Vec::new();
        for call in self.calls() {
            match call {
                Call::Mount { target, flags, .. } if !flags.contains(MsFlags::MS_REMOUNT) => {
                    mounted.push(target)
                }
                Call::Unmount(target) | Call::Detach(target) => {
                    if let Some(index) = mounted.iter().rposition(|m| *m == target) {
                        mounted.remove(index);
                    }
                }
                _ => (),
            }
        }
        mounted
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Kernel for FakeKernel {
    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fs_type: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()> {
        if self.fail_mount.lock().unwrap().as_deref() == Some(target) {
            return Err(Errno::EINVAL);
        }
        self.record(Call::Mount {
            source: source.map(Path::to_path_buf),
            target: target.to_path_buf(),
            fs_type: fs_type.map(str::to_string),
            flags,
            data: data.map(str::to_string),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> nix::Result<()> {
        self.record(Call::Unmount(target.to_path_buf()));
        Ok(())
    }

    fn detach(&self, target: &Path) -> nix::Result<()> {
        self.record(Call::Detach(target.to_path_buf()));
        Ok(())
    }

    fn mknod(&self, path: &Path, kind: SFlag, perm: Mode, major: u32, minor: u32) -> nix::Result<()> {
        self.record(Call::Mknod {
            path: path.to_path_buf(),
            kind,
            perm,
            major,
            minor,
        });
        if let Some(errno) = *self.fail_mknod.lock().unwrap() {
            return Err(errno);
        }
        if self.nodes.lock().unwrap().insert(path.to_path_buf()) {
            Ok(())
        } else {
            Err(Errno::EEXIST)
        }
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> nix::Result<()> {
        self.record(Call::Chown {
            path: path.to_path_buf(),
            uid,
            gid,
        });
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> std::io::Result<()> {
        self.record(Call::Chmod {
            path: path.to_path_buf(),
            mode,
        });
        Ok(())
    }

    fn device_numbers(&self, path: &Path) -> nix::Result<(u32, u32)> {
        self.host_devices.get(path).copied().ok_or(Errno::ENOENT)
    }

    fn attach_loop(&self, backing: &Path) -> Result<PathBuf, ContainerError> {
        self.record(Call::AttachLoop(backing.to_path_buf()));
        let mut count = self.loop_count.lock().unwrap();
        let device = PathBuf::from(format!("/dev/loop{}", *count));
        *count += 1;
        Ok(device)
    }

    fn detach_loop(&self, device: &Path) -> Result<(), ContainerError> {
        self.record(Call::DetachLoop(device.to_path_buf()));
        Ok(())
    }

    fn setup_verity(&self, name: &str, source: &Path, table: &str) -> Result<PathBuf, ContainerError> {
        self.record(Call::SetupVerity {
            name: name.to_string(),
            source: source.to_path_buf(),
            table: table.to_string(),
        });
        Ok(Path::new("/dev/mapper").join(name))
    }

    fn remove_verity(&self, name: &str) -> Result<(), ContainerError> {
        self.record(Call::RemoveVerity(name.to_string()));
        Ok(())
    }

    fn run_in_namespaces(
        &self,
        pid: Pid,
        namespaces: CloneFlags,
        f: NamespaceFn,
    ) -> Result<(), ContainerError> {
        self.record(Call::RunInNamespaces { pid, namespaces });
        f()
    }
}

/// How a forked test child ended
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChildOutcome {
    Exited(i32),
    Signaled(Signal),
    Other,
}

impl ChildOutcome {
    pub fn wait(pid: Pid) -> Self {
        match wait_for_child(pid) {
            Ok(WaitStatus::Exited(_, code)) => ChildOutcome::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => ChildOutcome::Signaled(signal),
            _ => ChildOutcome::Other,
        }
    }
}

/// Fork a child that runs every child-side hook of `policy` in event order,
/// then `then` if given, then exits 0 (or 1 if a hook failed)
fn fork_hook_runner(policy: &JailPolicy, then: Option<(&CString, &[CString])>) -> Pid {
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            // Drop descriptors of concurrently running tests, which would
            // otherwise hold their barriers open
            close_fds_except(&policy.preserved_fds);
            for event in HOOK_EVENTS.iter() {
                if policy.run_hooks(*event).is_err() {
                    unsafe { libc::_exit(1) };
                }
            }
            if let Some((path, argv)) = then {
                let _ = execv(path, argv);
                unsafe { libc::_exit(127) };
            }
            unsafe { libc::_exit(0) }
        }
        ForkResult::Parent { child } => child,
    }
}

pub fn run_hooks_in_child(policy: &JailPolicy) -> Pid {
    fork_hook_runner(policy, None)
}

/// Jail without isolation: the child runs the policy's hooks and then
/// execs the program for real
#[derive(Debug, Default)]
pub struct FakeJail {
    policies: Mutex<Vec<JailPolicy>>,
    fail: bool,
}

impl FakeJail {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn failing() -> Self {
        FakeJail {
            fail: true,
            ..Default::default()
        }
    }

    /// The policy of the most recent spawn
    pub fn last_policy(&self) -> Option<JailPolicy> {
        self.policies.lock().unwrap().last().cloned()
    }
}

impl Jail for FakeJail {
    fn spawn(&self, policy: &JailPolicy, argv: &[String]) -> Result<Pid, ContainerError> {
        self.policies.lock().unwrap().push(policy.clone());
        if self.fail {
            return Err(ContainerError::Spawn("fake jail refused".to_string()));
        }
        let argv = argv
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let pid = fork_hook_runner(policy, Some((&argv[0], &argv)));
        if let Some(path) = &policy.pid_file {
            fs::write(path, format!("{}\n", pid))?;
        }
        Ok(pid)
    }
}
