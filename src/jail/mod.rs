//! Declarative sandbox policy and the process that enters it
//!
//! A [JailPolicy] accumulates everything the child should do between fork
//! and `execve`. Nothing irreversible happens until [Jail::spawn()].

pub mod caps;
mod linux;

pub use linux::NamespaceJail;

use crate::{
    config::{MountSpec, Rlimit},
    errors::ContainerError,
    hook::HookEvent,
};
use nix::{
    errno::Errno,
    sched::CloneFlags,
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd::Pid,
};
use std::{
    collections::BTreeMap,
    fmt,
    os::unix::io::RawFd,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Function run inside the child at a [HookEvent]
///
/// These run between fork and exec, so they should stick to plain system
/// calls on data prepared beforehand.
pub type ChildHook = Arc<dyn Fn() -> nix::Result<()> + Send + Sync>;

/// A mount the child performs itself, after entering its mount namespace
#[derive(Debug, Clone)]
pub struct JailMount {
    pub source: PathBuf,
    /// Absolute path in the launcher's view, under the new root
    pub target: PathBuf,
    pub fs_type: String,
    pub flags: nix::mount::MsFlags,
    pub data: Option<String>,
    pub create: bool,
    pub is_dir: bool,
}

/// Everything the child does between fork and `execve`
#[derive(Clone)]
pub struct JailPolicy {
    pub(crate) namespaces: CloneFlags,
    pub(crate) uid_map: Option<String>,
    pub(crate) gid_map: Option<String>,
    pub(crate) uid: Option<u32>,
    pub(crate) gid: Option<u32>,
    pub(crate) mounts: Vec<JailMount>,
    pub(crate) pivot_root: Option<PathBuf>,
    pub(crate) cgroup_tasks: Vec<PathBuf>,
    pub(crate) alt_syscall_table: Option<String>,
    pub(crate) rlimits: Vec<Rlimit>,
    pub(crate) capmask: Option<(u64, bool)>,
    pub(crate) securebits_skip_mask: u64,
    pub(crate) hooks: BTreeMap<HookEvent, Vec<ChildHook>>,
    pub(crate) preserved_fds: Vec<RawFd>,
    pub(crate) close_open_fds: bool,
    pub(crate) run_as_init: bool,
    pub(crate) pid_file: Option<PathBuf>,
}

impl fmt::Debug for JailPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("JailPolicy")
            .field("namespaces", &self.namespaces)
            .field("uid_map", &self.uid_map)
            .field("gid_map", &self.gid_map)
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("mounts", &self.mounts)
            .field("pivot_root", &self.pivot_root)
            .field("cgroup_tasks", &self.cgroup_tasks)
            .field("capmask", &self.capmask)
            .field(
                "hooks",
                &self
                    .hooks
                    .iter()
                    .map(|(event, hooks)| (*event, hooks.len()))
                    .collect::<Vec<_>>(),
            )
            .field("preserved_fds", &self.preserved_fds)
            .field("run_as_init", &self.run_as_init)
            .finish()
    }
}

impl Default for JailPolicy {
    fn default() -> Self {
        JailPolicy::new()
    }
}

impl JailPolicy {
    pub fn new() -> Self {
        JailPolicy {
            namespaces: CloneFlags::empty(),
            uid_map: None,
            gid_map: None,
            uid: None,
            gid: None,
            mounts: Vec::new(),
            pivot_root: None,
            cgroup_tasks: Vec::new(),
            alt_syscall_table: None,
            rlimits: Vec::new(),
            capmask: None,
            securebits_skip_mask: 0,
            hooks: BTreeMap::new(),
            preserved_fds: Vec::new(),
            close_open_fds: false,
            run_as_init: false,
            pid_file: None,
        }
    }

    pub fn namespaces(&mut self, flags: CloneFlags) -> &mut Self {
        self.namespaces |= flags;
        self
    }

    pub fn uid_map(&mut self, map: &str) -> &mut Self {
        self.uid_map = Some(map.to_string());
        self
    }

    pub fn gid_map(&mut self, map: &str) -> &mut Self {
        self.gid_map = Some(map.to_string());
        self
    }

    pub fn change_uid(&mut self, uid: u32) -> &mut Self {
        self.uid = Some(uid);
        self
    }

    pub fn change_gid(&mut self, gid: u32) -> &mut Self {
        self.gid = Some(gid);
        self
    }

    /// Mount `spec` from inside the new namespace, at `target` under the
    /// new root
    pub fn mount(&mut self, spec: &MountSpec, source: &Path, target: &Path) -> &mut Self {
        self.mounts.push(JailMount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fs_type: spec.fs_type.clone(),
            flags: spec.flags,
            data: spec.data.clone(),
            create: spec.create,
            is_dir: !source.exists() || source.is_dir(),
        });
        self
    }

    pub fn pivot_root<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.pivot_root = Some(path.as_ref().to_path_buf());
        self
    }

    /// Add the child to a cgroup by writing its pid to this `tasks` file
    pub fn add_to_cgroup<P: AsRef<Path>>(&mut self, tasks: P) -> &mut Self {
        self.cgroup_tasks.push(tasks.as_ref().to_path_buf());
        self
    }

    pub fn alt_syscall(&mut self, table: &str) -> &mut Self {
        self.alt_syscall_table = Some(table.to_string());
        self
    }

    pub fn rlimit(&mut self, rlimit: Rlimit) -> &mut Self {
        self.rlimits.push(rlimit);
        self
    }

    pub fn capabilities(&mut self, mask: u64, ambient: bool) -> &mut Self {
        self.capmask = Some((mask, ambient));
        self
    }

    pub fn securebits_skip_mask(&mut self, mask: u64) -> &mut Self {
        self.securebits_skip_mask = mask;
        self
    }

    pub fn add_hook(&mut self, event: HookEvent, hook: ChildHook) -> &mut Self {
        self.hooks.entry(event).or_insert_with(Vec::new).push(hook);
        self
    }

    /// Keep this descriptor open in the child even when closing the rest
    pub fn preserve_fd(&mut self, fd: RawFd) -> &mut Self {
        if fd >= 0 && !self.preserved_fds.contains(&fd) {
            self.preserved_fds.push(fd);
        }
        self
    }

    pub fn close_open_fds(&mut self) -> &mut Self {
        self.close_open_fds = true;
        self
    }

    pub fn run_as_init(&mut self) -> &mut Self {
        self.run_as_init = true;
        self
    }

    pub fn write_pid_file<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.pid_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn hooks(&self, event: HookEvent) -> &[ChildHook] {
        self.hooks.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Run the child-side hooks for one event, stopping at the first failure
    pub fn run_hooks(&self, event: HookEvent) -> nix::Result<()> {
        for hook in self.hooks(event) {
            hook()?;
        }
        Ok(())
    }
}

/// Something that can launch a process into a [JailPolicy]
pub trait Jail: Send + Sync {
    /// Start `argv` under `policy`, returning once the child is running
    /// independently of the launcher
    fn spawn(&self, policy: &JailPolicy, argv: &[String]) -> Result<Pid, ContainerError>;
}

/// Block until `pid` exits, retrying interrupted waits
pub fn wait_for_child(pid: Pid) -> nix::Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Ok(WaitStatus::Stopped(..)) | Ok(WaitStatus::Continued(..)) => continue,
            other => return other,
        }
    }
}

/// Shell-style exit code: the exit status, or 128 plus the signal number
pub fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 0xFF,
    }
}

/// Send `signal` to `pid`; `None` only checks that the process exists
pub fn send_signal(pid: Pid, signal: Option<Signal>) -> nix::Result<()> {
    kill(pid, signal)
}

/// Close every descriptor above stderr that is not in `keep`
///
/// Safe to call between fork and exec; it does not allocate.
pub fn close_fds_except(keep: &[RawFd]) {
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max = if max <= 0 { 1024 } else { max.min(65536) as RawFd };
    for fd in 3..max {
        if !keep.contains(&fd) {
            unsafe {
                libc::close(fd);
            }
        }
    }
}
