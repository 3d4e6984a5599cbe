use crate::{
    errors::ContainerError,
    hook::HookEvent,
    idmap,
    jail::{caps, close_fds_except, exit_code, wait_for_child, Jail, JailMount, JailPolicy},
    pipe::{close_raw, wait_raw, WaitablePipe},
};
use nix::{
    errno::Errno,
    fcntl::{open, OFlag},
    mount::{mount, umount2, MntFlags, MsFlags},
    sched::{clone, CloneFlags},
    sys::{
        resource::setrlimit,
        signal::{kill, SigSet, Signal},
        stat::Mode,
    },
    unistd::{self, chdir, execvp, fork, pivot_root, setresgid, setresuid, ForkResult, Gid, Pid, Uid},
};
use std::{
    ffi::{CStr, CString},
    fs,
    os::unix::ffi::OsStrExt,
    path::Path,
};

const CHILD_STACK_SIZE: usize = 8 * 1024 * 1024;

// prctl option for the ChromeOS alternate syscall table
const PR_ALT_SYSCALL: libc::c_int = 0x4372_4f53;
const PR_ALT_SYSCALL_SET_SYSCALL_TABLE: libc::c_ulong = 1;

/// Launches children into fresh Linux namespaces
///
/// The child is created with `clone` and waits on a barrier while the
/// launcher writes its id maps, cgroup membership and pid file.
#[derive(Debug, Default)]
pub struct NamespaceJail;

impl NamespaceJail {
    pub fn new() -> Self {
        NamespaceJail
    }
}

fn path_cstring(path: &Path) -> Result<CString, ContainerError> {
    Ok(CString::new(path.as_os_str().as_bytes())?)
}

/// Data the child needs, converted up front so the child side does not
/// allocate
struct Prepared {
    argv: Vec<CString>,
    mounts: Vec<PreparedMount>,
    pivot_root: Option<CString>,
    alt_syscall_table: Option<CString>,
    last_cap: u32,
}

struct PreparedMount {
    source: CString,
    target: CString,
    fs_type: CString,
    flags: MsFlags,
    data: Option<CString>,
    create: bool,
    is_dir: bool,
}

impl Prepared {
    fn new(policy: &JailPolicy, argv: &[String]) -> Result<Self, ContainerError> {
        let argv = argv
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let mounts = policy
            .mounts
            .iter()
            .map(PreparedMount::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Prepared {
            argv,
            mounts,
            pivot_root: policy.pivot_root.as_deref().map(path_cstring).transpose()?,
            alt_syscall_table: policy
                .alt_syscall_table
                .as_deref()
                .map(CString::new)
                .transpose()?,
            last_cap: caps::last_cap(),
        })
    }
}

impl PreparedMount {
    fn new(mount: &JailMount) -> Result<Self, ContainerError> {
        Ok(PreparedMount {
            source: path_cstring(&mount.source)?,
            target: path_cstring(&mount.target)?,
            fs_type: CString::new(mount.fs_type.as_bytes())?,
            flags: mount.flags,
            data: mount.data.as_deref().map(CString::new).transpose()?,
            create: mount.create,
            is_dir: mount.is_dir,
        })
    }

    fn create_target(&self) -> nix::Result<()> {
        let mode = Mode::from_bits_truncate(0o755);
        if self.is_dir {
            match unistd::mkdir(self.target.as_c_str(), mode) {
                Ok(()) | Err(Errno::EEXIST) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            let fd = open(
                self.target.as_c_str(),
                OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_CLOEXEC,
                mode,
            )?;
            close_raw(fd)
        }
    }

    fn apply(&self) -> nix::Result<()> {
        if self.create {
            self.create_target()?;
        }
        let fs_type: Option<&CStr> = if self.fs_type.as_bytes().is_empty() {
            None
        } else {
            Some(self.fs_type.as_c_str())
        };
        mount(
            Some(self.source.as_c_str()),
            self.target.as_c_str(),
            fs_type,
            self.flags,
            self.data.as_deref(),
        )?;
        // Bind mounts ignore every other flag until remounted
        let extra = self.flags - MsFlags::MS_BIND - MsFlags::MS_REC;
        if self.flags.contains(MsFlags::MS_BIND) && !extra.is_empty() {
            mount(
                None::<&CStr>,
                self.target.as_c_str(),
                None::<&CStr>,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | extra,
                None::<&CStr>,
            )?;
        }
        Ok(())
    }
}

fn write_proc_file(pid: Pid, name: &str, contents: &str) -> Result<(), ContainerError> {
    let path = format!("/proc/{}/{}", pid, name);
    fs::write(&path, contents).map_err(|e| {
        ContainerError::Spawn(format!("writing {}: {}", path, e))
    })
}

/// Launcher-side setup that must finish before the child may continue
fn setup_from_parent(policy: &JailPolicy, pid: Pid) -> Result<(), ContainerError> {
    if policy.namespaces.contains(CloneFlags::CLONE_NEWUSER) {
        if let Some(map) = &policy.uid_map {
            write_proc_file(pid, "uid_map", &idmap::kernel_format(map))?;
        }
        if let Some(map) = &policy.gid_map {
            write_proc_file(pid, "setgroups", "deny")?;
            write_proc_file(pid, "gid_map", &idmap::kernel_format(map))?;
        }
    }
    for tasks in &policy.cgroup_tasks {
        fs::write(tasks, pid.to_string()).map_err(|error| ContainerError::CgroupWrite {
            path: tasks.clone(),
            value: pid.to_string(),
            error,
        })?;
    }
    if let Some(path) = &policy.pid_file {
        fs::write(path, format!("{}\n", pid))?;
    }
    Ok(())
}

/// Everything after the barrier, up to and including exec
fn child_main(policy: &JailPolicy, prepared: &Prepared) -> nix::Result<()> {
    SigSet::empty().thread_set_mask()?;

    if policy.namespaces.contains(CloneFlags::CLONE_NEWNS) {
        mount(
            None::<&CStr>,
            "/",
            None::<&CStr>,
            MsFlags::MS_REC | MsFlags::MS_SLAVE,
            None::<&CStr>,
        )?;
    }
    for mount in &prepared.mounts {
        mount.apply()?;
    }

    policy.run_hooks(HookEvent::PreChroot)?;

    if let Some(root) = &prepared.pivot_root {
        mount(
            Some(root.as_c_str()),
            root.as_c_str(),
            None::<&CStr>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&CStr>,
        )?;
        chdir(root.as_c_str())?;
        pivot_root(".", ".")?;
        umount2(".", MntFlags::MNT_DETACH)?;
        chdir("/")?;
    }

    for rlimit in &policy.rlimits {
        setrlimit(rlimit.resource, rlimit.soft, rlimit.hard)?;
    }

    if let Some(table) = &prepared.alt_syscall_table {
        let result = unsafe {
            libc::prctl(
                PR_ALT_SYSCALL,
                PR_ALT_SYSCALL_SET_SYSCALL_TABLE,
                table.as_ptr(),
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        Errno::result(result)?;
    }

    if let Some((_, ambient)) = policy.capmask {
        caps::set_securebits(caps::securebits(policy.securebits_skip_mask, ambient))?;
        caps::set_keepcaps()?;
    }
    if let Some(gid) = policy.gid {
        let gid = Gid::from_raw(gid);
        setresgid(gid, gid, gid)?;
    }
    if let Some(uid) = policy.uid {
        let uid = Uid::from_raw(uid);
        setresuid(uid, uid, uid)?;
    }

    policy.run_hooks(HookEvent::PreDropCaps)?;

    if let Some((mask, ambient)) = policy.capmask {
        caps::drop_to(mask, ambient, prepared.last_cap)?;
    }
    if policy.close_open_fds {
        close_fds_except(&policy.preserved_fds);
    }

    policy.run_hooks(HookEvent::PreExecve)?;

    if policy.run_as_init {
        execvp(&prepared.argv[0], &prepared.argv)?;
        return Ok(());
    }
    match unsafe { fork() }? {
        ForkResult::Child => {
            execvp(&prepared.argv[0], &prepared.argv)?;
            Ok(())
        }
        ForkResult::Parent { child } => reap_until(child),
    }
}

/// Minimal init: reap everything, exit with the status of `main`
fn reap_until(main: Pid) -> nix::Result<()> {
    loop {
        let status = match nix::sys::wait::waitpid(None::<Pid>, None) {
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
            Ok(status) => status,
        };
        if status.pid() == Some(main) {
            unsafe { libc::_exit(exit_code(status)) };
        }
    }
}

impl Jail for NamespaceJail {
    fn spawn(&self, policy: &JailPolicy, argv: &[String]) -> Result<Pid, ContainerError> {
        if argv.is_empty() {
            return Err(crate::errors::ConfigError::EmptyArgv.into());
        }
        let prepared = Prepared::new(policy, argv)?;
        let mut barrier = WaitablePipe::new()?;
        let (barrier_read, barrier_write) = barrier.raw_fds();

        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let child = Box::new(|| {
            let result = close_raw(barrier_write)
                .and_then(|()| wait_raw(barrier_read))
                .and_then(|()| close_raw(barrier_read))
                .and_then(|()| child_main(policy, &prepared));
            if let Err(errno) = result {
                eprintln!("container setup failed: {}", errno);
            }
            127
        });
        let namespaces = policy.namespaces
            & (CloneFlags::CLONE_NEWIPC
                | CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWPID
                | CloneFlags::CLONE_NEWUSER
                | CloneFlags::CLONE_NEWCGROUP
                | CloneFlags::CLONE_NEWNET
                | CloneFlags::CLONE_NEWUTS);
        let pid = clone(child, &mut stack, namespaces, Some(Signal::SIGCHLD as libc::c_int))?;
        log::debug!("cloned child {} with {:?}", pid, namespaces);

        if let Err(e) = setup_from_parent(policy, pid) {
            log::error!("failed to set up child {}: {}", pid, e);
            if let Err(errno) = kill(pid, Signal::SIGKILL) {
                log::warn!("failed to kill child {}: {}", pid, errno);
            }
            if let Err(errno) = wait_for_child(pid) {
                log::warn!("failed to reap child {}: {}", pid, errno);
            }
            return Err(e);
        }
        barrier.signal();
        Ok(pid)
    }
}
