//! Container lifecycle: setup, supervision and teardown
//!
//! A [Container] is single use. [Container::start()] builds the root
//! filesystem, mounts, cgroups and sandbox policy, launches the child, and
//! services its hooks. [Container::wait()] and [Container::kill()] end its
//! life and release everything that was acquired, in reverse order.

use crate::{
    cgroup::Cgroup,
    config::{CgroupDeviceRule, ContainerConfig, DeviceAccess, DeviceType},
    device::create_devices,
    errors::ContainerError,
    hook::{HookCallback, HookEvent, HookState, HOOK_EVENTS},
    idmap,
    jail::{exit_code, wait_for_child, ChildHook, Jail, JailPolicy, NamespaceJail},
    kernel::{HostKernel, Kernel},
    mount::{apply_all, outer_path, MountContext, MountLedger},
};
use nix::{
    errno::Errno,
    fcntl::{open, OFlag},
    mount::MsFlags,
    sched::CloneFlags,
    sys::{
        signal::{kill, Signal},
        stat::Mode,
    },
    unistd::{self, Pid},
};
use std::{
    collections::BTreeMap,
    ffi::CString,
    fs,
    io,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
const PID_FILE_NAME: &str = "container.pid";

/// Status of an exited container
///
/// Much like [std::process::ExitStatus]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExitStatus {
    pub(crate) code: i32,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn code(&self) -> Option<i32> {
        Some(self.code)
    }
}

/// A container, from creation through teardown
pub struct Container {
    name: String,
    rundir: PathBuf,
    cgroup_root: PathBuf,
    kernel: Arc<dyn Kernel>,
    jail: Arc<dyn Jail>,
    cgroup: Option<Cgroup>,
    init_pid: Option<Pid>,
    config_root: Option<PathBuf>,
    runfs: Option<PathBuf>,
    runfsroot: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    ledger: MountLedger,
    hook_states: Vec<(HookState, Vec<HookCallback>)>,
    started: bool,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("rundir", &self.rundir)
            .field("init_pid", &self.init_pid)
            .field("runfs", &self.runfs)
            .field("runfsroot", &self.runfsroot)
            .field("ledger", &self.ledger)
            .finish()
    }
}

impl Container {
    /// Prepare a container named `name`, keeping its run state under
    /// `rundir`
    pub fn new<P: AsRef<Path>>(name: &str, rundir: P) -> Self {
        Container::with_backends(name, rundir, Arc::new(HostKernel::new()), Arc::new(NamespaceJail::new()))
    }

    pub fn with_backends<P: AsRef<Path>>(
        name: &str,
        rundir: P,
        kernel: Arc<dyn Kernel>,
        jail: Arc<dyn Jail>,
    ) -> Self {
        Container {
            name: name.to_string(),
            rundir: rundir.as_ref().to_path_buf(),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            kernel,
            jail,
            cgroup: None,
            init_pid: None,
            config_root: None,
            runfs: None,
            runfsroot: None,
            pid_file: None,
            ledger: MountLedger::new(),
            hook_states: Vec::new(),
            started: false,
        }
    }

    /// Where the cgroup controllers are mounted, `/sys/fs/cgroup` by default
    pub fn cgroup_root<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.cgroup_root = path.as_ref().to_path_buf();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The private run directory, once created
    pub fn root(&self) -> Option<&Path> {
        self.runfs.as_deref()
    }

    /// The container's root as seen from the launcher
    pub fn runfsroot(&self) -> Option<&Path> {
        self.runfsroot.as_deref()
    }

    pub fn pid(&self) -> Option<Pid> {
        self.init_pid
    }

    pub fn pid_file(&self) -> Option<&Path> {
        self.pid_file.as_deref()
    }

    /// Set up the container and launch its program
    ///
    /// On failure the child, if any, is killed and everything acquired so far
    /// is released before the error is returned.
    pub fn start(&mut self, config: &ContainerConfig) -> Result<(), ContainerError> {
        if self.started {
            return Err(ContainerError::AlreadyStarted);
        }
        self.started = true;
        if let Err(e) = self.try_start(config) {
            log::error!("failed to start container {}: {}", self.name, e);
            if let Some(pid) = self.init_pid.take() {
                match kill(pid, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => (),
                    Err(errno) => log::error!("failed to kill {}: {}", pid, errno),
                }
                if let Err(errno) = wait_for_child(pid) {
                    log::debug!("waiting for {} after failed start: {}", pid, errno);
                }
            }
            self.teardown();
            return Err(e);
        }
        Ok(())
    }

    fn try_start(&mut self, config: &ContainerConfig) -> Result<(), ContainerError> {
        if config.program_argv.is_empty() {
            return Err(crate::errors::ConfigError::EmptyArgv.into());
        }
        let kernel = self.kernel.clone();
        self.config_root = config.config_root.clone();

        let runfsroot = self.setup_runfs(config)?;
        let mut policy = JailPolicy::new();

        let context = MountContext {
            name: &self.name,
            root: &runfsroot,
            config_root: self.config_root.as_deref(),
            uid_map: &config.uid_map,
            gid_map: &config.gid_map,
        };
        apply_all(kernel.as_ref(), &context, &config.mounts, &mut self.ledger, &mut policy)?;

        let owner = idmap::outside_id(&config.uid_map, config.cgroup_owner)?;
        let group = idmap::outside_id(&config.gid_map, config.cgroup_group)?;
        let cgroup = Cgroup::create(
            kernel.as_ref(),
            &self.name,
            &self.cgroup_root,
            config.cgroup_parent.as_deref(),
            owner,
            group,
        )?;
        let cgroup = self.cgroup.get_or_insert(cgroup);

        let mut callbacks: BTreeMap<HookEvent, Vec<HookCallback>> = BTreeMap::new();
        if kernel.is_privileged() {
            if !config.devices.is_empty() {
                callbacks
                    .entry(HookEvent::PreChroot)
                    .or_insert_with(Vec::new)
                    .push(device_hook(&kernel, &runfsroot, config));
            }
            setup_device_cgroup(kernel.as_ref(), cgroup, config, self.ledger.loop_devices())?;
        }
        if let Some(setfiles) = &config.run_setfiles {
            if let Some(hook) = setfiles_hook(&kernel, setfiles, &runfsroot, config) {
                callbacks
                    .entry(HookEvent::PreChroot)
                    .or_insert_with(Vec::new)
                    .push(hook);
            }
        }

        let cpu = &config.cpu;
        if let Some(shares) = cpu.shares {
            cgroup.set_cpu_shares(shares)?;
        }
        if let Some(quota) = cpu.quota {
            cgroup.set_cpu_quota(quota)?;
        }
        if let Some(period) = cpu.period {
            cgroup.set_cpu_period(period)?;
        }
        if let Some(rt_runtime) = cpu.rt_runtime {
            cgroup.set_cpu_rt_runtime(rt_runtime)?;
        }
        if let Some(rt_period) = cpu.rt_period {
            cgroup.set_cpu_rt_period(rt_period)?;
        }

        if let Some(pid_file) = &self.pid_file {
            policy.write_pid_file(pid_file);
        }
        configure_policy(&mut policy, config, &runfsroot);
        for tasks in cgroup.tasks_paths() {
            policy.add_to_cgroup(tasks);
        }

        for (event, hooks) in &config.hooks {
            callbacks
                .entry(*event)
                .or_insert_with(Vec::new)
                .extend(hooks.iter().cloned());
        }
        self.hook_states.clear();
        for event in HOOK_EVENTS.iter() {
            if let Some(hooks) = callbacks.remove(event) {
                if hooks.is_empty() {
                    continue;
                }
                let state = HookState::new(*event)?;
                state.install(&mut policy);
                self.hook_states.push((state, hooks));
            }
        }

        // Barriers first, the pre-execve hook may block on the caller
        if let Some(hook) = &config.pre_execve_hook {
            policy.add_hook(HookEvent::PreExecve, hook.clone());
        }
        if let Some(context) = &config.selinux_context {
            policy.add_hook(HookEvent::PreExecve, selinux_hook(context)?);
        }

        log::debug!("spawning {} with {:?}", self.name, policy);
        let pid = self.jail.spawn(&policy, &config.program_argv)?;
        self.init_pid = Some(pid);

        for (state, hooks) in self.hook_states.iter_mut() {
            state.wait_for_hook_and_run(hooks, pid)?;
        }
        self.hook_states.clear();
        log::debug!("container {} running as pid {}", self.name, pid);
        Ok(())
    }

    /// Create the run directory and bind the rootfs into it, unless the
    /// configuration supplies an already mounted root
    fn setup_runfs(&mut self, config: &ContainerConfig) -> Result<PathBuf, ContainerError> {
        if let Some(premounted) = &config.premounted_runfs {
            self.runfsroot = Some(premounted.clone());
            self.pid_file = config.pid_file.clone();
            return Ok(premounted.clone());
        }

        let uid = idmap::outside_id(&config.uid_map, config.uid)?;
        let gid = idmap::outside_id(&config.gid_map, config.gid)?;
        let kernel = self.kernel.clone();

        #[allow(deprecated)]
        let runfs = tempfile::Builder::new()
            .prefix(&format!("{}_", self.name))
            .tempdir_in(&self.rundir)?
            .into_path();
        self.runfs = Some(runfs.clone());
        self.pid_file = Some(
            config
                .pid_file
                .clone()
                .unwrap_or_else(|| runfs.join(PID_FILE_NAME)),
        );
        kernel.chmod(&runfs, 0o700)?;
        kernel.chown(&runfs, uid, gid)?;

        let runfsroot = runfs.join("root");
        fs::create_dir(&runfsroot)?;
        self.runfsroot = Some(runfsroot.clone());
        kernel.chmod(&runfsroot, 0o660)?;
        kernel.chown(&runfsroot, uid, gid)?;

        let mount_error = |errno| ContainerError::Mount {
            from: config.rootfs.clone(),
            destination: runfsroot.clone(),
            errno,
        };
        let flags = config.rootfs_mount_flags.unwrap_or_else(MsFlags::empty);
        kernel
            .mount(
                Some(&config.rootfs),
                &runfsroot,
                None,
                MsFlags::MS_BIND | (flags & MsFlags::MS_REC),
                None,
            )
            .map_err(mount_error)?;
        // Bind mounts ignore every other flag until remounted
        let extra = flags - MsFlags::MS_REC - MsFlags::MS_BIND - MsFlags::MS_REMOUNT;
        if !extra.is_empty() {
            kernel
                .mount(
                    Some(&config.rootfs),
                    &runfsroot,
                    None,
                    MsFlags::MS_REMOUNT | MsFlags::MS_BIND | extra,
                    None,
                )
                .map_err(mount_error)?;
        }
        Ok(runfsroot)
    }

    /// Wait for the program to exit, then tear the container down
    ///
    /// A child that was already reaped elsewhere counts as a clean exit.
    pub fn wait(&mut self) -> Result<ExitStatus, ContainerError> {
        let pid = self.init_pid.ok_or(ContainerError::NotStarted)?;
        let result = wait_for_child(pid);
        self.init_pid = None;
        self.teardown();
        match result {
            Ok(status) => Ok(ExitStatus {
                code: exit_code(status),
            }),
            Err(Errno::ECHILD) => {
                log::debug!("{} was already reaped", pid);
                Ok(ExitStatus { code: 0 })
            }
            Err(errno) => Err(errno.into()),
        }
    }

    /// SIGKILL the program, then [Container::wait()] for it
    pub fn kill(&mut self) -> Result<ExitStatus, ContainerError> {
        let pid = self.init_pid.ok_or(ContainerError::NotStarted)?;
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => (),
            Err(errno) => return Err(errno.into()),
        }
        self.wait()
    }

    /// Let a started container run on after this handle is gone
    ///
    /// Nothing is torn down; the caller takes over cleaning up whatever is
    /// left once the program exits. Returns the program's pid.
    pub fn detach(mut self) -> Option<Pid> {
        self.hook_states.clear();
        if let Some(cgroup) = self.cgroup.take() {
            cgroup.release();
        }
        self.init_pid
    }

    /// Release everything acquired by [Container::start()]
    ///
    /// Every step is attempted; failures are logged. Safe to repeat.
    fn teardown(&mut self) {
        self.hook_states.clear();
        self.ledger.unwind(self.kernel.as_ref());

        if let Some(runfs) = &self.runfs {
            if let Some(runfsroot) = self.runfsroot.take() {
                // The pivot may have stacked mounts below the root, detach them all
                if let Err(e) = self.kernel.detach(&runfsroot) {
                    log::error!("failed to detach {:?}: {}", runfsroot, e);
                }
                if let Err(e) = fs::remove_dir(&runfsroot) {
                    log::error!("failed to remove {:?}: {}", runfsroot, e);
                }
            }
            log::trace!("tearing down run directory {:?}", runfs);
        }
        self.runfsroot = None;

        if let Some(pid_file) = self.pid_file.take() {
            match fs::remove_file(&pid_file) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    log::error!("failed to remove pid file {:?}: {}", pid_file, e)
                }
                _ => (),
            }
        }
        if let Some(runfs) = self.runfs.take() {
            if let Err(e) = fs::remove_dir(&runfs) {
                log::error!("failed to remove {:?}: {}", runfs, e);
            }
        }
        self.cgroup = None;
    }
}

/// Pre-chroot callback creating the device nodes from inside the child's
/// mount namespace
fn device_hook(kernel: &Arc<dyn Kernel>, runfsroot: &Path, config: &ContainerConfig) -> HookCallback {
    let kernel = kernel.clone();
    let root = runfsroot.to_path_buf();
    let devices = config.devices.clone();
    let uid_map = config.uid_map.clone();
    let gid_map = config.gid_map.clone();
    HookCallback::callback(move |pid| {
        kernel.run_in_namespaces(pid, CloneFlags::CLONE_NEWNS, &|| {
            create_devices(kernel.as_ref(), &root, &devices, &uid_map, &gid_map)
        })
    })
}

/// Pre-chroot callback relabeling the writable mounts made outside the
/// namespace, or None if there are none
fn setfiles_hook(
    kernel: &Arc<dyn Kernel>,
    setfiles: &str,
    runfsroot: &Path,
    config: &ContainerConfig,
) -> Option<HookCallback> {
    let destinations: Vec<PathBuf> = config
        .mounts
        .iter()
        .filter(|mount| !mount.mount_in_ns)
        .filter(|mount| !mount.flags.contains(MsFlags::MS_RDONLY))
        .filter(|mount| mount.destination != Path::new("/data") && mount.destination != Path::new("/cache"))
        .map(|mount| outer_path(runfsroot, &mount.destination))
        .collect();
    if destinations.is_empty() {
        return None;
    }
    let kernel = kernel.clone();
    let setfiles = setfiles.to_string();
    let root = runfsroot.to_path_buf();
    Some(HookCallback::callback(move |pid| {
        kernel.run_in_namespaces(pid, CloneFlags::CLONE_NEWNS, &|| {
            let status = Command::new(&setfiles)
                .arg("-r")
                .arg(&root)
                .arg(root.join("file_contexts"))
                .args(&destinations)
                .status()?;
            if status.success() {
                Ok(())
            } else {
                Err(ContainerError::Hook {
                    event: HookEvent::PreChroot,
                    reason: format!("{} exited with {}", setfiles, status),
                })
            }
        })
    }))
}

/// Deny every device, then allow the configured ones and the loop devices
/// backing mounts
fn setup_device_cgroup(
    kernel: &dyn Kernel,
    cgroup: &Cgroup,
    config: &ContainerConfig,
    loop_devices: &[PathBuf],
) -> Result<(), ContainerError> {
    cgroup.deny_all_devices()?;
    for rule in &config.cgroup_devices {
        cgroup.add_device(rule)?;
    }
    for device in loop_devices {
        let (major, minor) = kernel.device_numbers(device)?;
        cgroup.add_device(&CgroupDeviceRule {
            allow: true,
            device_type: DeviceType::Block,
            major: Some(major),
            minor: Some(minor),
            access: DeviceAccess {
                read: true,
                write: false,
                modify: false,
            },
        })?;
    }
    Ok(())
}

/// Child-side hook switching the SELinux context used by the next execve
fn selinux_hook(context: &str) -> Result<ChildHook, ContainerError> {
    let context = CString::new(context)?;
    Ok(Arc::new(move || {
        let fd = open(
            "/proc/thread-self/attr/exec",
            OFlag::O_WRONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        let written = unistd::write(fd, context.as_bytes()).map(drop);
        let closed = unistd::close(fd);
        written.and(closed)
    }))
}

/// Namespaces, ids, root, limits and capabilities for the child
fn configure_policy(policy: &mut JailPolicy, config: &ContainerConfig, runfsroot: &Path) {
    policy.namespaces(
        CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWCGROUP,
    );
    if !config.share_host_netns {
        policy.namespaces(CloneFlags::CLONE_NEWNET);
    }
    if !config.uid_map.is_empty() {
        policy.namespaces(CloneFlags::CLONE_NEWUSER).uid_map(&config.uid_map);
    }
    if !config.gid_map.is_empty() {
        policy.gid_map(&config.gid_map);
    }
    if config.uid > 0 {
        policy.change_uid(config.uid);
    }
    if config.gid > 0 {
        policy.change_gid(config.gid);
    }
    policy.pivot_root(runfsroot);

    if let Some(table) = &config.alt_syscall_table {
        policy.alt_syscall(table);
    }
    for rlimit in &config.rlimits {
        policy.rlimit(*rlimit);
    }
    if let Some((mask, ambient)) = config.capmask {
        policy.capabilities(mask, ambient);
    }
    if config.securebits_skip_mask != 0 {
        policy.securebits_skip_mask(config.securebits_skip_mask);
    }

    for fd in &config.inherited_fds {
        policy.preserve_fd(*fd);
    }
    if !config.keep_fds_open {
        policy.close_open_fds();
    }
    if config.run_as_init {
        policy.run_as_init();
    }
}

#[cfg(test)]
mod tests;
