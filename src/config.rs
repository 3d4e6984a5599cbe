//! Container configuration, built up by the caller before [crate::Container::start()]

use crate::{
    errors::ConfigError,
    hook::{HookCallback, HookEvent, HookPipes},
    jail::ChildHook,
};
use nix::{mount::MsFlags, sys::resource::Resource};
use std::{
    collections::BTreeMap,
    fmt,
    os::unix::io::RawFd,
    path::{Path, PathBuf},
};

/// Resource limits beyond this count are rejected
pub const MAX_RLIMITS: usize = 32;

/// One filesystem to mount while setting up the container
#[derive(Debug, Clone)]
pub struct MountSpec {
    /// Used only in diagnostics
    pub name: String,
    pub source: PathBuf,
    /// Path as seen inside the container
    pub destination: PathBuf,
    pub fs_type: String,
    pub data: Option<String>,
    /// Device-mapper verity table, `@DEV@` stands for the source device
    pub verity: Option<String>,
    pub flags: MsFlags,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    /// Performed by the jail inside the new mount namespace rather than by
    /// the launcher before the child is spawned
    pub mount_in_ns: bool,
    pub create: bool,
    pub loopback: bool,
}

impl MountSpec {
    pub fn new<S: AsRef<Path>, D: AsRef<Path>>(
        name: &str,
        source: S,
        destination: D,
        fs_type: &str,
    ) -> Self {
        MountSpec {
            name: name.to_string(),
            source: source.as_ref().to_path_buf(),
            destination: destination.as_ref().to_path_buf(),
            fs_type: fs_type.to_string(),
            data: None,
            verity: None,
            flags: MsFlags::empty(),
            uid: 0,
            gid: 0,
            mode: 0o755,
            mount_in_ns: false,
            create: false,
            loopback: false,
        }
    }

    pub fn is_bind(&self) -> bool {
        self.flags.contains(MsFlags::MS_BIND)
    }
}

/// Kind of device node or device cgroup rule
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeviceType {
    Block,
    Char,
    /// Only meaningful in cgroup rules
    All,
}

impl DeviceType {
    pub fn from_char(c: char) -> Result<Self, ConfigError> {
        match c {
            'b' => Ok(DeviceType::Block),
            'c' => Ok(DeviceType::Char),
            'a' => Ok(DeviceType::All),
            other => Err(ConfigError::InvalidDeviceType(other)),
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            DeviceType::Block => 'b',
            DeviceType::Char => 'c',
            DeviceType::All => 'a',
        }
    }
}

/// Minor number of a device node
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeviceMinor {
    Fixed(u32),
    /// Use the minor of the node at the same path on the host, skipping the
    /// device when the host has no such node
    CopyFromHost,
}

/// A device node to create inside the container
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceSpec {
    pub device_type: DeviceType,
    pub path: PathBuf,
    pub fs_permissions: u32,
    pub major: u32,
    pub minor: DeviceMinor,
    pub uid: u32,
    pub gid: u32,
}

impl DeviceSpec {
    /// Validate a device description
    ///
    /// `copy_minor` requires `minor` to be -1, otherwise `minor` must not be
    /// negative.
    #[allow(clippy::too_many_arguments)]
    pub fn new<P: AsRef<Path>>(
        device_type: char,
        path: P,
        fs_permissions: u32,
        major: u32,
        minor: i32,
        copy_minor: bool,
        uid: u32,
        gid: u32,
    ) -> Result<Self, ConfigError> {
        let device_type = match DeviceType::from_char(device_type)? {
            DeviceType::All => return Err(ConfigError::InvalidDeviceType('a')),
            other => other,
        };
        let minor = if copy_minor {
            if minor != -1 {
                return Err(ConfigError::CopyMinorWithExplicitMinor(minor));
            }
            DeviceMinor::CopyFromHost
        } else if minor < 0 {
            return Err(ConfigError::NegativeMinor(minor));
        } else {
            DeviceMinor::Fixed(minor as u32)
        };
        Ok(DeviceSpec {
            device_type,
            path: path.as_ref().to_path_buf(),
            fs_permissions,
            major,
            minor,
            uid,
            gid,
        })
    }
}

/// Access a device cgroup rule grants or denies
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct DeviceAccess {
    pub read: bool,
    pub write: bool,
    pub modify: bool,
}

impl DeviceAccess {
    pub fn any(&self) -> bool {
        self.read || self.write || self.modify
    }
}

impl fmt::Display for DeviceAccess {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.read {
            f.write_str("r")?;
        }
        if self.write {
            f.write_str("w")?;
        }
        if self.modify {
            f.write_str("m")?;
        }
        Ok(())
    }
}

/// One line for `devices.allow` or `devices.deny`
///
/// A major or minor of `None` matches every number.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CgroupDeviceRule {
    pub allow: bool,
    pub device_type: DeviceType,
    pub major: Option<u32>,
    pub minor: Option<u32>,
    pub access: DeviceAccess,
}

impl fmt::Display for CgroupDeviceRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn number(n: Option<u32>) -> String {
            n.map(|n| n.to_string()).unwrap_or_else(|| "*".to_string())
        }
        write!(
            f,
            "{} {}:{} {}",
            self.device_type.as_char(),
            number(self.major),
            number(self.minor),
            self.access
        )
    }
}

/// CPU controller settings, already validated
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct CpuParams {
    pub shares: Option<i64>,
    pub quota: Option<i64>,
    pub period: Option<i64>,
    pub rt_runtime: Option<i64>,
    pub rt_period: Option<i64>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Rlimit {
    pub resource: Resource,
    pub soft: u64,
    pub hard: u64,
}

/// Everything needed to start one container
///
/// Setters that can reject their input return a [ConfigError] right away.
#[derive(Clone)]
pub struct ContainerConfig {
    pub(crate) config_root: Option<PathBuf>,
    pub(crate) rootfs: PathBuf,
    pub(crate) rootfs_mount_flags: Option<MsFlags>,
    pub(crate) premounted_runfs: Option<PathBuf>,
    pub(crate) pid_file: Option<PathBuf>,
    pub(crate) program_argv: Vec<String>,
    pub(crate) uid: u32,
    pub(crate) uid_map: String,
    pub(crate) gid: u32,
    pub(crate) gid_map: String,
    pub(crate) alt_syscall_table: Option<String>,
    pub(crate) mounts: Vec<MountSpec>,
    pub(crate) devices: Vec<DeviceSpec>,
    pub(crate) cgroup_devices: Vec<CgroupDeviceRule>,
    pub(crate) run_setfiles: Option<String>,
    pub(crate) cpu: CpuParams,
    pub(crate) cgroup_parent: Option<String>,
    pub(crate) cgroup_owner: u32,
    pub(crate) cgroup_group: u32,
    pub(crate) share_host_netns: bool,
    pub(crate) keep_fds_open: bool,
    pub(crate) rlimits: Vec<Rlimit>,
    pub(crate) capmask: Option<(u64, bool)>,
    pub(crate) securebits_skip_mask: u64,
    pub(crate) run_as_init: bool,
    pub(crate) selinux_context: Option<String>,
    pub(crate) pre_execve_hook: Option<ChildHook>,
    pub(crate) hooks: BTreeMap<HookEvent, Vec<HookCallback>>,
    pub(crate) inherited_fds: Vec<RawFd>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig::new()
    }
}

impl fmt::Debug for ContainerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ContainerConfig")
            .field("rootfs", &self.rootfs)
            .field("program_argv", &self.program_argv)
            .field("uid_map", &self.uid_map)
            .field("gid_map", &self.gid_map)
            .field("mounts", &self.mounts)
            .field("devices", &self.devices)
            .field("cpu", &self.cpu)
            .field("hooks", &self.hooks)
            .finish()
    }
}

impl ContainerConfig {
    pub fn new() -> Self {
        ContainerConfig {
            config_root: None,
            rootfs: PathBuf::new(),
            rootfs_mount_flags: None,
            premounted_runfs: None,
            pid_file: None,
            program_argv: Vec::new(),
            uid: 0,
            uid_map: String::new(),
            gid: 0,
            gid_map: String::new(),
            alt_syscall_table: None,
            mounts: Vec::new(),
            devices: Vec::new(),
            cgroup_devices: Vec::new(),
            run_setfiles: None,
            cpu: CpuParams::default(),
            cgroup_parent: None,
            cgroup_owner: 0,
            cgroup_group: 0,
            share_host_netns: false,
            keep_fds_open: false,
            rlimits: Vec::new(),
            capmask: None,
            securebits_skip_mask: 0,
            run_as_init: false,
            selinux_context: None,
            pre_execve_hook: None,
            hooks: BTreeMap::new(),
            inherited_fds: Vec::new(),
        }
    }

    /// Directory relative loopback sources are resolved against
    pub fn config_root<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.config_root = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn rootfs<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.rootfs = path.as_ref().to_path_buf();
        self
    }

    /// Extra flags for the rootfs bind mount, applied with a remount
    pub fn rootfs_mount_flags(&mut self, flags: MsFlags) -> &mut Self {
        self.rootfs_mount_flags = Some(flags);
        self
    }

    /// Use an already mounted root instead of bind mounting the rootfs into
    /// a fresh run directory
    pub fn premounted_runfs<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.premounted_runfs = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn pid_file<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.pid_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn program_argv<I, S>(&mut self, argv: I) -> Result<&mut Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let argv: Vec<String> = argv.into_iter().map(|s| s.as_ref().to_string()).collect();
        if argv.is_empty() {
            return Err(ConfigError::EmptyArgv);
        }
        self.program_argv = argv;
        Ok(self)
    }

    pub fn uid(&mut self, uid: u32) -> &mut Self {
        self.uid = uid;
        self
    }

    pub fn gid(&mut self, gid: u32) -> &mut Self {
        self.gid = gid;
        self
    }

    pub fn uid_map(&mut self, map: &str) -> Result<&mut Self, ConfigError> {
        crate::idmap::parse(map)?;
        self.uid_map = map.to_string();
        Ok(self)
    }

    pub fn gid_map(&mut self, map: &str) -> Result<&mut Self, ConfigError> {
        crate::idmap::parse(map)?;
        self.gid_map = map.to_string();
        Ok(self)
    }

    pub fn alt_syscall_table(&mut self, table: &str) -> &mut Self {
        self.alt_syscall_table = Some(table.to_string());
        self
    }

    pub fn add_mount(&mut self, mount: MountSpec) -> Result<&mut Self, ConfigError> {
        if mount.loopback && mount.mount_in_ns {
            return Err(ConfigError::LoopbackInNamespace(mount.source));
        }
        self.mounts.push(mount);
        Ok(self)
    }

    /// Add a device node, along with a cgroup rule allowing the requested
    /// access if any was requested
    pub fn add_device(&mut self, device: DeviceSpec, access: DeviceAccess) -> &mut Self {
        if access.any() {
            self.cgroup_devices.push(CgroupDeviceRule {
                allow: true,
                device_type: device.device_type,
                major: Some(device.major),
                minor: match device.minor {
                    DeviceMinor::Fixed(minor) => Some(minor),
                    DeviceMinor::CopyFromHost => None,
                },
                access,
            });
        }
        self.devices.push(device);
        self
    }

    pub fn add_cgroup_device(&mut self, rule: CgroupDeviceRule) -> &mut Self {
        self.cgroup_devices.push(rule);
        self
    }

    /// Relabel writable mounts made outside the namespace with this
    /// `setfiles` binary before the pivot
    pub fn run_setfiles(&mut self, command: &str) -> &mut Self {
        self.run_setfiles = Some(command.to_string());
        self
    }

    pub fn set_cpu_shares(&mut self, shares: i64) -> Result<&mut Self, ConfigError> {
        if shares < 2 {
            return Err(ConfigError::CpuShares(shares));
        }
        self.cpu.shares = Some(shares);
        Ok(self)
    }

    /// A quota of -1 means unlimited
    pub fn set_cpu_cfs_params(&mut self, quota: i64, period: i64) -> Result<&mut Self, ConfigError> {
        if quota == 0 || quota < -1 {
            return Err(ConfigError::CpuQuota(quota));
        }
        if period <= 0 {
            return Err(ConfigError::CpuPeriod(period));
        }
        self.cpu.quota = Some(quota);
        self.cpu.period = Some(period);
        Ok(self)
    }

    pub fn set_cpu_rt_params(&mut self, runtime: i64, period: i64) -> Result<&mut Self, ConfigError> {
        if runtime < 0 || runtime >= period {
            return Err(ConfigError::CpuRealtime { runtime, period });
        }
        self.cpu.rt_runtime = Some(runtime);
        self.cpu.rt_period = Some(period);
        Ok(self)
    }

    pub fn set_cgroup_parent(&mut self, parent: &str, owner: u32, group: u32) -> &mut Self {
        self.cgroup_parent = Some(parent.to_string());
        self.cgroup_owner = owner;
        self.cgroup_group = group;
        self
    }

    pub fn share_host_netns(&mut self) -> &mut Self {
        self.share_host_netns = true;
        self
    }

    /// Leave file descriptors open in the child instead of closing all but
    /// stdio and the inherited ones
    pub fn keep_fds_open(&mut self) -> &mut Self {
        self.keep_fds_open = true;
        self
    }

    pub fn add_rlimit(&mut self, resource: Resource, soft: u64, hard: u64) -> Result<&mut Self, ConfigError> {
        if self.rlimits.len() >= MAX_RLIMITS {
            return Err(ConfigError::TooManyRlimits(MAX_RLIMITS));
        }
        self.rlimits.push(Rlimit {
            resource,
            soft,
            hard,
        });
        Ok(self)
    }

    /// Restrict capabilities to `mask`, optionally raising them as ambient
    pub fn set_capmask(&mut self, mask: u64, ambient: bool) -> &mut Self {
        self.capmask = Some((mask, ambient));
        self
    }

    pub fn set_securebits_skip_mask(&mut self, mask: u64) -> &mut Self {
        self.securebits_skip_mask = mask;
        self
    }

    /// Exec the program as pid 1 of the new pid namespace instead of under a
    /// small reaper init
    pub fn set_run_as_init(&mut self, run_as_init: bool) -> &mut Self {
        self.run_as_init = run_as_init;
        self
    }

    pub fn set_selinux_context(&mut self, context: &str) -> &mut Self {
        self.selinux_context = Some(context.to_string());
        self
    }

    /// Function run inside the child right before `execve`
    pub fn set_pre_execve_hook(&mut self, hook: ChildHook) -> &mut Self {
        self.pre_execve_hook = Some(hook);
        self
    }

    pub fn add_hook(&mut self, event: HookEvent, callback: HookCallback) -> &mut Self {
        self.hooks.entry(event).or_insert_with(Vec::new).push(callback);
        self
    }

    /// Run an executable at `event`, optionally wiring its stdio to pipes
    /// whose other ends are returned
    pub fn add_exec_hook<P: AsRef<Path>>(
        &mut self,
        event: HookEvent,
        path: P,
        args: Vec<String>,
        stdin: bool,
        stdout: bool,
        stderr: bool,
    ) -> Result<HookPipes, nix::Error> {
        let (callback, pipes) = HookCallback::exec(path.as_ref(), args, stdin, stdout, stderr)?;
        self.add_hook(event, callback);
        Ok(pipes)
    }

    /// File descriptors the child keeps open; may only be set once
    pub fn inherit_fds(&mut self, fds: &[RawFd]) -> Result<&mut Self, ConfigError> {
        if !self.inherited_fds.is_empty() {
            return Err(ConfigError::InheritedFdsAlreadySet);
        }
        self.inherited_fds = fds.to_vec();
        Ok(self)
    }

    pub fn get_program_argv(&self) -> &[String] {
        &self.program_argv
    }

    pub fn get_rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn get_mounts(&self) -> &[MountSpec] {
        &self.mounts
    }

    pub fn get_devices(&self) -> &[DeviceSpec] {
        &self.devices
    }

    pub fn get_cgroup_devices(&self) -> &[CgroupDeviceRule] {
        &self.cgroup_devices
    }

    pub fn get_cpu_params(&self) -> &CpuParams {
        &self.cpu
    }

    pub fn get_uid_map(&self) -> &str {
        &self.uid_map
    }

    pub fn get_gid_map(&self) -> &str {
        &self.gid_map
    }

    pub fn get_rlimits(&self) -> &[Rlimit] {
        &self.rlimits
    }

    pub fn get_share_host_netns(&self) -> bool {
        self.share_host_netns
    }

    pub fn get_hooks(&self, event: HookEvent) -> &[HookCallback] {
        self.hooks.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }
}
