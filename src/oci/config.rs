//! The subset of the OCI runtime `config.json` the launcher understands, and
//! its translation into a [ContainerConfig]

use crate::{
    config::{CgroupDeviceRule, ContainerConfig, DeviceAccess, DeviceSpec, DeviceType, MountSpec},
    errors::OciError,
    jail::caps,
};
use nix::{mount::MsFlags, sys::resource::Resource};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Mode of mount destinations created for OCI mounts
const OCI_MOUNT_MODE: u32 = 0o750;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct OciConfig {
    #[serde(default)]
    pub oci_version: String,
    pub root: OciRoot,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub mounts: Vec<OciMount>,
    pub process: OciProcess,
    #[serde(default)]
    pub hooks: OciHooks,
    #[serde(default)]
    pub linux: OciLinux,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct OciRoot {
    pub path: PathBuf,
    /// Accepted and ignored, the root is premounted and its flags are the
    /// caller's business
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct OciMount {
    pub destination: PathBuf,
    #[serde(rename = "type", default)]
    pub fs_type: String,
    #[serde(default)]
    pub source: PathBuf,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct OciProcess {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub user: OciUser,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    /// Capability names per set, `effective` is the one applied
    #[serde(default)]
    pub capabilities: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub rlimits: Vec<OciRlimit>,
    #[serde(default)]
    pub selinux_label: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct OciUser {
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub additional_gids: Vec<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OciRlimit {
    #[serde(rename = "type")]
    pub kind: String,
    pub hard: u64,
    pub soft: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct OciHooks {
    #[serde(default)]
    pub prestart: Vec<OciHook>,
    #[serde(default)]
    pub poststart: Vec<OciHook>,
    #[serde(default)]
    pub poststop: Vec<OciHook>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct OciHook {
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    /// Seconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl OciHook {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct OciLinux {
    #[serde(default)]
    pub uid_mappings: Vec<OciIdMapping>,
    #[serde(default)]
    pub gid_mappings: Vec<OciIdMapping>,
    #[serde(default)]
    pub devices: Vec<OciDevice>,
    #[serde(default)]
    pub resources: OciResources,
    /// When present, a missing `network` entry shares the host's network
    #[serde(default)]
    pub namespaces: Option<Vec<OciNamespace>>,
    /// Ignored, the parent comes from the command line
    #[serde(default)]
    pub cgroups_path: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct OciIdMapping {
    #[serde(rename = "hostID")]
    pub host_id: u32,
    #[serde(rename = "containerID")]
    pub container_id: u32,
    pub size: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OciDevice {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: PathBuf,
    pub major: u32,
    pub minor: i32,
    #[serde(default)]
    pub file_mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct OciResources {
    #[serde(default)]
    pub devices: Vec<OciCgroupDevice>,
    #[serde(default)]
    pub cpu: Option<OciCpu>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OciCgroupDevice {
    pub allow: bool,
    #[serde(rename = "type", default = "all_devices")]
    pub kind: String,
    #[serde(default)]
    pub major: Option<i64>,
    #[serde(default)]
    pub minor: Option<i64>,
    #[serde(default)]
    pub access: String,
}

fn all_devices() -> String {
    "a".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct OciCpu {
    pub shares: Option<i64>,
    pub quota: Option<i64>,
    pub period: Option<i64>,
    pub realtime_runtime: Option<i64>,
    pub realtime_period: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Result of splitting OCI mount options into what `mount(2)` takes
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MountOptions {
    pub flags: MsFlags,
    pub loopback: bool,
    pub verity: Option<String>,
    /// Everything unrecognized, comma separated
    pub data: Option<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            flags: MsFlags::empty(),
            loopback: false,
            verity: None,
            data: None,
        }
    }
}

/// Known options become flags, `loop` and `dm=<table>` configure the
/// backing device, the rest is passed to the filesystem
pub fn parse_mount_options<S: AsRef<str>>(options: &[S]) -> MountOptions {
    let mut parsed = MountOptions::default();
    let mut data: Vec<&str> = Vec::new();
    for option in options {
        let option = option.as_ref();
        match option {
            "nodev" => parsed.flags |= MsFlags::MS_NODEV,
            "noexec" => parsed.flags |= MsFlags::MS_NOEXEC,
            "nosuid" => parsed.flags |= MsFlags::MS_NOSUID,
            "bind" => parsed.flags |= MsFlags::MS_BIND,
            "ro" => parsed.flags |= MsFlags::MS_RDONLY,
            "private" => parsed.flags |= MsFlags::MS_PRIVATE,
            "recursive" => parsed.flags |= MsFlags::MS_REC,
            "slave" => parsed.flags |= MsFlags::MS_SLAVE,
            "remount" => parsed.flags |= MsFlags::MS_REMOUNT,
            "loop" => parsed.loopback = true,
            other => match other.strip_prefix("dm=") {
                Some(table) => parsed.verity = Some(table.to_string()),
                None => data.push(other),
            },
        }
    }
    if !data.is_empty() {
        parsed.data = Some(data.join(","));
    }
    parsed
}

/// proc and sysfs always get `nodev,noexec,nosuid`
pub fn sanitize_flags(fs_type: &str, flags: MsFlags) -> MsFlags {
    if fs_type != "proc" && fs_type != "sysfs" {
        return flags;
    }
    let sanitized = flags | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID;
    if sanitized != flags {
        log::warn!("sanitized mount of type {}", fs_type);
    }
    sanitized
}

/// Kernel map string for a list of OCI id mappings
pub fn id_map_string(mappings: &[OciIdMapping]) -> String {
    mappings
        .iter()
        .map(|m| format!("{} {} {}", m.container_id, m.host_id, m.size))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn rlimit_from_name(name: &str) -> Result<Resource, OciError> {
    Ok(match name {
        "RLIMIT_AS" => Resource::RLIMIT_AS,
        "RLIMIT_CORE" => Resource::RLIMIT_CORE,
        "RLIMIT_CPU" => Resource::RLIMIT_CPU,
        "RLIMIT_DATA" => Resource::RLIMIT_DATA,
        "RLIMIT_FSIZE" => Resource::RLIMIT_FSIZE,
        "RLIMIT_LOCKS" => Resource::RLIMIT_LOCKS,
        "RLIMIT_MEMLOCK" => Resource::RLIMIT_MEMLOCK,
        "RLIMIT_MSGQUEUE" => Resource::RLIMIT_MSGQUEUE,
        "RLIMIT_NICE" => Resource::RLIMIT_NICE,
        "RLIMIT_NOFILE" => Resource::RLIMIT_NOFILE,
        "RLIMIT_NPROC" => Resource::RLIMIT_NPROC,
        "RLIMIT_RSS" => Resource::RLIMIT_RSS,
        "RLIMIT_RTPRIO" => Resource::RLIMIT_RTPRIO,
        "RLIMIT_RTTIME" => Resource::RLIMIT_RTTIME,
        "RLIMIT_SIGPENDING" => Resource::RLIMIT_SIGPENDING,
        "RLIMIT_STACK" => Resource::RLIMIT_STACK,
        other => return Err(OciError::UnknownRlimit(other.to_string())),
    })
}

/// Bit mask of a list of `CAP_*` names
pub fn capability_mask<S: AsRef<str>>(names: &[S]) -> Result<u64, OciError> {
    let mut mask = 0u64;
    for name in names {
        let number = caps::from_name(name.as_ref())
            .ok_or_else(|| OciError::UnknownCapability(name.as_ref().to_string()))?;
        mask |= 1 << number;
    }
    Ok(mask)
}

fn cgroup_number(n: Option<i64>) -> Option<u32> {
    match n {
        Some(n) if n >= 0 => Some(n as u32),
        _ => None,
    }
}

impl OciConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, OciError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|error| OciError::ReadConfig {
            path: path.to_path_buf(),
            error,
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Translate into a [ContainerConfig] whose root is
    /// `<container_root>/<root.path>`, with `extra_args` appended to the
    /// program's arguments
    pub fn to_container_config(
        &self,
        container_root: &Path,
        extra_args: &[String],
    ) -> Result<ContainerConfig, OciError> {
        let mut config = ContainerConfig::new();
        let user = &self.process.user;
        config
            .config_root(container_root)
            .uid(user.uid)
            .gid(user.gid)
            .premounted_runfs(container_root.join(&self.root.path))
            .program_argv(self.process.args.iter().chain(extra_args.iter()))?
            .uid_map(&id_map_string(&self.linux.uid_mappings))?
            .gid_map(&id_map_string(&self.linux.gid_mappings))?;

        for mount in &self.mounts {
            let options = parse_mount_options(&mount.options);
            let source = fs::canonicalize(&mount.source).unwrap_or_else(|_| mount.source.clone());
            let mut spec = MountSpec::new("mount", source, &mount.destination, &mount.fs_type);
            spec.flags = sanitize_flags(&mount.fs_type, options.flags);
            spec.data = options.data;
            spec.verity = options.verity;
            spec.uid = user.uid;
            spec.gid = user.gid;
            spec.mode = OCI_MOUNT_MODE;
            // loop devices can only be set up from outside
            spec.mount_in_ns = !options.loopback;
            spec.create = true;
            spec.loopback = options.loopback;
            config.add_mount(spec)?;
        }

        for device in &self.linux.devices {
            let device_type = device.kind.chars().next().unwrap_or(' ');
            let spec = DeviceSpec::new(
                device_type,
                &device.path,
                device.file_mode,
                device.major,
                device.minor,
                false,
                device.uid,
                device.gid,
            )?;
            // access comes from linux.resources.devices
            config.add_device(spec, DeviceAccess::default());
        }

        for device in &self.linux.resources.devices {
            let device_type = DeviceType::from_char(device.kind.chars().next().unwrap_or('a'))?;
            config.add_cgroup_device(CgroupDeviceRule {
                allow: device.allow,
                device_type,
                major: cgroup_number(device.major),
                minor: cgroup_number(device.minor),
                access: DeviceAccess {
                    read: device.access.contains('r'),
                    write: device.access.contains('w'),
                    modify: device.access.contains('m'),
                },
            });
        }

        if let Some(cpu) = &self.linux.resources.cpu {
            if let Some(shares) = cpu.shares {
                config.set_cpu_shares(shares)?;
            }
            if let (Some(quota), Some(period)) = (cpu.quota, cpu.period) {
                config.set_cpu_cfs_params(quota, period)?;
            }
            if let (Some(runtime), Some(period)) = (cpu.realtime_runtime, cpu.realtime_period) {
                config.set_cpu_rt_params(runtime, period)?;
            }
        }

        for limit in &self.process.rlimits {
            config.add_rlimit(rlimit_from_name(&limit.kind)?, limit.soft, limit.hard)?;
        }

        if let Some(namespaces) = &self.linux.namespaces {
            if !namespaces.iter().any(|ns| ns.kind == "network") {
                config.share_host_netns();
            }
        }

        if !self.process.capabilities.is_empty() {
            let effective = self
                .process
                .capabilities
                .get("effective")
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let ambient = self.process.capabilities.contains_key("ambient");
            config.set_capmask(capability_mask(effective)?, ambient);
        }

        if !self.process.selinux_label.is_empty() {
            config.set_selinux_context(&self.process.selinux_label);
        }

        Ok(config)
    }
}
