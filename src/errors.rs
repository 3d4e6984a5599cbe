//! Error types you might see while configuring or running a container

use crate::hook::HookEvent;
use std::path::PathBuf;
use thiserror::Error;

/// Errors while building a container configuration
///
/// These are always reported synchronously by the setter that received the
/// bad value, so an invalid configuration never reaches
/// [crate::Container::start()].
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// the program argv needs at least one element
    #[error("the program argv needs at least one element")]
    EmptyArgv,

    /// a device copying its minor number from the host must use minor -1
    #[error("a device copying its minor number from the host must use minor -1, found {0}")]
    CopyMinorWithExplicitMinor(i32),

    /// a device with a fixed minor number can't use a negative minor
    #[error("a device with a fixed minor number can't use a negative minor, found {0}")]
    NegativeMinor(i32),

    /// unsupported device node type
    #[error("unsupported device node type {0:?}")]
    InvalidDeviceType(char),

    /// loopback mounts must be performed outside the mount namespace
    #[error("loopback mount of {0:?} must be performed outside the mount namespace")]
    LoopbackInNamespace(PathBuf),

    /// cpu shares must be 2 or higher
    #[error("cpu shares must be 2 or higher, found {0}")]
    CpuShares(i64),

    /// cpu quota must be positive or -1
    #[error("cpu quota must be positive or -1, found {0}")]
    CpuQuota(i64),

    /// cpu period must be positive
    #[error("cpu period must be positive, found {0}")]
    CpuPeriod(i64),

    /// realtime runtime must be in the range [0, period)
    #[error("realtime runtime {runtime} must be in the range [0, {period})")]
    CpuRealtime { runtime: i64, period: i64 },

    /// malformed uid or gid map
    #[error("malformed id map {0:?}")]
    InvalidIdMap(String),

    /// too many resource limits
    #[error("too many resource limits, at most {0} are supported")]
    TooManyRlimits(usize),

    /// inherited file descriptors can only be set once
    #[error("inherited file descriptors can only be set once")]
    InheritedFdsAlreadySet,
}

/// Errors while starting, supervising or tearing down a container
#[derive(Error, Debug)]
pub enum ContainerError {
    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    /// system call error
    #[error("system call error: {0}")]
    Sys(#[from] nix::Error),

    /// invalid configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// argument string contained internal nul byte
    #[error("argument string contained internal nul byte")]
    NulStringError(#[from] std::ffi::NulError),

    /// container was already started
    #[error("container was already started")]
    AlreadyStarted,

    /// container has not been started
    #[error("container has not been started")]
    NotStarted,

    /// id is not covered by the user namespace map
    #[error("id {id} is not covered by the map {map:?}")]
    UnmappedId { id: u32, map: String },

    /// mount failed
    #[error("failed to mount {from:?} on {destination:?}: {errno}")]
    Mount {
        from: PathBuf,
        destination: PathBuf,
        errno: nix::Error,
    },

    /// could not create a mount destination
    #[error("failed to create mount destination {path:?}: {reason}")]
    MountDestination { path: PathBuf, reason: String },

    /// device node creation failed
    #[error("failed to create device node {path:?}: {errno}")]
    DeviceNode { path: PathBuf, errno: nix::Error },

    /// cgroup controller is not available
    #[error("cgroup controller {0} is not available")]
    CgroupUnavailable(&'static str),

    /// cgroup file write failed
    #[error("failed to write {value:?} to {path:?}: {error}")]
    CgroupWrite {
        path: PathBuf,
        value: String,
        error: std::io::Error,
    },

    /// loop device setup failed
    #[error("loop device error for {path:?}: {reason}")]
    LoopDevice { path: PathBuf, reason: String },

    /// device-mapper setup failed
    #[error("device-mapper error for {name:?}: {reason}")]
    DeviceMapper { name: String, reason: String },

    /// sandbox could not be launched
    #[error("failed to launch sandbox: {0}")]
    Spawn(String),

    /// an exec hook exited unsuccessfully
    #[error("exec hook {path:?} exited with {status}")]
    ExecHook {
        path: PathBuf,
        status: std::process::ExitStatus,
    },

    /// a lifecycle hook failed
    #[error("{event:?} hook failed: {reason}")]
    Hook { event: HookEvent, reason: String },

    /// helper process running inside the container namespaces failed
    #[error("namespace helper process failed with {0:?}")]
    NamespaceHelper(nix::sys::wait::WaitStatus),
}

/// Errors from the OCI bundle launcher
#[derive(Error, Debug)]
pub enum OciError {
    /// io error
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    /// system call error
    #[error("system call error: {0}")]
    Sys(#[from] nix::Error),

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),

    /// invalid container configuration
    #[error("invalid container configuration: {0}")]
    Config(#[from] ConfigError),

    /// container error
    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    /// asynchronous task failed
    #[error("asynchronous task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// failed to read the bundle configuration
    #[error("failed to read {path:?}: {error}")]
    ReadConfig {
        path: PathBuf,
        error: std::io::Error,
    },

    /// hook exceeded its timeout
    #[error("timeout exceeded running {stage} hook {hook}")]
    HookTimeout { stage: String, hook: String },

    /// hook exited unsuccessfully
    #[error("{stage} hook {hook} exited with {status}")]
    HookFailed {
        stage: String,
        hook: String,
        status: std::process::ExitStatus,
    },

    /// one or more hooks in a stage failed
    #[error("failed to run all {0} hooks")]
    HooksFailed(String),

    /// unknown signal name
    #[error("invalid signal name {0:?}")]
    UnknownSignal(String),

    /// unknown capability name
    #[error("invalid capability name {0:?}")]
    UnknownCapability(String),

    /// unknown resource limit name
    #[error("invalid resource limit name {0:?}")]
    UnknownRlimit(String),

    /// invalid bind mount specification
    #[error("invalid bind mount {0:?}, expected <outside>:<inside>")]
    InvalidBindMount(String),

    /// securebits skip mask is not a hex number
    #[error("invalid securebits skip mask {0:?}")]
    InvalidSecurebitsMask(String),

    /// container is still running
    #[error("container {0} is still running")]
    StillRunning(String),

    /// container directory is not managed by run_oci
    #[error("container {0} is not run_oci-managed")]
    NotManaged(String),

    /// pid file contents are not valid
    #[error("invalid pid file {0:?}")]
    InvalidPidFile(PathBuf),

    /// container state directory already exists
    #[error("container state directory {0:?} already exists")]
    StateExists(PathBuf),

    /// with --inplace the bundle must live in the state directory
    #[error("with --inplace, the directory where config.json is located must be {0:?}")]
    InplaceMismatch(PathBuf),
}
