//! Running OCI bundles: the `run_oci` launcher
//!
//! A bundle is a directory holding `config.json` and the root filesystem.
//! [Launcher::run()] keeps the container in the foreground. [Launcher::start()]
//! leaves it running with its state under `/run/containers/<id>`, to be
//! signalled with [Launcher::kill()] and released with [Launcher::destroy()].

pub mod config;
pub mod hooks;

pub use config::{parse_mount_options, MountOptions, OciConfig};

use crate::{
    config::{ContainerConfig, MountSpec},
    container::{Container, ExitStatus},
    errors::{ContainerError, OciError},
    hook::{HookEvent, HookState},
    jail::{send_signal, Jail, NamespaceJail},
    kernel::{HostKernel, Kernel},
    oci::hooks::{run_hooks, run_poststop_hooks, ContainerState},
};
use nix::{
    errno::Errno,
    mount::MsFlags,
    sys::signal::Signal,
    unistd::{getuid, Pid},
};
use std::{
    collections::HashMap,
    fs,
    io::{self, Read},
    os::unix::fs as unix_fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::task::spawn_blocking;

pub const CONFIG_JSON: &str = "config.json";
pub const CONTAINER_PID: &str = "container.pid";
/// Empty file tagging a state directory as ours
pub const RUN_OCI_TAG: &str = ".run_oci";
const MAX_PID_FILE_LENGTH: u64 = 16;

lazy_static! {
    static ref SIGNALS: HashMap<&'static str, Signal> = {
        use Signal::*;
        [
            ("HUP", SIGHUP),
            ("INT", SIGINT),
            ("QUIT", SIGQUIT),
            ("ILL", SIGILL),
            ("TRAP", SIGTRAP),
            ("ABRT", SIGABRT),
            ("BUS", SIGBUS),
            ("FPE", SIGFPE),
            ("KILL", SIGKILL),
            ("USR1", SIGUSR1),
            ("SEGV", SIGSEGV),
            ("USR2", SIGUSR2),
            ("PIPE", SIGPIPE),
            ("ALRM", SIGALRM),
            ("TERM", SIGTERM),
            ("CLD", SIGCHLD),
            ("CHLD", SIGCHLD),
            ("CONT", SIGCONT),
            ("STOP", SIGSTOP),
            ("TSTP", SIGTSTP),
            ("TTIN", SIGTTIN),
            ("TTOU", SIGTTOU),
            ("URG", SIGURG),
            ("XCPU", SIGXCPU),
            ("XFSZ", SIGXFSZ),
            ("VTALRM", SIGVTALRM),
            ("PROF", SIGPROF),
            ("WINCH", SIGWINCH),
            ("POLL", SIGIO),
            ("IO", SIGIO),
            ("PWR", SIGPWR),
            ("SYS", SIGSYS),
        ]
        .iter()
        .copied()
        .collect()
    };
}

/// Signal by its name without the `SIG` prefix, like `TERM`
pub fn signal_from_name(name: &str) -> Result<Signal, OciError> {
    SIGNALS
        .get(name)
        .copied()
        .ok_or_else(|| OciError::UnknownSignal(name.to_string()))
}

/// Parse `<outside>:<inside>`
pub fn parse_bind_mount(spec: &str) -> Result<(PathBuf, PathBuf), OciError> {
    let mut parts = spec.split(':');
    match (parts.next(), parts.next()) {
        (Some(outside), Some(inside)) if !outside.is_empty() && !inside.is_empty() => {
            Ok((PathBuf::from(outside), PathBuf::from(inside)))
        }
        _ => Err(OciError::InvalidBindMount(spec.to_string())),
    }
}

/// Parse a hexadecimal securebits mask, with or without `0x`
pub fn parse_securebits_skip_mask(mask: &str) -> Result<u64, OciError> {
    let digits = mask.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|_| OciError::InvalidSecurebitsMask(mask.to_string()))
}

/// Host paths the launcher works with
#[derive(Debug, Clone)]
pub struct LauncherPaths {
    /// Parent of every detached container's state directory
    pub run_containers: PathBuf,
    pub cgroup_root: PathBuf,
    pub proc_mounts: PathBuf,
}

impl Default for LauncherPaths {
    fn default() -> Self {
        LauncherPaths {
            run_containers: PathBuf::from("/run/containers"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            proc_mounts: PathBuf::from("/proc/self/mounts"),
        }
    }
}

/// Command line overrides applied on top of `config.json`
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    pub bind_mounts: Vec<(PathBuf, PathBuf)>,
    pub cgroup_parent: Option<String>,
    pub alt_syscall_table: Option<String>,
    pub securebits_skip_mask: u64,
    /// Map only the invoking user, as root inside
    pub use_current_user: bool,
    pub run_as_init: bool,
    pub extra_program_args: Vec<String>,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        ContainerOptions {
            bind_mounts: Vec::new(),
            cgroup_parent: None,
            alt_syscall_table: None,
            securebits_skip_mask: 0,
            use_current_user: false,
            run_as_init: true,
            extra_program_args: Vec::new(),
        }
    }
}

impl ContainerOptions {
    fn apply(&self, config: &mut ContainerConfig) -> Result<(), OciError> {
        for (outside, inside) in &self.bind_mounts {
            let mut spec = MountSpec::new("mount", outside, inside, "bind");
            spec.flags = MsFlags::MS_BIND;
            spec.mode = 0o750;
            spec.mount_in_ns = true;
            spec.create = true;
            config.add_mount(spec)?;
        }
        if let Some(parent) = &self.cgroup_parent {
            if !parent.is_empty() {
                let (uid, gid) = (config.uid, config.gid);
                config.set_cgroup_parent(parent, uid, gid);
            }
        }
        if self.use_current_user {
            let map = format!("0 {} 1", getuid());
            config.uid_map(&map)?.gid_map(&map)?;
        }
        if let Some(table) = &self.alt_syscall_table {
            config.alt_syscall_table(table);
        }
        if self.securebits_skip_mask != 0 {
            config.set_securebits_skip_mask(self.securebits_skip_mask);
        }
        config.set_run_as_init(self.run_as_init);
        Ok(())
    }
}

/// Mountpoints listed in a `/proc/self/mounts` style file that are `dir`
/// or below it
pub fn mountpoints_under(dir: &Path, proc_mounts: &Path) -> io::Result<Vec<PathBuf>> {
    let mounts = fs::read_to_string(proc_mounts)?;
    Ok(mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
        .filter(|path| path.starts_with(dir))
        .collect())
}

/// Undo the octal escapes the kernel uses for blanks in mount paths
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Everything known about a started container while its OCI hooks run
struct Launch {
    container: Container,
    /// Holds the program before `execve` until the prestart hooks are done
    prestart: Option<HookState>,
    oci: OciConfig,
    bundle: PathBuf,
    container_dir: PathBuf,
    pid: Pid,
}

/// Runs OCI bundles in containers
pub struct Launcher {
    paths: LauncherPaths,
    kernel: Arc<dyn Kernel>,
    jail: Arc<dyn Jail>,
}

impl Launcher {
    pub fn new(paths: LauncherPaths) -> Self {
        Launcher::with_backends(paths, Arc::new(HostKernel::new()), Arc::new(NamespaceJail::new()))
    }

    pub fn with_backends(paths: LauncherPaths, kernel: Arc<dyn Kernel>, jail: Arc<dyn Jail>) -> Self {
        Launcher { paths, kernel, jail }
    }

    pub fn paths(&self) -> &LauncherPaths {
        &self.paths
    }

    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.paths.run_containers.join(id)
    }

    /// Run the bundle in the foreground until its program exits
    pub async fn run(&self, bundle: &Path, id: &str, options: &ContainerOptions) -> Result<ExitStatus, OciError> {
        let launch = self.launch(bundle, bundle, id, options, false).await?;
        let Launch {
            container,
            oci,
            bundle,
            container_dir,
            pid,
            ..
        } = launch;
        let status = spawn_blocking(move || {
            let mut container = container;
            container.wait()
        })
        .await?;
        run_poststop_hooks(&oci.hooks.poststop, pid, &bundle, &container_dir).await;
        Ok(status?)
    }

    /// Start the bundle and leave it running
    ///
    /// With `inplace` the bundle must already be the container's state
    /// directory. Otherwise a state directory is created with `config.json`
    /// linking back to the bundle.
    pub async fn start(
        &self,
        bundle: &Path,
        id: &str,
        options: &ContainerOptions,
        inplace: bool,
    ) -> Result<Pid, OciError> {
        let container_dir = self.container_dir(id);
        if inplace {
            if !same_dir(&container_dir, bundle) {
                return Err(OciError::InplaceMismatch(container_dir));
            }
        } else {
            if container_dir.exists() {
                return Err(OciError::StateExists(container_dir));
            }
            fs::create_dir_all(&container_dir)?;
        }

        let result = self.start_in(bundle, &container_dir, id, options, inplace).await;
        if result.is_err() {
            self.clean_up(&container_dir);
        }
        result
    }

    async fn start_in(
        &self,
        bundle: &Path,
        container_dir: &Path,
        id: &str,
        options: &ContainerOptions,
        inplace: bool,
    ) -> Result<Pid, OciError> {
        if !inplace {
            unix_fs::symlink(bundle.join(CONFIG_JSON), container_dir.join(CONFIG_JSON))?;
        }
        fs::write(container_dir.join(RUN_OCI_TAG), "")?;
        let launch = self.launch(bundle, container_dir, id, options, true).await?;
        log::debug!("container {} started as pid {}", id, launch.pid);
        Ok(launch.container.detach().unwrap_or(launch.pid))
    }

    /// Create the container, then run prestart and poststart hooks
    ///
    /// The root filesystem is `<bundle>/<root.path>`. When `detach` is set
    /// the pid is recorded in `container_dir`. On failure after the program
    /// was launched it is killed and the poststop hooks run.
    async fn launch(
        &self,
        bundle: &Path,
        container_dir: &Path,
        id: &str,
        options: &ContainerOptions,
        detach: bool,
    ) -> Result<Launch, OciError> {
        let oci = OciConfig::from_file(bundle.join(CONFIG_JSON))?;
        let mut config = oci.to_container_config(bundle, &options.extra_program_args)?;
        options.apply(&mut config)?;
        config.keep_fds_open();

        let mut prestart = None;
        if !oci.hooks.prestart.is_empty() {
            let state = HookState::new(HookEvent::PreExecve)?;
            config.inherit_fds(&state.fds())?;
            config.set_pre_execve_hook(state.trampoline());
            prestart = Some(state);
        }

        let name = if oci.hostname.is_empty() {
            id
        } else {
            oci.hostname.as_str()
        };
        let mut container = Container::with_backends(name, "/unused", self.kernel.clone(), self.jail.clone());
        container.cgroup_root(&self.paths.cgroup_root);
        let (container, started) = spawn_blocking(move || {
            let mut container = container;
            let started = container.start(&config);
            (container, started)
        })
        .await?;
        started?;
        let pid = container.pid().ok_or(ContainerError::NotStarted)?;

        let mut launch = Launch {
            container,
            prestart,
            oci,
            bundle: bundle.to_path_buf(),
            container_dir: container_dir.to_path_buf(),
            pid,
        };
        if let Err(e) = self.after_start(&mut launch, detach).await {
            log::error!("killing container {}: {}", id, e);
            let Launch {
                container,
                prestart,
                oci,
                bundle,
                container_dir,
                pid,
            } = launch;
            let killed = spawn_blocking(move || {
                let mut container = container;
                container.kill()
            })
            .await?;
            if let Err(kill_error) = killed {
                log::error!("failed to kill container {}: {}", id, kill_error);
            }
            drop(prestart);
            run_poststop_hooks(&oci.hooks.poststop, pid, &bundle, &container_dir).await;
            return Err(e);
        }
        Ok(launch)
    }

    async fn after_start(&self, launch: &mut Launch, detach: bool) -> Result<(), OciError> {
        if detach {
            fs::write(
                launch.container_dir.join(CONTAINER_PID),
                format!("{}\n", launch.pid),
            )?;
        }

        if let Some(mut barrier) = launch.prestart.take() {
            let (barrier, reached) = spawn_blocking(move || {
                let reached = barrier.wait_reached();
                (barrier, reached)
            })
            .await?;
            // kept until the program is released or killed
            let barrier = launch.prestart.get_or_insert(barrier);
            reached?;
            let state = ContainerState::new(launch.pid, &launch.bundle, &launch.container_dir, "created");
            run_hooks(&launch.oci.hooks.prestart, "prestart", &state).await?;
            barrier.release();
        }

        let state = ContainerState::new(launch.pid, &launch.bundle, &launch.container_dir, "running");
        run_hooks(&launch.oci.hooks.poststart, "poststart", &state).await
    }

    /// Pid of a detached container, from its state directory
    pub fn container_pid(&self, id: &str) -> Result<Pid, OciError> {
        let container_dir = self.container_dir(id);
        let pid_path = container_dir.join(CONTAINER_PID);
        let mut contents = String::new();
        fs::File::open(&pid_path)?
            .take(MAX_PID_FILE_LENGTH)
            .read_to_string(&mut contents)?;
        let pid: i32 = contents
            .trim()
            .parse()
            .map_err(|_| OciError::InvalidPidFile(pid_path.clone()))?;
        if pid <= 0 {
            return Err(OciError::InvalidPidFile(pid_path));
        }
        if !container_dir.join(RUN_OCI_TAG).exists() {
            return Err(OciError::NotManaged(id.to_string()));
        }
        Ok(Pid::from_raw(pid))
    }

    /// Send `signal` to a detached container's program
    pub fn kill(&self, id: &str, signal: Signal) -> Result<(), OciError> {
        let pid = self.container_pid(id)?;
        send_signal(pid, Some(signal))?;
        Ok(())
    }

    /// Run the poststop hooks of a detached container whose program has
    /// exited, then remove its state
    pub async fn destroy(&self, id: &str) -> Result<(), OciError> {
        let container_dir = self.container_dir(id);
        let config_file = container_dir.join(CONFIG_JSON);
        let pid = self.container_pid(id)?;
        let oci = OciConfig::from_file(&config_file)?;

        match send_signal(pid, None) {
            Err(Errno::ESRCH) => (),
            _ => return Err(OciError::StillRunning(id.to_string())),
        }

        run_poststop_hooks(&oci.hooks.poststop, pid, &bundle_path(&config_file), &container_dir).await;
        self.clean_up(&container_dir);
        Ok(())
    }

    /// Detach everything mounted under `container_dir`, deepest first, then
    /// delete the directory
    pub fn clean_up(&self, container_dir: &Path) {
        match mountpoints_under(container_dir, &self.paths.proc_mounts) {
            Ok(mut mountpoints) => {
                mountpoints.sort_by(|a, b| b.cmp(a));
                for mountpoint in mountpoints {
                    if let Err(e) = self.kernel.detach(&mountpoint) {
                        log::error!("failed to unmount {:?}: {}", mountpoint, e);
                    }
                }
            }
            Err(e) => log::error!("failed to read {:?}: {}", self.paths.proc_mounts, e),
        }
        if let Err(e) = fs::remove_dir_all(container_dir) {
            log::error!("failed to clean up the container directory {:?}: {}", container_dir, e);
        }
    }
}

/// The bundle a state directory was started from
///
/// `config.json` links into the bundle, unless the state directory is the
/// bundle itself.
pub fn bundle_path(config_file: &Path) -> PathBuf {
    let parent = || config_file.parent().map(Path::to_path_buf).unwrap_or_default();
    match fs::read_link(config_file) {
        Ok(target) => target.parent().map(Path::to_path_buf).unwrap_or_else(parent),
        Err(_) => parent(),
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
