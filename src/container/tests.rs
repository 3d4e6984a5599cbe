use super::*;
use crate::{
    config::{DeviceSpec, MountSpec},
    errors::ContainerError,
    testing::{Call, FakeJail, FakeKernel},
};
use std::sync::Mutex;
use tempfile::TempDir;

struct Fixture {
    rundir: TempDir,
    cgroups: TempDir,
    kernel: Arc<FakeKernel>,
    jail: Arc<FakeJail>,
}

impl Fixture {
    fn new(controllers: &[&str]) -> Self {
        Fixture::with(FakeKernel::new(), FakeJail::new(), controllers)
    }

    fn with(kernel: FakeKernel, jail: FakeJail, controllers: &[&str]) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let cgroups = tempfile::tempdir().unwrap();
        for controller in controllers {
            fs::create_dir(cgroups.path().join(controller)).unwrap();
        }
        Fixture {
            rundir: tempfile::tempdir().unwrap(),
            cgroups,
            kernel: Arc::new(kernel),
            jail: Arc::new(jail),
        }
    }

    fn container(&self, name: &str) -> Container {
        let mut container =
            Container::with_backends(name, self.rundir.path(), self.kernel.clone(), self.jail.clone());
        container.cgroup_root(self.cgroups.path());
        container
    }

    fn rundir_is_empty(&self) -> bool {
        fs::read_dir(self.rundir.path()).unwrap().next().is_none()
    }
}

fn shell(script: &str) -> ContainerConfig {
    let mut config = ContainerConfig::new();
    config
        .rootfs("/srv/rootfs")
        .program_argv(&["/bin/sh", "-c", script])
        .unwrap();
    config
}

#[test]
fn start_and_wait() {
    let fixture = Fixture::new(&["cpu", "freezer"]);
    let output = fixture.rundir.path().join("output");
    let mut config = shell(&format!("echo hello > {:?}; exit 3", output));
    config.set_cpu_shares(512).unwrap();
    let mut container = fixture.container("box");
    container.start(&config).unwrap();

    assert!(container.pid().is_some());
    let runfs = container.root().unwrap().to_path_buf();
    let runfsroot = container.runfsroot().unwrap().to_path_buf();
    assert_eq!(runfsroot, runfs.join("root"));
    assert!(runfs
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("box_"));
    assert_eq!(container.pid_file(), Some(runfs.join("container.pid").as_path()));
    assert_eq!(
        fs::read_to_string(fixture.cgroups.path().join("cpu/box/cpu.shares")).unwrap(),
        "512"
    );
    assert_eq!(fixture.kernel.mounted(), vec![runfsroot.clone()]);
    assert!(fixture.kernel.calls().contains(&Call::Mount {
        source: Some(PathBuf::from("/srv/rootfs")),
        target: runfsroot.clone(),
        fs_type: None,
        flags: MsFlags::MS_BIND,
        data: None,
    }));

    let status = container.wait().unwrap();
    assert!(!status.success());
    assert_eq!(status.code(), Some(3));
    assert_eq!(fs::read_to_string(&output).unwrap(), "hello\n");
    fs::remove_file(&output).unwrap();

    assert_eq!(container.pid(), None);
    assert_eq!(container.root(), None);
    assert!(fixture.kernel.mounted().is_empty());
    assert!(fixture.rundir_is_empty());
    // cpu.shares keeps the cpu directory around, freezer is empty
    assert!(!fixture.cgroups.path().join("freezer/box").exists());

    let policy = fixture.jail.last_policy().unwrap();
    assert_eq!(policy.pivot_root, Some(runfsroot));
    assert_eq!(policy.pid_file, Some(runfs.join("container.pid")));
    assert_eq!(
        policy.cgroup_tasks,
        vec![
            fixture.cgroups.path().join("cpu/box/tasks"),
            fixture.cgroups.path().join("freezer/box/tasks"),
        ]
    );
    assert!(policy.namespaces.contains(
        CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWCGROUP
            | CloneFlags::CLONE_NEWNET
    ));
    assert!(!policy.namespaces.contains(CloneFlags::CLONE_NEWUSER));
    assert!(policy.close_open_fds);
}

#[test]
fn external_bind_mount_is_gone_after_wait() {
    let fixture = Fixture::new(&[]);
    let mut config = ContainerConfig::new();
    config.rootfs("/srv/rootfs").program_argv(&["/bin/true"]).unwrap();
    let mut bind = MountSpec::new("bind", "/a", "/b", "none");
    bind.flags = MsFlags::MS_BIND;
    config.add_mount(bind).unwrap();

    let mut container = fixture.container("bound");
    container.start(&config).unwrap();
    let runfsroot = container.runfsroot().unwrap().to_path_buf();
    assert_eq!(
        fixture.kernel.mounted(),
        vec![runfsroot.clone(), runfsroot.join("b")]
    );
    assert!(container.wait().unwrap().success());
    assert!(fixture.kernel.mounted().is_empty());
    let calls = fixture.kernel.calls();
    let unmount = calls
        .iter()
        .position(|call| *call == Call::Unmount(runfsroot.join("b")))
        .unwrap();
    let detach = calls
        .iter()
        .position(|call| *call == Call::Detach(runfsroot.clone()))
        .unwrap();
    assert!(unmount < detach);
}

#[test]
fn detached_container_keeps_running() {
    let fixture = Fixture::new(&["freezer"]);
    let mut container = fixture.container("detached");
    container.start(&shell("sleep 30")).unwrap();
    let pid = container.detach().unwrap();
    assert!(fixture.cgroups.path().join("freezer/detached").is_dir());
    kill(pid, Signal::SIGKILL).unwrap();
    assert_eq!(
        exit_code(wait_for_child(pid).unwrap()),
        128 + Signal::SIGKILL as i32
    );
}

#[test]
fn hooks_run_in_event_order() {
    let fixture = Fixture::new(&[]);
    let order = Arc::new(Mutex::new(Vec::new()));
    let record = |label: &'static str| {
        let order = order.clone();
        HookCallback::callback(move |_| {
            order.lock().unwrap().push(label);
            Ok(())
        })
    };
    let mut config = shell("exit 0");
    config
        .add_hook(HookEvent::PreExecve, record("pre-execve"))
        .add_hook(HookEvent::PreChroot, record("pre-chroot"))
        .add_hook(HookEvent::PreDropCaps, record("pre-dropcaps"))
        .add_hook(HookEvent::PreChroot, record("pre-chroot again"));

    let mut container = fixture.container("ordered");
    container.start(&config).unwrap();
    assert_eq!(
        *order.lock().unwrap(),
        vec!["pre-chroot", "pre-chroot again", "pre-dropcaps", "pre-execve"]
    );
    assert!(container.wait().unwrap().success());
}

#[test]
fn failing_hook_stops_the_program() {
    let fixture = Fixture::new(&[]);
    let marker = fixture.rundir.path().join("marker");
    let mut config = shell(&format!("touch {:?}", marker));
    config.add_hook(
        HookEvent::PreExecve,
        HookCallback::callback(|_| Err(ContainerError::Spawn("refused".to_string()))),
    );
    let mut container = fixture.container("refused");
    let err = container.start(&config).unwrap_err();
    assert!(matches!(
        err,
        ContainerError::Hook {
            event: HookEvent::PreExecve,
            ..
        }
    ));
    assert!(!marker.exists());
    assert_eq!(container.pid(), None);
    assert!(fixture.kernel.mounted().is_empty());
    assert!(fixture.rundir_is_empty());
    assert!(matches!(container.wait(), Err(ContainerError::NotStarted)));
}

#[test]
fn exec_hook_failure_is_fatal() {
    let fixture = Fixture::new(&["freezer"]);
    let marker = fixture.rundir.path().join("marker");
    let mut config = shell(&format!("touch {:?}", marker));
    config
        .add_exec_hook(
            HookEvent::PreChroot,
            "/bin/false",
            vec!["false".to_string()],
            false,
            false,
            false,
        )
        .unwrap();
    let mut container = fixture.container("falsehook");
    let err = container.start(&config).unwrap_err();
    assert!(matches!(
        err,
        ContainerError::Hook {
            event: HookEvent::PreChroot,
            ..
        }
    ));
    assert!(!marker.exists());
    assert_eq!(container.pid(), None);
    assert_eq!(container.pid_file(), None);
    assert!(fixture.kernel.mounted().is_empty());
    assert!(fixture.rundir_is_empty());
    assert!(!fixture.cgroups.path().join("freezer/falsehook").exists());
}

#[test]
fn start_only_once() {
    let fixture = Fixture::new(&[]);
    let mut container = fixture.container("once");
    container.start(&shell("exit 0")).unwrap();
    assert!(matches!(
        container.start(&shell("exit 0")),
        Err(ContainerError::AlreadyStarted)
    ));
    assert!(container.wait().unwrap().success());
}

#[test]
fn spawn_failure_releases_everything() {
    let fixture = Fixture::with(FakeKernel::new(), FakeJail::failing(), &["freezer"]);
    let mut config = shell("exit 0");
    let mut tmpfs = MountSpec::new("tmp", "tmpfs", "/tmp", "tmpfs");
    tmpfs.flags = MsFlags::MS_NOSUID;
    config.add_mount(tmpfs).unwrap();

    let mut container = fixture.container("broken");
    assert!(matches!(
        container.start(&config),
        Err(ContainerError::Spawn(_))
    ));
    assert!(fixture.kernel.mounted().is_empty());
    assert!(fixture.rundir_is_empty());
    assert!(!fixture.cgroups.path().join("freezer/broken").exists());
}

#[test]
fn kill_running_program() {
    let fixture = Fixture::new(&[]);
    let mut container = fixture.container("sleeper");
    container.start(&shell("sleep 30")).unwrap();
    let status = container.kill().unwrap();
    assert_eq!(status.code(), Some(128 + Signal::SIGKILL as i32));
    assert!(fixture.rundir_is_empty());
}

#[test]
fn rootfs_flags_need_a_remount() {
    let fixture = Fixture::new(&[]);
    let mut config = shell("exit 0");
    config.rootfs_mount_flags(MsFlags::MS_REC | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID);
    let mut container = fixture.container("readonly");
    container.start(&config).unwrap();
    let runfsroot = container.runfsroot().unwrap().to_path_buf();
    assert!(container.wait().unwrap().success());

    let flags: Vec<MsFlags> = fixture
        .kernel
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Mount { target, flags, .. } if target == runfsroot => Some(flags),
            _ => None,
        })
        .collect();
    assert_eq!(
        flags,
        vec![
            MsFlags::MS_BIND | MsFlags::MS_REC,
            MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID,
        ]
    );
}

#[test]
fn user_namespace_and_host_network() {
    let fixture = Fixture::new(&[]);
    let mut config = shell("exit 0");
    config
        .uid_map("0 1000 1")
        .unwrap()
        .gid_map("0 1000 1")
        .unwrap()
        .share_host_netns()
        .keep_fds_open();
    config.set_capmask(0, false).set_run_as_init(true);
    let mut container = fixture.container("userns");
    container.start(&config).unwrap();
    assert!(container.wait().unwrap().success());

    let policy = fixture.jail.last_policy().unwrap();
    assert!(policy.namespaces.contains(CloneFlags::CLONE_NEWUSER));
    assert!(!policy.namespaces.contains(CloneFlags::CLONE_NEWNET));
    assert_eq!(policy.uid_map.as_deref(), Some("0 1000 1"));
    assert_eq!(policy.gid_map.as_deref(), Some("0 1000 1"));
    assert_eq!(policy.capmask, Some((0, false)));
    assert!(policy.run_as_init);
    assert!(!policy.close_open_fds);
    // uid 0 inside maps to 1000 outside
    let runfs_chowns = fixture
        .kernel
        .calls()
        .into_iter()
        .filter(|call| matches!(call, Call::Chown { uid: 1000, gid: 1000, .. }))
        .count();
    assert_eq!(runfs_chowns, 2);
}

#[test]
fn devices_and_device_cgroup_when_privileged() {
    let kernel = FakeKernel::new()
        .privileged()
        .host_device("/dev/loop0", 7, 0);
    let fixture = Fixture::with(kernel, FakeJail::new(), &["devices"]);
    let mut config = shell("exit 0");
    config.add_device(
        DeviceSpec::new('c', "/dev/null", 0o666, 1, 3, false, 0, 0).unwrap(),
        DeviceAccess {
            read: true,
            write: true,
            modify: false,
        },
    );
    let mut image = MountSpec::new("image", "/images/vendor.img", "/vendor", "ext4");
    image.loopback = true;
    image.flags = MsFlags::MS_RDONLY;
    config.add_mount(image).unwrap();

    let mut container = fixture.container("devices");
    container.start(&config).unwrap();
    let pid = container.pid().unwrap();
    let runfsroot = container.runfsroot().unwrap().to_path_buf();
    let devices = fixture.cgroups.path().join("devices/devices");
    assert_eq!(fs::read_to_string(devices.join("devices.deny")).unwrap(), "a");
    // the loop device backing the image is allowed last, read-only
    assert_eq!(
        fs::read_to_string(devices.join("devices.allow")).unwrap(),
        "b 7:0 r"
    );
    assert!(container.wait().unwrap().success());

    let calls = fixture.kernel.calls();
    assert!(calls.contains(&Call::RunInNamespaces {
        pid,
        namespaces: CloneFlags::CLONE_NEWNS,
    }));
    assert!(calls.contains(&Call::Mknod {
        path: runfsroot.join("dev/null"),
        kind: nix::sys::stat::SFlag::S_IFCHR,
        perm: Mode::from_bits_truncate(0o666),
        major: 1,
        minor: 3,
    }));
    assert!(calls.contains(&Call::DetachLoop(PathBuf::from("/dev/loop0"))));
    assert!(fixture.kernel.mounted().is_empty());
}

#[test]
fn unprivileged_skips_devices() {
    let fixture = Fixture::new(&["devices"]);
    let mut config = shell("exit 0");
    config.add_device(
        DeviceSpec::new('c', "/dev/null", 0o666, 1, 3, false, 0, 0).unwrap(),
        DeviceAccess {
            read: true,
            ..Default::default()
        },
    );
    let mut container = fixture.container("plain");
    container.start(&config).unwrap();
    assert!(container.wait().unwrap().success());
    assert!(!fixture
        .kernel
        .calls()
        .iter()
        .any(|call| matches!(call, Call::Mknod { .. } | Call::RunInNamespaces { .. })));
}

#[test]
fn premounted_root_is_left_alone() {
    let fixture = Fixture::new(&[]);
    let premounted = tempfile::tempdir().unwrap();
    let pid_file = premounted.path().join("pid");
    let mut config = shell("exit 0");
    config.premounted_runfs(premounted.path()).pid_file(&pid_file);
    let mut container = fixture.container("premounted");
    container.start(&config).unwrap();
    assert_eq!(container.root(), None);
    assert_eq!(container.runfsroot(), Some(premounted.path()));
    assert!(container.wait().unwrap().success());

    assert!(premounted.path().is_dir());
    assert!(!pid_file.exists());
    assert!(!fixture
        .kernel
        .calls()
        .iter()
        .any(|call| matches!(call, Call::Mount { .. } | Call::Detach(_))));
}

#[test]
fn setfiles_covers_writable_external_mounts() {
    let fixture = Fixture::new(&[]);
    let mut config = shell("exit 0");
    let mut data = MountSpec::new("data", "/host/data", "/data", "none");
    data.flags = MsFlags::MS_BIND;
    let mut readonly = MountSpec::new("ro", "/host/ro", "/ro", "none");
    readonly.flags = MsFlags::MS_BIND | MsFlags::MS_RDONLY;
    let mut inside = MountSpec::new("proc", "proc", "/proc", "proc");
    inside.mount_in_ns = true;
    config
        .add_mount(data)
        .unwrap()
        .add_mount(readonly)
        .unwrap()
        .add_mount(inside)
        .unwrap();
    config.run_setfiles("/bin/true");

    let mut container = fixture.container("labels");
    container.start(&config).unwrap();
    assert!(container.wait().unwrap().success());
    // /data is skipped, /ro is read-only and /proc is mounted by the child
    assert!(!fixture
        .kernel
        .calls()
        .iter()
        .any(|call| matches!(call, Call::RunInNamespaces { .. })));

    let mut config = shell("exit 0");
    let mut cache = MountSpec::new("opt", "/host/opt", "/opt", "none");
    cache.flags = MsFlags::MS_BIND;
    config.add_mount(cache).unwrap().run_setfiles("/bin/true");
    let mut container = fixture.container("labels2");
    container.start(&config).unwrap();
    let pid = container.pid().unwrap();
    assert!(container.wait().unwrap().success());
    assert!(fixture.kernel.calls().contains(&Call::RunInNamespaces {
        pid,
        namespaces: CloneFlags::CLONE_NEWNS,
    }));
}

#[test]
#[ignore = "needs root"]
fn host_namespaces() {
    let rundir = tempfile::tempdir().unwrap();
    let mut config = ContainerConfig::new();
    config.rootfs("/").program_argv(&["/bin/true"]).unwrap();
    let mut container = Container::new("nsbox-test", rundir.path());
    container.start(&config).unwrap();
    assert!(container.wait().unwrap().success());
}
