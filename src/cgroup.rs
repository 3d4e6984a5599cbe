//! Per-container cgroup (v1) directories and the settings written into them

use crate::{config::CgroupDeviceRule, errors::ContainerError, kernel::Kernel};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// The controllers a container may be placed in
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CgroupType {
    Cpu,
    Cpuacct,
    Cpuset,
    Devices,
    Freezer,
    Schedtune,
}

impl CgroupType {
    pub const ALL: [CgroupType; 6] = [
        CgroupType::Cpu,
        CgroupType::Cpuacct,
        CgroupType::Cpuset,
        CgroupType::Devices,
        CgroupType::Freezer,
        CgroupType::Schedtune,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CgroupType::Cpu => "cpu",
            CgroupType::Cpuacct => "cpuacct",
            CgroupType::Cpuset => "cpuset",
            CgroupType::Devices => "devices",
            CgroupType::Freezer => "freezer",
            CgroupType::Schedtune => "schedtune",
        }
    }
}

/// Handle on the directories created for one container
///
/// Dropping it removes the directories again, as far as the kernel allows.
#[derive(Debug)]
pub struct Cgroup {
    #[allow(dead_code)]
    name: String,
    paths: Vec<(CgroupType, PathBuf)>,
}

fn write_value(path: &Path, value: &str) -> Result<(), ContainerError> {
    fs::write(path, value).map_err(|error| ContainerError::CgroupWrite {
        path: path.to_path_buf(),
        value: value.to_string(),
        error,
    })
}

/// Copy a cpuset setting from the parent, since a new cpuset starts empty
fn inherit_cpuset(parent: &Path, child: &Path, setting: &str) -> Result<(), ContainerError> {
    for file in &[setting.to_string(), format!("cpuset.{}", setting)] {
        let source = parent.join(file);
        if source.exists() {
            let value = fs::read_to_string(&source)?;
            return write_value(&child.join(file), value.trim_end());
        }
    }
    Ok(())
}

impl Cgroup {
    /// Create `<root>/<controller>/[parent/]name` for every controller
    /// mounted under `root`, owned by `owner`:`group`
    pub fn create(
        kernel: &dyn Kernel,
        name: &str,
        root: &Path,
        parent: Option<&str>,
        owner: u32,
        group: u32,
    ) -> Result<Self, ContainerError> {
        let mut cgroup = Cgroup {
            name: name.to_string(),
            paths: Vec::new(),
        };
        for cgroup_type in CgroupType::ALL.iter() {
            let base = root.join(cgroup_type.name());
            if !base.is_dir() {
                log::debug!("{:?} not available, skipping", base);
                continue;
            }
            let base = match parent {
                Some(parent) if !parent.is_empty() => base.join(parent.trim_start_matches('/')),
                _ => base,
            };
            let path = base.join(name);
            fs::create_dir_all(&path)?;
            cgroup.paths.push((*cgroup_type, path.clone()));

            if *cgroup_type == CgroupType::Cpuset {
                inherit_cpuset(&base, &path, "cpus")?;
                inherit_cpuset(&base, &path, "mems")?;
            }
            kernel.chown(&path, owner, group)?;
            let tasks = path.join("tasks");
            if tasks.exists() {
                kernel.chown(&tasks, owner, group)?;
            }
        }
        log::debug!("cgroup {} created in {:?}", name, cgroup.types());
        Ok(cgroup)
    }

    #[allow(dead_code)]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn types(&self) -> Vec<CgroupType> {
        self.paths.iter().map(|(cgroup_type, _)| *cgroup_type).collect()
    }

    pub fn path(&self, cgroup_type: CgroupType) -> Option<&Path> {
        self.paths
            .iter()
            .find(|(t, _)| *t == cgroup_type)
            .map(|(_, path)| path.as_path())
    }

    /// The `tasks` file of each controller, for adding a process
    pub fn tasks_paths(&self) -> Vec<PathBuf> {
        self.paths.iter().map(|(_, path)| path.join("tasks")).collect()
    }

    /// Forget the directories instead of removing them on drop, for a
    /// container that outlives this process
    pub fn release(mut self) {
        self.paths.clear();
    }

    fn controller_file(&self, cgroup_type: CgroupType, file: &str) -> Result<PathBuf, ContainerError> {
        self.path(cgroup_type)
            .map(|path| path.join(file))
            .ok_or_else(|| ContainerError::CgroupUnavailable(cgroup_type.name()))
    }

    pub fn deny_all_devices(&self) -> Result<(), ContainerError> {
        write_value(&self.controller_file(CgroupType::Devices, "devices.deny")?, "a")
    }

    pub fn add_device(&self, rule: &CgroupDeviceRule) -> Result<(), ContainerError> {
        let file = if rule.allow {
            "devices.allow"
        } else {
            "devices.deny"
        };
        write_value(&self.controller_file(CgroupType::Devices, file)?, &rule.to_string())
    }

    fn set_cpu(&self, file: &str, value: i64) -> Result<(), ContainerError> {
        write_value(&self.controller_file(CgroupType::Cpu, file)?, &value.to_string())
    }

    pub fn set_cpu_shares(&self, shares: i64) -> Result<(), ContainerError> {
        self.set_cpu("cpu.shares", shares)
    }

    pub fn set_cpu_quota(&self, quota: i64) -> Result<(), ContainerError> {
        self.set_cpu("cpu.cfs_quota_us", quota)
    }

    pub fn set_cpu_period(&self, period: i64) -> Result<(), ContainerError> {
        self.set_cpu("cpu.cfs_period_us", period)
    }

    pub fn set_cpu_rt_runtime(&self, runtime: i64) -> Result<(), ContainerError> {
        self.set_cpu("cpu.rt_runtime_us", runtime)
    }

    pub fn set_cpu_rt_period(&self, period: i64) -> Result<(), ContainerError> {
        self.set_cpu("cpu.rt_period_us", period)
    }
}

impl Drop for Cgroup {
    fn drop(&mut self) {
        for (_, path) in self.paths.iter().rev() {
            if let Err(e) = fs::remove_dir(path) {
                log::debug!("could not remove cgroup {:?}: {}", path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DeviceAccess, DeviceType},
        testing::{Call, FakeKernel},
    };

    fn cgroup_root(controllers: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for controller in controllers {
            fs::create_dir(dir.path().join(controller)).unwrap();
        }
        dir
    }

    #[test]
    fn only_mounted_controllers() {
        let root = cgroup_root(&["cpu", "devices"]);
        let kernel = FakeKernel::new();
        let cgroup = Cgroup::create(&kernel, "box", root.path(), Some("chrome"), 1000, 1001).unwrap();
        assert_eq!(cgroup.types(), vec![CgroupType::Cpu, CgroupType::Devices]);
        assert_eq!(
            cgroup.tasks_paths(),
            vec![
                root.path().join("cpu/chrome/box/tasks"),
                root.path().join("devices/chrome/box/tasks"),
            ]
        );
        assert_eq!(
            kernel.calls(),
            vec![
                Call::Chown {
                    path: root.path().join("cpu/chrome/box"),
                    uid: 1000,
                    gid: 1001
                },
                Call::Chown {
                    path: root.path().join("devices/chrome/box"),
                    uid: 1000,
                    gid: 1001
                },
            ]
        );
        assert!(matches!(
            cgroup.path(CgroupType::Freezer),
            None
        ));
    }

    #[test]
    fn directories_removed_on_drop() {
        let root = cgroup_root(&["freezer"]);
        let kernel = FakeKernel::new();
        let path = {
            let cgroup = Cgroup::create(&kernel, "box", root.path(), None, 0, 0).unwrap();
            cgroup.path(CgroupType::Freezer).unwrap().to_path_buf()
        };
        assert!(!path.exists());
        assert!(root.path().join("freezer").is_dir());
    }

    #[test]
    fn released_directories_stay() {
        let root = cgroup_root(&["freezer"]);
        let kernel = FakeKernel::new();
        let cgroup = Cgroup::create(&kernel, "box", root.path(), None, 0, 0).unwrap();
        let path = cgroup.path(CgroupType::Freezer).unwrap().to_path_buf();
        cgroup.release();
        assert!(path.is_dir());
    }

    #[test]
    fn cpuset_inherits_parent() {
        let root = cgroup_root(&["cpuset"]);
        fs::write(root.path().join("cpuset/cpus"), "0-3\n").unwrap();
        fs::write(root.path().join("cpuset/mems"), "0\n").unwrap();
        let kernel = FakeKernel::new();
        let cgroup = Cgroup::create(&kernel, "box", root.path(), None, 0, 0).unwrap();
        let path = cgroup.path(CgroupType::Cpuset).unwrap();
        assert_eq!(fs::read_to_string(path.join("cpus")).unwrap(), "0-3");
        assert_eq!(fs::read_to_string(path.join("mems")).unwrap(), "0");
        // Regular files block rmdir in a tempdir, clean them so drop succeeds
        fs::remove_file(path.join("cpus")).unwrap();
        fs::remove_file(path.join("mems")).unwrap();
    }

    #[test]
    fn settings_files() {
        let root = cgroup_root(&["cpu", "devices"]);
        let kernel = FakeKernel::new();
        let cgroup = Cgroup::create(&kernel, "box", root.path(), None, 0, 0).unwrap();
        cgroup.deny_all_devices().unwrap();
        let cpu = cgroup.path(CgroupType::Cpu).unwrap().to_path_buf();
        let devices = cgroup.path(CgroupType::Devices).unwrap().to_path_buf();
        assert_eq!(fs::read_to_string(devices.join("devices.deny")).unwrap(), "a");

        cgroup
            .add_device(&CgroupDeviceRule {
                allow: true,
                device_type: DeviceType::Char,
                major: Some(1),
                minor: None,
                access: DeviceAccess {
                    read: true,
                    write: true,
                    modify: true,
                },
            })
            .unwrap();
        assert_eq!(
            fs::read_to_string(devices.join("devices.allow")).unwrap(),
            "c 1:* rwm"
        );

        cgroup.set_cpu_shares(512).unwrap();
        cgroup.set_cpu_quota(-1).unwrap();
        cgroup.set_cpu_period(100_000).unwrap();
        cgroup.set_cpu_rt_runtime(950).unwrap();
        cgroup.set_cpu_rt_period(1000).unwrap();
        let read = |file: &str| fs::read_to_string(cpu.join(file)).unwrap();
        assert_eq!(read("cpu.shares"), "512");
        assert_eq!(read("cpu.cfs_quota_us"), "-1");
        assert_eq!(read("cpu.cfs_period_us"), "100000");
        assert_eq!(read("cpu.rt_runtime_us"), "950");
        assert_eq!(read("cpu.rt_period_us"), "1000");
    }

    #[test]
    fn missing_controller() {
        let root = cgroup_root(&[]);
        let kernel = FakeKernel::new();
        let cgroup = Cgroup::create(&kernel, "box", root.path(), None, 0, 0).unwrap();
        assert!(matches!(
            cgroup.set_cpu_shares(2),
            Err(ContainerError::CgroupUnavailable("cpu"))
        ));
        assert!(matches!(
            cgroup.deny_all_devices(),
            Err(ContainerError::CgroupUnavailable("devices"))
        ));
    }
}
