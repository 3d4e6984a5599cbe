//! Resolving and applying the container's mounts
//!
//! Mounts made outside the new mount namespace, plus the loop devices and
//! device-mapper targets behind them, are recorded in a [MountLedger] as they
//! are acquired. Unwinding releases them in exactly the reverse order.

use crate::{
    config::MountSpec,
    errors::ContainerError,
    idmap,
    jail::JailPolicy,
    kernel::Kernel,
};
use nix::{errno::Errno, mount::MsFlags};
use std::{
    fs::{self, OpenOptions},
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
};

/// Where `path`, as seen inside the container, lives under `root`
pub fn outer_path(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(_) => root.join(path),
    }
}

/// Effective `(source, destination)` of a mount in the launcher's view
///
/// Relative bind sources are inside the container root; relative loopback
/// sources are next to the configuration, when its location is known.
pub fn resolve(spec: &MountSpec, root: &Path, config_root: Option<&Path>) -> (PathBuf, PathBuf) {
    let destination = outer_path(root, &spec.destination);
    let source = if spec.source.is_relative() && spec.is_bind() {
        outer_path(root, &spec.source)
    } else {
        match config_root {
            Some(config_root) if spec.loopback && spec.source.is_relative() => {
                config_root.join(&spec.source)
            }
            _ => spec.source.clone(),
        }
    };
    (source, destination)
}

fn destination_error<E: ToString>(path: &Path, e: E) -> ContainerError {
    ContainerError::MountDestination {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Create a missing mount destination, owned by the spec's uid/gid as mapped
/// to the host
///
/// The destination is a directory when the source is a directory, a block
/// device, or missing. Otherwise it is an empty file.
pub fn setup_destination(
    kernel: &dyn Kernel,
    spec: &MountSpec,
    source: &Path,
    destination: &Path,
    uid_map: &str,
    gid_map: &str,
) -> Result<(), ContainerError> {
    match fs::symlink_metadata(destination) {
        Ok(_) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
        Err(e) => return Err(destination_error(destination, e)),
    }

    let uid = idmap::outside_id(uid_map, spec.uid)?;
    let gid = idmap::outside_id(gid_map, spec.gid)?;
    let wants_dir = match fs::metadata(source) {
        Err(_) => true,
        Ok(metadata) => metadata.is_dir() || metadata.file_type().is_block_device(),
    };
    if wants_dir {
        fs::create_dir(destination).map_err(|e| destination_error(destination, e))?;
    } else {
        OpenOptions::new()
            .write(true)
            .create(true)
            .open(destination)
            .map_err(|e| destination_error(destination, e))?;
    }
    kernel
        .chown(destination, uid, gid)
        .map_err(|e| destination_error(destination, e))?;
    kernel
        .chmod(destination, spec.mode)
        .map_err(|e| destination_error(destination, e))?;
    Ok(())
}

/// Undo log of resources acquired outside the container's mount namespace
#[derive(Debug, Default)]
pub struct MountLedger {
    mounts: Vec<PathBuf>,
    loop_devices: Vec<PathBuf>,
    device_mappers: Vec<String>,
}

impl MountLedger {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty() && self.loop_devices.is_empty() && self.device_mappers.is_empty()
    }

    #[allow(dead_code)]
    pub fn mounts(&self) -> &[PathBuf] {
        &self.mounts
    }

    pub fn loop_devices(&self) -> &[PathBuf] {
        &self.loop_devices
    }

    #[allow(dead_code)]
    pub fn device_mappers(&self) -> &[String] {
        &self.device_mappers
    }

    /// Release everything in reverse order of acquisition: mounts, then
    /// loop devices, then device-mapper targets
    ///
    /// Failures are logged and skipped. Returns true if every release
    /// succeeded. The ledger is empty afterwards either way.
    pub fn unwind(&mut self, kernel: &dyn Kernel) -> bool {
        let mut ok = true;
        while let Some(target) = self.mounts.pop() {
            if let Err(e) = kernel.unmount(&target) {
                log::error!("failed to unmount {:?}: {}", target, e);
                ok = false;
            }
        }
        while let Some(device) = self.loop_devices.pop() {
            if let Err(e) = kernel.detach_loop(&device) {
                log::error!("failed to detach loop device {:?}: {}", device, e);
                ok = false;
            }
        }
        while let Some(name) = self.device_mappers.pop() {
            if let Err(e) = kernel.remove_verity(&name) {
                log::error!("failed to remove device-mapper target {}: {}", name, e);
                ok = false;
            }
        }
        ok
    }
}

/// Paths and ids the mounts are resolved against
#[derive(Debug, Clone, Copy)]
pub struct MountContext<'a> {
    /// Unique per container, used to name device-mapper targets
    pub name: &'a str,
    pub root: &'a Path,
    pub config_root: Option<&'a Path>,
    pub uid_map: &'a str,
    pub gid_map: &'a str,
}

/// Apply `mounts` in order
///
/// Anything left in the ledger from earlier is released first. If any mount
/// fails, everything this call acquired is released again before the error
/// is returned. Mounts flagged for the namespace are handed to `policy`.
pub fn apply_all(
    kernel: &dyn Kernel,
    context: &MountContext,
    mounts: &[MountSpec],
    ledger: &mut MountLedger,
    policy: &mut JailPolicy,
) -> Result<(), ContainerError> {
    if !ledger.is_empty() {
        log::debug!("releasing leftover mounts before applying new ones");
        ledger.unwind(kernel);
    }
    for (index, spec) in mounts.iter().enumerate() {
        if let Err(e) = apply_one(kernel, context, index, spec, ledger, policy) {
            log::error!("mount {:?} failed: {}", spec.name, e);
            ledger.unwind(kernel);
            return Err(e);
        }
    }
    Ok(())
}

fn apply_one(
    kernel: &dyn Kernel,
    context: &MountContext,
    index: usize,
    spec: &MountSpec,
    ledger: &mut MountLedger,
    policy: &mut JailPolicy,
) -> Result<(), ContainerError> {
    let (mut source, destination) = resolve(spec, context.root, context.config_root);

    if spec.create && !spec.mount_in_ns {
        setup_destination(
            kernel,
            spec,
            &source,
            &destination,
            context.uid_map,
            context.gid_map,
        )?;
    }

    if spec.loopback {
        let device = kernel.attach_loop(&source)?;
        ledger.loop_devices.push(device.clone());
        source = device;
    }

    if let Some(table) = &spec.verity {
        let name = format!("{}-{}", context.name, index);
        let device = kernel.setup_verity(&name, &source, table)?;
        ledger.device_mappers.push(name);
        source = device;
    }

    if spec.mount_in_ns {
        policy.mount(spec, &source, &destination);
        return Ok(());
    }

    let mount_error = |errno: Errno| ContainerError::Mount {
        from: source.clone(),
        destination: destination.clone(),
        errno,
    };
    let fs_type = Some(spec.fs_type.as_str()).filter(|t| !t.is_empty());
    kernel
        .mount(
            Some(&source),
            &destination,
            fs_type,
            spec.flags,
            spec.data.as_deref(),
        )
        .map_err(mount_error)?;
    ledger.mounts.push(destination.clone());

    // Bind mounts ignore every other flag until remounted
    let extra = spec.flags - MsFlags::MS_BIND - MsFlags::MS_REC;
    if spec.is_bind() && !extra.is_empty() {
        kernel
            .mount(
                None,
                &destination,
                None,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | extra,
                None,
            )
            .map_err(mount_error)?;
    }
    Ok(())
}
