//! Loop devices and dm-verity targets backing container mounts

use crate::errors::ContainerError;
use std::{
    fs::OpenOptions,
    io,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    process::Command,
};

const LOOP_CONTROL: &str = "/dev/loop-control";
const DMSETUP: &str = "dmsetup";

/// Placeholder in a verity table for the underlying device
pub const VERITY_DEVICE_PLACEHOLDER: &str = "@DEV@";

nix::ioctl_none_bad!(loop_ctl_get_free, 0x4C82);
nix::ioctl_write_int_bad!(loop_set_fd, 0x4C00);
nix::ioctl_none_bad!(loop_clr_fd, 0x4C01);

fn loop_error<E: ToString>(path: &Path, e: E) -> ContainerError {
    ContainerError::LoopDevice {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Attach `backing` to the first free loop device
///
/// The backing file is opened read-write when possible, falling back to
/// read-only.
pub fn attach_loop(backing: &Path) -> Result<PathBuf, ContainerError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(backing)
        .or_else(|_| OpenOptions::new().read(true).open(backing))
        .map_err(|e| loop_error(backing, e))?;

    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .open(LOOP_CONTROL)
        .map_err(|e| loop_error(backing, e))?;
    let number = unsafe { loop_ctl_get_free(control.as_raw_fd()) }.map_err(|e| loop_error(backing, e))?;
    let device = PathBuf::from(format!("/dev/loop{}", number));

    let loop_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&device)
        .map_err(|e| loop_error(&device, e))?;
    unsafe { loop_set_fd(loop_file.as_raw_fd(), file.as_raw_fd()) }.map_err(|e| loop_error(&device, e))?;
    log::debug!("attached {:?} to {:?}", backing, device);
    Ok(device)
}

pub fn detach_loop(device: &Path) -> Result<(), ContainerError> {
    let loop_file = OpenOptions::new()
        .read(true)
        .open(device)
        .map_err(|e| loop_error(device, e))?;
    unsafe { loop_clr_fd(loop_file.as_raw_fd()) }.map_err(|e| loop_error(device, e))?;
    log::debug!("detached {:?}", device);
    Ok(())
}

/// Substitute the underlying device into a verity table
pub fn verity_table(table: &str, source: &Path) -> String {
    table.replace(VERITY_DEVICE_PLACEHOLDER, &source.to_string_lossy())
}

pub fn mapper_path(name: &str) -> PathBuf {
    Path::new("/dev/mapper").join(name)
}

fn dmsetup(name: &str, args: &[&str]) -> Result<(), ContainerError> {
    let dm_error = |reason: String| ContainerError::DeviceMapper {
        name: name.to_string(),
        reason,
    };
    let output = Command::new(DMSETUP)
        .args(args)
        .output()
        .map_err(|e: io::Error| dm_error(e.to_string()))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(dm_error(format!(
            "dmsetup {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Create a read-only verity target named `name` over `source`
pub fn setup_verity(name: &str, source: &Path, table: &str) -> Result<PathBuf, ContainerError> {
    let table = verity_table(table, source);
    dmsetup(name, &["create", name, "--readonly", "--table", &table])?;
    dmsetup(name, &["mknodes", name])?;
    let path = mapper_path(name);
    log::debug!("created verity target {:?} over {:?}", path, source);
    Ok(path)
}

pub fn remove_verity(name: &str) -> Result<(), ContainerError> {
    dmsetup(name, &["remove", name])
}
