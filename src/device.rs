//! Device nodes inside the container's root

use crate::{
    config::{DeviceMinor, DeviceSpec, DeviceType},
    errors::ContainerError,
    idmap,
    kernel::Kernel,
    mount::outer_path,
};
use nix::{
    errno::Errno,
    sys::stat::{Mode, SFlag},
};
use std::path::Path;

fn node_kind(device_type: DeviceType) -> SFlag {
    match device_type {
        DeviceType::Block => SFlag::S_IFBLK,
        DeviceType::Char | DeviceType::All => SFlag::S_IFCHR,
    }
}

/// Create every device node under `root`
///
/// Devices that copy their minor number from a host node are skipped when
/// the host node is missing. An existing node counts as created; ownership
/// and mode are applied again in that case.
pub fn create_devices(
    kernel: &dyn Kernel,
    root: &Path,
    devices: &[DeviceSpec],
    uid_map: &str,
    gid_map: &str,
) -> Result<(), ContainerError> {
    for device in devices {
        let minor = match device.minor {
            DeviceMinor::Fixed(minor) => minor,
            DeviceMinor::CopyFromHost => match kernel.device_numbers(&device.path) {
                Ok((_, minor)) => minor,
                Err(e) => {
                    log::debug!("skipping device {:?}, no host node: {}", device.path, e);
                    continue;
                }
            },
        };

        let path = outer_path(root, &device.path);
        let perm = Mode::from_bits_truncate(device.fs_permissions);
        match kernel.mknod(&path, node_kind(device.device_type), perm, device.major, minor) {
            Ok(()) | Err(Errno::EEXIST) => (),
            Err(errno) => return Err(ContainerError::DeviceNode { path, errno }),
        }

        let uid = idmap::outside_id(uid_map, device.uid)?;
        let gid = idmap::outside_id(gid_map, device.gid)?;
        kernel
            .chown(&path, uid, gid)
            .map_err(|errno| ContainerError::DeviceNode {
                path: path.clone(),
                errno,
            })?;
        kernel.chmod(&path, device.fs_permissions)?;
    }
    Ok(())
}
