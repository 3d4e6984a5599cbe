//! Capability names and the raw calls for dropping capabilities

use nix::errno::Errno;
use std::collections::HashMap;

/// Capability names in kernel numbering order
pub const CAPABILITY_NAMES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

lazy_static! {
    static ref CAPABILITY_NUMBERS: HashMap<&'static str, u32> = CAPABILITY_NAMES
        .iter()
        .enumerate()
        .map(|(number, name)| (*name, number as u32))
        .collect();
}

/// Look up a capability number by its `CAP_*` name
pub fn from_name(name: &str) -> Option<u32> {
    CAPABILITY_NUMBERS.get(name).copied()
}

/// Highest capability the running kernel knows about
pub fn last_cap() -> u32 {
    std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(CAPABILITY_NAMES.len() as u32 - 1)
}

// securebits, from linux/securebits.h
pub const SECBIT_NOROOT: u64 = 1 << 0;
pub const SECBIT_NO_SETUID_FIXUP: u64 = 1 << 2;
pub const SECBIT_KEEP_CAPS: u64 = 1 << 4;
pub const SECBIT_KEEP_CAPS_LOCKED: u64 = 1 << 5;
pub const SECBIT_NO_CAP_AMBIENT_RAISE: u64 = 1 << 6;
pub const SECBIT_NO_CAP_AMBIENT_RAISE_LOCKED: u64 = 1 << 7;
pub const SECURE_ALL_BITS: u64 = 0x55;
pub const SECURE_ALL_LOCKS: u64 = 0xAA;

/// The securebits locked in before dropping capabilities
pub fn securebits(skip_mask: u64, ambient: bool) -> u64 {
    let mut bits = (SECURE_ALL_BITS | SECURE_ALL_LOCKS) & !(SECBIT_KEEP_CAPS | SECBIT_KEEP_CAPS_LOCKED);
    if ambient {
        bits &= !(SECBIT_NO_CAP_AMBIENT_RAISE | SECBIT_NO_CAP_AMBIENT_RAISE_LOCKED);
    }
    bits & !skip_mask
}

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

fn prctl(option: libc::c_int, arg2: libc::c_ulong, arg3: libc::c_ulong) -> nix::Result<()> {
    let result = unsafe { libc::prctl(option, arg2, arg3, 0 as libc::c_ulong, 0 as libc::c_ulong) };
    Errno::result(result).map(drop)
}

pub fn set_securebits(bits: u64) -> nix::Result<()> {
    prctl(libc::PR_SET_SECUREBITS, bits as libc::c_ulong, 0)
}

pub fn set_keepcaps() -> nix::Result<()> {
    prctl(libc::PR_SET_KEEPCAPS, 1, 0)
}

/// Restrict the bounding, effective, permitted and inheritable sets to
/// `mask`, then raise the ambient set to match if requested
///
/// Does not allocate, so it is usable between fork and exec.
pub fn drop_to(mask: u64, ambient: bool, last_cap: u32) -> nix::Result<()> {
    for cap in 0..=last_cap.min(63) {
        if mask & (1 << cap) == 0 {
            prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0)?;
        }
    }

    let mut header = CapHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapData::default(); 2];
    for (index, word) in data.iter_mut().enumerate() {
        let bits = (mask >> (32 * index)) as u32;
        word.effective = bits;
        word.permitted = bits;
        word.inheritable = if ambient { bits } else { 0 };
    }
    let result = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &mut header as *mut CapHeader,
            data.as_mut_ptr(),
        )
    };
    Errno::result(result)?;

    if ambient {
        for cap in 0..=last_cap.min(63) {
            if mask & (1 << cap) != 0 {
                let result = unsafe {
                    libc::prctl(
                        libc::PR_CAP_AMBIENT,
                        libc::PR_CAP_AMBIENT_RAISE as libc::c_ulong,
                        cap as libc::c_ulong,
                        0 as libc::c_ulong,
                        0 as libc::c_ulong,
                    )
                };
                Errno::result(result)?;
            }
        }
    }
    Ok(())
}
