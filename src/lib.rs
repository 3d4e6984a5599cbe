#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("nsbox only works on linux or android");

#[macro_use] extern crate lazy_static;
#[macro_use] extern crate serde;

pub mod config;
pub mod container;
pub mod errors;
pub mod hook;
pub mod jail;
pub mod kernel;
pub mod oci;

mod blockdev;
mod cgroup;
mod device;
mod idmap;
mod mount;
mod pipe;

#[cfg(test)]
mod testing;

pub use crate::{
    config::ContainerConfig,
    container::{Container, ExitStatus},
    oci::{ContainerOptions, Launcher, LauncherPaths},
};
