//! `ubi-core`: the flash-backed storage engine of the Unsorted Block Image (UBI) layer.
//!
//! This crate implements the four subsystems that sit between raw flash and a set of named
//! logical volumes: low-level I/O (`io`), attach/scan (`attach`), wear-leveling (`wl`), and
//! eraseblock association (`eba`), glued together by [`device::Device`]. The volume table
//! (`vtbl`), on-flash header codecs (`headers`), and derived geometry (`layout`) support those
//! four. `provision`/`scan`/`ubinize` are the bulk-provisioning path used to turn blank or
//! foreign flash into something [`device::Device::attach`] can mount, analogous to how a
//! partitioning tool prepares a disk before a filesystem driver mounts it.

pub mod attach;
pub mod device;
pub mod eba;
pub mod error;
pub mod headers;
pub mod io;
pub mod layout;
pub mod nand;
pub mod provision;
pub mod scan;
pub mod ubinize;
pub mod util;
pub mod vtbl;
pub mod wl;

pub use device::Device;
pub use error::{UbiError, UbiResult};
pub use headers::VolType;
pub use layout::DeviceConfig;
