// vim: tw=80
//! A translation layer that exports a randomly writable block device on top of
//! a host-managed or host-aware zoned block device.

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// I use a common pattern to substitute mock objects for real ones in test
// builds.  Silence clippy's complaints.
#![allow(clippy::module_inception)]

pub mod admission;
pub mod config;
pub mod device;
pub mod gc;
pub mod layout;
pub mod map;
pub mod refresh;
pub mod report;
pub mod superblock;
pub mod types;
pub mod util;
pub mod zdm;
pub mod zone;
pub mod zone_store;
pub mod zoned_file;

pub use crate::types::*;
pub use crate::util::*;
pub use crate::zdm::Zdm;
