//! Core types for cloudlet service VMs.
//!
//! Defines the records shared by the lifecycle layer: VM and service
//! identifiers, the disk image a VM owns, its host-to-guest port table,
//! and the persisted [`ServiceVm`] record itself.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod id;
pub mod image;
pub mod ports;
pub mod vm;

pub use error::CoreError;
pub use id::{ServiceId, VmId};
pub use image::{DiskImage, DEFAULT_DISK_FORMAT};
pub use ports::PortMappings;
pub use vm::{NetworkMode, ServiceVm, VmState, DEFAULT_NAME_PREFIX};
