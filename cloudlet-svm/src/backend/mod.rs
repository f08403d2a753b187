//! Hypervisor backends.

pub mod libvirt;

pub use libvirt::{LibvirtDomain, LibvirtHypervisor, LibvirtSavedState};
