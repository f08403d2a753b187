//! Service VM lifecycle management for cloudlets.
//!
//! Creates service VMs from domain templates, suspends them to a saved-state
//! file, resumes them with refreshed runtime parameters, and tears them down.
//! The hypervisor, saved-state store, port allocator, console client and
//! record store are injected as trait objects so the lifecycle logic can be
//! exercised without a real hypervisor.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

#[cfg(feature = "libvirt")]
pub mod backend;
pub mod config;
pub mod console;
pub mod descriptor;
pub mod error;
pub mod hypervisor;
pub mod lifecycle;
pub mod ports;
pub mod repository;
pub mod saved_state;
pub mod telemetry;

pub use config::SvmConfig;
pub use console::{VncClient, ViewerVncClient};
pub use descriptor::{redirect_args, DomainDescriptor};
pub use error::{ErrorKind, HypervisorError, VmError};
pub use hypervisor::{DomainControl, DomainLookup, Hypervisor};
pub use lifecycle::{Collaborators, VmController};
pub use ports::{LocalPortAllocator, PortAllocator};
pub use repository::{InMemoryRepository, JsonFileRepository, VmRepository};
pub use saved_state::SavedStateStore;
