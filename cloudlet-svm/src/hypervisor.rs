//! Hypervisor abstraction.
//!
//! Lets the lifecycle controller drive libvirt, or an in-process fake,
//! without knowing which one it talks to.

use std::path::Path;

use async_trait::async_trait;
use cloudlet_core::VmId;

use crate::HypervisorError;

/// Result of looking up a domain by id.
///
/// A missing domain is an expected outcome, not an error.
pub enum DomainLookup {
    Found(Box<dyn DomainControl>),
    NotFound,
}

impl std::fmt::Debug for DomainLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Found(_) => f.write_str("Found(..)"),
            Self::NotFound => f.write_str("NotFound"),
        }
    }
}

/// Connection to a hypervisor.
///
/// Implementations must be `Send + Sync` to allow use across async tasks.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Instantiate and boot a domain from its XML description.
    ///
    /// # Errors
    /// Returns [`HypervisorError::Call`] if the hypervisor rejects the domain.
    async fn create_domain(&self, xml: &str) -> Result<(), HypervisorError>;

    /// Resume a domain from a saved-state file, running, using `xml` as its
    /// description.
    ///
    /// # Errors
    /// Returns [`HypervisorError::Call`] if the restore fails.
    async fn restore_domain(&self, saved_state: &Path, xml: &str) -> Result<(), HypervisorError>;

    /// Find the live domain whose UUID is `id`.
    ///
    /// # Errors
    /// Returns [`HypervisorError`] for failures other than "not found".
    async fn lookup_domain(&self, id: VmId) -> Result<DomainLookup, HypervisorError>;

    /// Release the connection. Later calls fail with
    /// [`HypervisorError::Closed`].
    ///
    /// # Errors
    /// Returns [`HypervisorError::Call`] if the hypervisor refuses to close.
    async fn close(&self) -> Result<(), HypervisorError>;
}

/// Operations on one live domain.
#[async_trait]
pub trait DomainControl: Send + Sync {
    /// Cap the bandwidth used when the memory state is saved, in MiB/s.
    async fn set_max_transfer_rate(&self, mib_per_sec: u64) -> Result<(), HypervisorError>;

    /// Pause the guest CPUs.
    async fn suspend(&self) -> Result<(), HypervisorError>;

    /// Write the memory state to `path`. The domain stops as a side effect.
    async fn save_to_file(&self, path: &Path) -> Result<(), HypervisorError>;

    /// Force the domain off.
    ///
    /// # Errors
    /// Returns [`HypervisorError::DomainNotFound`] if it is already gone.
    async fn destroy(&self) -> Result<(), HypervisorError>;

    /// Live XML description. `secure` includes security-sensitive fields
    /// such as the VNC password.
    async fn describe(&self, secure: bool) -> Result<String, HypervisorError>;
}
