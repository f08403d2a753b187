//! Error types for the service VM crate.

use std::time::Duration;

use cloudlet_core::{CoreError, VmId};

/// Failures reported by a hypervisor or saved-state backend.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HypervisorError {
    /// The connection to the hypervisor could not be opened.
    #[error("cannot connect to hypervisor at {uri}: {reason}")]
    ConnectionFailed { uri: String, reason: String },

    /// The domain does not exist (or no longer exists) at the hypervisor.
    #[error("domain not found: {0}")]
    DomainNotFound(String),

    /// A hypervisor call failed.
    #[error("{operation} failed: {reason}")]
    Call {
        operation: &'static str,
        reason: String,
    },

    /// The connection was closed.
    #[error("hypervisor connection is closed")]
    Closed,
}

/// Coarse classification of a [`VmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A template or descriptor is missing a required node, or is invalid.
    Configuration,
    /// A disk image, snapshot, port, or store is unavailable.
    Resource,
    /// The hypervisor failed, timed out, or the call was cancelled.
    Hypervisor,
    /// The operation is not valid in the VM's lifecycle state.
    State,
}

/// Errors that can occur during service VM lifecycle operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum VmError {
    /// A template or descriptor is missing a required node or does not parse.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Error from the core record types.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A hypervisor call failed.
    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    /// Resuming from the saved state failed.
    #[error("error resuming VM {vm_id}: {reason}")]
    ResumeFailed { vm_id: VmId, reason: String },

    /// Pausing the VM or saving its memory state failed.
    #[error("snapshot failed for VM {vm_id}: {reason}")]
    SnapshotFailed { vm_id: VmId, reason: String },

    /// The operation is not valid in the VM's current state.
    #[error("invalid state for VM {vm_id}: {reason}")]
    State { vm_id: VmId, reason: String },

    /// A hypervisor step did not complete in time.
    #[error("{operation} timed out for VM {vm_id} after {}s", after.as_secs())]
    Timeout {
        vm_id: VmId,
        operation: &'static str,
        after: Duration,
    },

    /// The caller cancelled the operation.
    #[error("{operation} cancelled for VM {vm_id}")]
    Cancelled {
        vm_id: VmId,
        operation: &'static str,
    },

    /// The console client could not open a session; the VM was destroyed.
    #[error("console session on port {port} failed for VM {vm_id}")]
    ConsoleFailed { vm_id: VmId, port: u16 },

    /// No free host port could be found.
    #[error("no free host port after {attempts} attempts")]
    PortsExhausted { attempts: u32 },

    /// The VM record store failed.
    #[error("repository error: {0}")]
    Repository(String),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VmError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Core(core) => match core {
                CoreError::PortConflict { .. } | CoreError::InvalidPort { .. } => {
                    ErrorKind::Configuration
                }
                CoreError::Destroyed { .. } => ErrorKind::State,
                _ => ErrorKind::Resource,
            },
            Self::Hypervisor(_)
            | Self::ResumeFailed { .. }
            | Self::SnapshotFailed { .. }
            | Self::Timeout { .. }
            | Self::Cancelled { .. } => ErrorKind::Hypervisor,
            Self::State { .. } => ErrorKind::State,
            Self::ConsoleFailed { .. }
            | Self::PortsExhausted { .. }
            | Self::Repository(_)
            | Self::Io(_) => ErrorKind::Resource,
        }
    }

    /// Whether this wraps a hypervisor "domain not found" condition.
    #[must_use]
    pub fn is_domain_not_found(&self) -> bool {
        matches!(self, Self::Hypervisor(HypervisorError::DomainNotFound(_)))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn kinds_follow_the_four_categories() {
        let vm_id = VmId::new();
        assert_eq!(
            VmError::Configuration("no <uuid>".to_owned()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            VmError::from(CoreError::DiskImageMissing { path: PathBuf::from("/d") }).kind(),
            ErrorKind::Resource
        );
        assert_eq!(
            VmError::from(CoreError::Destroyed { vm_id }).kind(),
            ErrorKind::State
        );
        assert_eq!(
            VmError::from(HypervisorError::Closed).kind(),
            ErrorKind::Hypervisor
        );
        assert_eq!(
            VmError::Cancelled { vm_id, operation: "create" }.kind(),
            ErrorKind::Hypervisor
        );
    }

    #[test]
    fn domain_not_found_is_detected() {
        let err = VmError::from(HypervisorError::DomainNotFound("abc".to_owned()));
        assert!(err.is_domain_not_found());
        assert!(!VmError::from(HypervisorError::Closed).is_domain_not_found());
    }

    #[test]
    fn resume_error_display_names_the_vm() {
        let vm_id = VmId::new();
        let err = VmError::ResumeFailed { vm_id, reason: "bad image".to_owned() };
        let msg = err.to_string();
        assert!(msg.contains(&vm_id.to_string()), "message must name the VM: {msg}");
        assert!(msg.contains("bad image"));
    }
}
