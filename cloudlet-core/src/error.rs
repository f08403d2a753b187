use std::path::PathBuf;

use crate::id::VmId;

/// Errors produced by the `cloudlet-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A host port is already forwarded to a different guest port.
    #[error("host port {host_port} already maps to guest port {existing}, refusing to remap it to {requested}")]
    PortConflict {
        host_port: u16,
        existing: u16,
        requested: u16,
    },

    /// Port 0 cannot be forwarded.
    #[error("invalid port {port}: must be in 1..=65535")]
    InvalidPort { port: u16 },

    /// The VM's disk image does not exist on disk.
    #[error("disk image not found at {path}")]
    DiskImageMissing { path: PathBuf },

    /// Changing the read-only guard on an image file failed.
    #[error("cannot update permissions on {path}: {source}")]
    Permission {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The VM was destroyed and accepts no further operations.
    #[error("service VM {vm_id} has been destroyed")]
    Destroyed { vm_id: VmId },
}
