//! Host-to-guest port forwarding table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Port forwarding rules for one VM, keyed by host port.
///
/// Host ports are unique within the table. Iteration is in ascending host
/// port order so the generated redirection arguments are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortMappings(BTreeMap<u16, u16>);

impl PortMappings {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward `host_port` to `guest_port`.
    ///
    /// Returns `false` if the identical rule was already present.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidPort`] for port 0, and
    /// [`CoreError::PortConflict`] if `host_port` already forwards to a
    /// different guest port.
    pub fn insert(&mut self, host_port: u16, guest_port: u16) -> Result<bool, CoreError> {
        for port in [host_port, guest_port] {
            if port == 0 {
                return Err(CoreError::InvalidPort { port });
            }
        }
        match self.0.get(&host_port) {
            Some(&existing) if existing == guest_port => Ok(false),
            Some(&existing) => Err(CoreError::PortConflict {
                host_port,
                existing,
                requested: guest_port,
            }),
            None => {
                self.0.insert(host_port, guest_port);
                Ok(true)
            }
        }
    }

    /// Guest port forwarded from `host_port`, if any.
    #[must_use]
    pub fn get(&self, host_port: u16) -> Option<u16> {
        self.0.get(&host_port).copied()
    }

    /// First host port forwarding to `guest_port`, if any.
    #[must_use]
    pub fn host_port_for(&self, guest_port: u16) -> Option<u16> {
        self.0
            .iter()
            .find(|(_, &guest)| guest == guest_port)
            .map(|(&host, _)| host)
    }

    /// Iterate over `(host_port, guest_port)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.0.iter().map(|(&host, &guest)| (host, guest))
    }

    /// Iterate over the host ports in use.
    pub fn host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
