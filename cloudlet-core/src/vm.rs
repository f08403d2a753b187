use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{ServiceId, VmId};
use crate::image::DiskImage;
use crate::ports::PortMappings;

/// Prefix used for hypervisor domain names unless overridden.
pub const DEFAULT_NAME_PREFIX: &str = "VM";

/// How the VM's network interface reaches the outside world.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum NetworkMode {
    /// User-mode NAT with host port redirection.
    #[default]
    Nat,
    /// Attached directly to a host bridge.
    Bridged,
}

/// Lifecycle state of a service VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmState {
    /// No domain exists at the hypervisor.
    Stopped,
    /// A domain is live at the hypervisor.
    Running,
    /// Torn down; the record accepts no further operations.
    Destroyed,
}

/// Persisted record of a service VM.
///
/// The record owns its disk image and port table. Lifecycle transitions are
/// driven from outside (see `cloudlet-svm`); this type only guards the
/// invariants that must hold whichever way it is mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ServiceVm {
    /// Unique identifier, also used as the domain UUID.
    pub id: VmId,
    /// The logical service this VM hosts.
    pub service_id: ServiceId,
    /// Prefix of the hypervisor domain name.
    pub name_prefix: String,
    /// The VM's disk image.
    pub image: DiskImage,
    /// Guest port the service listens on.
    pub service_port: u16,
    /// Network attachment applied when the descriptor is merged.
    pub network_mode: NetworkMode,
    /// Open the VNC console on all host interfaces.
    pub remote_console: bool,
    /// MAC of the bridged interface, once one has been generated.
    pub mac_address: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    external_port: Option<u16>,
    port_mappings: PortMappings,
    running: bool,
    #[serde(skip)]
    destroyed: bool,
}

impl ServiceVm {
    /// Create a stopped VM record with a fresh id.
    #[must_use]
    pub fn new(service_id: ServiceId, image: DiskImage, service_port: u16) -> Self {
        Self {
            id: VmId::new(),
            service_id,
            name_prefix: DEFAULT_NAME_PREFIX.to_owned(),
            image,
            service_port,
            network_mode: NetworkMode::Nat,
            remote_console: false,
            mac_address: None,
            created_at: Utc::now(),
            external_port: None,
            port_mappings: PortMappings::new(),
            running: false,
            destroyed: false,
        }
    }

    /// Name given to the hypervisor domain: `<prefix>-<id>`.
    #[must_use]
    pub fn domain_name(&self) -> String {
        format!("{}-{}", self.name_prefix, self.id)
    }

    #[must_use]
    pub fn state(&self) -> VmState {
        if self.destroyed {
            VmState::Destroyed
        } else if self.running {
            VmState::Running
        } else {
            VmState::Stopped
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running && !self.destroyed
    }

    /// Host port forwarded to the service port, once assigned.
    #[must_use]
    pub fn external_port(&self) -> Option<u16> {
        self.external_port
    }

    #[must_use]
    pub fn port_mappings(&self) -> &PortMappings {
        &self.port_mappings
    }

    /// Forward `host_port` on the host to `guest_port` in the VM.
    ///
    /// Mapping onto the service port also records `host_port` as the
    /// external port.
    ///
    /// # Errors
    /// Returns [`CoreError::Destroyed`] after the VM is destroyed, and the
    /// errors of [`PortMappings::insert`].
    pub fn add_port_mapping(&mut self, host_port: u16, guest_port: u16) -> Result<(), CoreError> {
        self.ensure_live()?;
        let added = self.port_mappings.insert(host_port, guest_port)?;
        if guest_port == self.service_port {
            self.external_port = Some(host_port);
        }
        if added {
            tracing::info!(vm_id = %self.id, host_port, guest_port, "port forwarding added");
        }
        Ok(())
    }

    /// Fail unless the VM is still live.
    ///
    /// # Errors
    /// Returns [`CoreError::Destroyed`] once [`ServiceVm::mark_destroyed`] ran.
    pub fn ensure_live(&self) -> Result<(), CoreError> {
        if self.destroyed {
            return Err(CoreError::Destroyed { vm_id: self.id });
        }
        Ok(())
    }

    /// Record whether a domain is live. Only the lifecycle layer calls this.
    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// Move to the terminal state.
    pub fn mark_destroyed(&mut self) {
        self.running = false;
        self.destroyed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm() -> ServiceVm {
        ServiceVm::new(
            ServiceId::new("face-recognition"),
            DiskImage::new("/vm/disk.qcow2", "/vm/disk.lqs"),
            80,
        )
    }

    #[test]
    fn new_vm_is_stopped_without_external_port() {
        let vm = vm();
        assert_eq!(vm.state(), VmState::Stopped);
        assert!(vm.external_port().is_none());
        assert!(vm.port_mappings().is_empty());
        assert_eq!(vm.domain_name(), format!("VM-{}", vm.id));
    }

    #[test]
    fn mapping_service_port_sets_external_port() {
        let mut vm = vm();
        assert!(vm.add_port_mapping(8080, 80).is_ok());
        assert_eq!(vm.external_port(), Some(8080));
    }

    #[test]
    fn mapping_other_port_leaves_external_port_unset() {
        let mut vm = vm();
        assert!(vm.add_port_mapping(2222, 22).is_ok());
        assert!(vm.external_port().is_none());
        assert_eq!(vm.port_mappings().get(2222), Some(22));
    }

    #[test]
    fn conflicting_mapping_keeps_external_port() {
        let mut vm = vm();
        assert!(vm.add_port_mapping(8080, 80).is_ok());
        assert!(matches!(
            vm.add_port_mapping(8080, 22),
            Err(CoreError::PortConflict { .. })
        ));
        assert_eq!(vm.external_port(), Some(8080));
    }

    #[test]
    fn destroyed_vm_rejects_mappings() {
        let mut vm = vm();
        vm.set_running(true);
        vm.mark_destroyed();
        assert_eq!(vm.state(), VmState::Destroyed);
        assert!(!vm.is_running());
        assert!(matches!(
            vm.add_port_mapping(8080, 80),
            Err(CoreError::Destroyed { .. })
        ));
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut vm = vm();
        assert!(vm.add_port_mapping(8080, 80).is_ok());
        vm.set_running(true);
        let json = match serde_json::to_string(&vm) {
            Ok(s) => s,
            Err(e) => panic!("serialize: {e}"),
        };
        let back: ServiceVm = match serde_json::from_str(&json) {
            Ok(v) => v,
            Err(e) => panic!("deserialize: {e}"),
        };
        assert_eq!(back.id, vm.id);
        assert_eq!(back.external_port(), Some(8080));
        assert!(back.is_running());
        assert_eq!(back.image, vm.image);
    }
}
