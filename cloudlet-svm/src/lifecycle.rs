//! Service VM lifecycle controller.
//!
//! Drives a [`ServiceVm`] record through create, suspend, resume and
//! teardown against injected collaborators. Operations on the same VM are
//! serialized through a per-VM async mutex; every hypervisor step is bounded
//! by the configured timeout and can be cancelled by the caller.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use cloudlet_core::{CoreError, NetworkMode, ServiceId, ServiceVm, VmId};
use tokio_util::sync::CancellationToken;

use crate::console::VncClient;
use crate::descriptor::DomainDescriptor;
use crate::hypervisor::{DomainControl, DomainLookup, Hypervisor};
use crate::ports::PortAllocator;
use crate::repository::VmRepository;
use crate::saved_state::SavedStateStore;
use crate::{HypervisorError, SvmConfig, VmError};

/// External services the controller depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub saved_state: Arc<dyn SavedStateStore>,
    pub ports: Arc<dyn PortAllocator>,
    pub console: Arc<dyn VncClient>,
    pub repository: Arc<dyn VmRepository>,
}

type VmLock = Arc<tokio::sync::Mutex<()>>;

/// Runs lifecycle operations on service VMs.
///
/// All methods are safe to call concurrently. Calls for the same VM id are
/// applied one at a time, in lock acquisition order.
///
/// The caller's [`ServiceVm`] may be a stale copy. Under the lock it is
/// checked against the VMs this controller destroyed and its `running` flag
/// is taken from the stored record, if there is one.
pub struct VmController {
    deps: Collaborators,
    config: SvmConfig,
    locks: Mutex<HashMap<VmId, VmLock>>,
    destroyed: Mutex<HashSet<VmId>>,
}

impl VmController {
    #[must_use]
    pub fn new(deps: Collaborators, config: SvmConfig) -> Self {
        Self {
            deps,
            config,
            locks: Mutex::new(HashMap::new()),
            destroyed: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SvmConfig {
        &self.config
    }

    /// Number of VMs that currently have a lock entry.
    #[must_use]
    pub fn tracked_vms(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Create and boot a new domain for `vm` from the template at `template`.
    ///
    /// On any hypervisor failure, timeout or cancellation the partially
    /// created domain is torn down and the VM is destroyed.
    ///
    /// # Errors
    /// - [`VmError::Configuration`] if the template is missing or invalid;
    ///   no domain is created in that case.
    /// - [`VmError::State`] if `vm` is already running, or a
    ///   [`cloudlet_core::CoreError::Destroyed`] error once destroyed.
    /// - [`VmError::Hypervisor`], [`VmError::Timeout`] or
    ///   [`VmError::Cancelled`] if the domain could not be created.
    pub async fn create(
        &self,
        vm: &mut ServiceVm,
        template: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), VmError> {
        let lock = self.lock_for(vm.id);
        let _guard = lock.lock().await;
        self.sync_with_record(vm).await?;
        if vm.is_running() {
            return Err(VmError::State {
                vm_id: vm.id,
                reason: "cannot create a VM that is already running".to_owned(),
            });
        }

        let template_xml = tokio::fs::read_to_string(template).await.map_err(|e| {
            VmError::Configuration(format!("cannot read template {}: {e}", template.display()))
        })?;
        let before = vm.clone();
        let xml = match self.render(vm, &template_xml).await {
            Ok(xml) => xml,
            Err(e) => {
                self.revert(vm, before).await;
                return Err(e);
            }
        };

        tracing::info!(vm_id = %vm.id, template = %template.display(), "creating service VM");
        let created = self
            .step(vm.id, "create", cancel, self.deps.hypervisor.create_domain(&xml))
            .await;
        if let Err(e) = created {
            tracing::error!(vm_id = %vm.id, error = %e, "create failed, rolling back");
            self.rollback_create(vm).await;
            return Err(e);
        }

        vm.set_running(true);
        self.deps.repository.save(vm).await?;
        tracing::info!(vm_id = %vm.id, external_port = ?vm.external_port(), "service VM running");
        Ok(())
    }

    /// Resume `vm` from its saved state with refreshed runtime parameters.
    ///
    /// Does nothing if the VM is already running. On failure any partially
    /// restored domain is torn down; the record and the saved state are kept
    /// so the resume can be retried.
    ///
    /// # Errors
    /// - [`VmError::ResumeFailed`] if the hypervisor rejects the restore.
    /// - [`VmError::Timeout`] or [`VmError::Cancelled`].
    /// - [`VmError::Configuration`] if the saved descriptor cannot be merged.
    /// - [`VmError::Core`] if the disk image is missing or cannot be unprotected.
    pub async fn start(&self, vm: &mut ServiceVm, cancel: &CancellationToken) -> Result<(), VmError> {
        let lock = self.lock_for(vm.id);
        let _guard = lock.lock().await;
        self.sync_with_record(vm).await?;
        if vm.is_running() {
            tracing::debug!(vm_id = %vm.id, "start ignored, VM already running");
            return Ok(());
        }

        let before = vm.clone();
        if let Err(e) = self.resume(vm, cancel).await {
            tracing::error!(vm_id = %vm.id, error = %e, "start failed, rolling back");
            self.teardown_domain(vm.id).await;
            self.revert(vm, before).await;
            if let Err(protect) = vm.image.protect() {
                tracing::warn!(vm_id = %vm.id, error = %protect, "cannot re-protect disk image");
            }
            return Err(e);
        }

        vm.set_running(true);
        self.deps.repository.save(vm).await?;
        tracing::info!(vm_id = %vm.id, external_port = ?vm.external_port(), "service VM resumed");
        Ok(())
    }

    /// Suspend `vm` to its saved-state file and destroy its domain.
    ///
    /// Cloned images are not snapshotted. The domain is destroyed even if
    /// the snapshot fails, and `running` is cleared once destruction is
    /// confirmed.
    ///
    /// # Errors
    /// - [`VmError::SnapshotFailed`] if the memory state could not be saved;
    ///   the domain is destroyed and the image re-protected regardless.
    /// - [`VmError::Hypervisor`] or [`VmError::Timeout`] if the domain could
    ///   not be destroyed; the VM is then still marked running.
    pub async fn stop(&self, vm: &mut ServiceVm) -> Result<(), VmError> {
        let lock = self.lock_for(vm.id);
        let _guard = lock.lock().await;
        self.sync_with_record(vm).await?;
        self.stop_locked(vm).await
    }

    /// Stop `vm` if running, release its disk image and host ports, and
    /// remove its record.
    ///
    /// A snapshot failure during the stop is logged and teardown continues.
    ///
    /// # Errors
    /// Returns the stop error if the domain could not be destroyed, or a
    /// repository error if the record cannot be removed.
    pub async fn destroy(&self, vm: &mut ServiceVm) -> Result<(), VmError> {
        let lock = self.lock_for(vm.id);
        let result = {
            let _guard = lock.lock().await;
            self.sync_with_record(vm).await?;
            self.destroy_locked(vm).await
        };
        if result.is_ok() {
            self.forget_lock(vm.id);
        }
        result
    }

    /// Open a VNC console on the running `vm`.
    ///
    /// The VM lock is not held while the session is open. If the console
    /// cannot be opened the VM is destroyed.
    ///
    /// # Errors
    /// - [`VmError::State`] if the VM is not running.
    /// - [`VmError::Configuration`] if the live descriptor has no VNC port.
    /// - [`VmError::ConsoleFailed`] if the client failed.
    pub async fn open_console(&self, vm: &mut ServiceVm, wait: bool) -> Result<(), VmError> {
        let lock = self.lock_for(vm.id);
        let port = {
            let _guard = lock.lock().await;
            self.sync_with_record(vm).await?;
            if !vm.is_running() {
                return Err(VmError::State {
                    vm_id: vm.id,
                    reason: "console requires a running VM".to_owned(),
                });
            }
            self.console_port(vm.id).await?
        };

        tracing::info!(vm_id = %vm.id, port, wait, "opening VNC console");
        if self.deps.console.connect(port, wait).await {
            return Ok(());
        }

        tracing::warn!(vm_id = %vm.id, port, "VNC console failed, destroying VM");
        let destroyed = {
            let _guard = lock.lock().await;
            if self.sync_with_record(vm).await.is_ok() {
                self.destroy_locked(vm).await
            } else {
                Ok(())
            }
        };
        match destroyed {
            Ok(()) => self.forget_lock(vm.id),
            Err(e) => tracing::error!(vm_id = %vm.id, error = %e, "cannot destroy VM after console failure"),
        }
        Err(VmError::ConsoleFailed { vm_id: vm.id, port })
    }

    /// Forward `host_port` to `guest_port` and persist the record. Takes
    /// effect the next time the descriptor is merged, on create or start.
    ///
    /// # Errors
    /// Returns the [`CoreError`] of [`ServiceVm::add_port_mapping`], or a
    /// repository error.
    pub async fn add_port_mapping(
        &self,
        vm: &mut ServiceVm,
        host_port: u16,
        guest_port: u16,
    ) -> Result<(), VmError> {
        let lock = self.lock_for(vm.id);
        let _guard = lock.lock().await;
        self.sync_with_record(vm).await?;
        vm.add_port_mapping(host_port, guest_port)?;
        self.deps.repository.save(vm).await
    }

    /// Persist `vm` as it is now.
    ///
    /// # Errors
    /// Returns a state error once the VM is destroyed, or a repository error.
    pub async fn save(&self, vm: &mut ServiceVm) -> Result<(), VmError> {
        let lock = self.lock_for(vm.id);
        let _guard = lock.lock().await;
        self.ensure_not_destroyed(vm)?;
        self.deps.repository.save(vm).await
    }

    /// # Errors
    /// Returns a repository error.
    pub async fn find(&self, id: VmId) -> Result<Option<ServiceVm>, VmError> {
        self.deps.repository.find_by_id(id).await
    }

    /// # Errors
    /// Returns a repository error.
    pub async fn find_by_service(&self, service_id: &ServiceId) -> Result<Vec<ServiceVm>, VmError> {
        self.deps.repository.find_by_service_id(service_id).await
    }

    /// Close the hypervisor connection.
    ///
    /// # Errors
    /// Returns [`VmError::Hypervisor`] if the connection refuses to close.
    pub async fn shutdown(&self) -> Result<(), VmError> {
        self.deps.hypervisor.close().await?;
        Ok(())
    }

    async fn resume(&self, vm: &mut ServiceVm, cancel: &CancellationToken) -> Result<(), VmError> {
        vm.image.unprotect()?;
        let state_path = vm.image.state_image_path.clone();

        let saved_xml = self
            .step(vm.id, "load saved state", cancel, self.deps.saved_state.load(&state_path))
            .await?;
        let mut descriptor = DomainDescriptor::parse(&saved_xml)?;
        self.merge(vm, &mut descriptor).await?;
        let xml = descriptor.to_xml_string()?;
        self.step(
            vm.id,
            "update saved state",
            cancel,
            self.deps.saved_state.save(&state_path, &xml),
        )
        .await?;

        tracing::info!(vm_id = %vm.id, state = %state_path.display(), "resuming service VM");
        self.step(
            vm.id,
            "resume",
            cancel,
            self.deps.hypervisor.restore_domain(&state_path, &xml),
        )
        .await
        .map_err(|e| match e {
            VmError::Hypervisor(source) => VmError::ResumeFailed {
                vm_id: vm.id,
                reason: source.to_string(),
            },
            other => other,
        })
    }

    async fn stop_locked(&self, vm: &mut ServiceVm) -> Result<(), VmError> {
        if !vm.is_running() {
            return Ok(());
        }
        let never = CancellationToken::new();
        tracing::info!(vm_id = %vm.id, "stopping service VM");

        let domain = match self
            .step(vm.id, "lookup", &never, self.deps.hypervisor.lookup_domain(vm.id))
            .await?
        {
            DomainLookup::Found(domain) => domain,
            DomainLookup::NotFound => {
                tracing::warn!(vm_id = %vm.id, "no domain found, marking VM stopped");
                vm.set_running(false);
                return self.deps.repository.save(vm).await;
            }
        };

        let snapshot = if vm.image.cloned {
            Ok(())
        } else {
            self.snapshot(vm, domain.as_ref()).await
        };

        match self.step(vm.id, "destroy", &never, domain.destroy()).await {
            Ok(()) => {}
            Err(e) if e.is_domain_not_found() => {
                tracing::debug!(vm_id = %vm.id, "domain already gone while destroying it");
            }
            Err(e) => return Err(e),
        }
        vm.set_running(false);
        self.deps.repository.save(vm).await?;

        if !vm.image.cloned {
            if let Err(e) = vm.image.protect() {
                if snapshot.is_ok() {
                    return Err(e.into());
                }
                tracing::warn!(vm_id = %vm.id, error = %e, "cannot re-protect disk image");
            }
        }
        snapshot?;
        tracing::info!(vm_id = %vm.id, "service VM stopped");
        Ok(())
    }

    async fn snapshot(&self, vm: &ServiceVm, domain: &dyn DomainControl) -> Result<(), VmError> {
        let never = CancellationToken::new();
        let state_path = &vm.image.state_image_path;
        tracing::info!(vm_id = %vm.id, state = %state_path.display(), "saving memory state");
        let save = async {
            domain.set_max_transfer_rate(self.config.max_transfer_rate).await?;
            domain.suspend().await?;
            domain.save_to_file(state_path).await
        };
        self.step(vm.id, "snapshot", &never, save)
            .await
            .map_err(|e| VmError::SnapshotFailed {
                vm_id: vm.id,
                reason: e.to_string(),
            })
    }

    async fn destroy_locked(&self, vm: &mut ServiceVm) -> Result<(), VmError> {
        if vm.is_running() {
            if let Err(e) = self.stop_locked(vm).await {
                if vm.is_running() {
                    return Err(e);
                }
                tracing::warn!(vm_id = %vm.id, error = %e, "stop failed after domain teardown, continuing");
            }
        }

        if let Err(e) = vm.image.cleanup() {
            tracing::warn!(vm_id = %vm.id, error = %e, "disk image cleanup failed");
        }
        self.deps.repository.find_and_remove_by_id(vm.id).await?;
        for port in vm.port_mappings().host_ports() {
            self.deps.ports.release(port).await;
        }
        vm.mark_destroyed();
        self.destroyed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(vm.id);
        tracing::info!(vm_id = %vm.id, "service VM destroyed");
        Ok(())
    }

    async fn rollback_create(&self, vm: &mut ServiceVm) {
        self.teardown_domain(vm.id).await;
        vm.set_running(false);
        if let Err(e) = self.destroy_locked(vm).await {
            tracing::warn!(vm_id = %vm.id, error = %e, "rollback could not destroy VM");
        }
    }

    /// Best-effort removal of whatever domain exists for `vm_id`.
    async fn teardown_domain(&self, vm_id: VmId) {
        let never = CancellationToken::new();
        let lookup = self
            .step(vm_id, "lookup", &never, self.deps.hypervisor.lookup_domain(vm_id))
            .await;
        match lookup {
            Ok(DomainLookup::Found(domain)) => {
                match self.step(vm_id, "destroy", &never, domain.destroy()).await {
                    Ok(()) => tracing::info!(%vm_id, "partial domain destroyed"),
                    Err(e) if e.is_domain_not_found() => {}
                    Err(e) => tracing::warn!(%vm_id, error = %e, "cannot destroy partial domain"),
                }
            }
            Ok(DomainLookup::NotFound) => {}
            Err(e) => tracing::warn!(%vm_id, error = %e, "cannot look up partial domain"),
        }
    }

    async fn console_port(&self, vm_id: VmId) -> Result<u16, VmError> {
        let never = CancellationToken::new();
        let DomainLookup::Found(domain) = self
            .step(vm_id, "lookup", &never, self.deps.hypervisor.lookup_domain(vm_id))
            .await?
        else {
            return Err(VmError::State {
                vm_id,
                reason: "no domain is running at the hypervisor".to_owned(),
            });
        };
        let xml = self
            .step(vm_id, "describe", &never, domain.describe(true))
            .await?;
        DomainDescriptor::parse(&xml)?.vnc_port()
    }

    /// Write the VM's runtime state into `descriptor`.
    ///
    /// The external port is allocated only after every other edit succeeded.
    async fn merge(&self, vm: &mut ServiceVm, descriptor: &mut DomainDescriptor) -> Result<(), VmError> {
        descriptor.set_disk_image(&vm.image.path, &vm.image.format)?;
        descriptor.set_uuid(&vm.id.to_string())?;
        descriptor.set_name(&vm.domain_name())?;

        if vm.network_mode == NetworkMode::Bridged && !has_bridged_interface(vm, descriptor) {
            let mac = descriptor.enable_bridged_on(&self.config.bridge_device)?;
            vm.mac_address = Some(mac);
        }
        if vm.remote_console {
            descriptor.enable_remote_vnc();
        }

        if vm.external_port().is_none() {
            let port = self.deps.ports.allocate().await?;
            if let Err(e) = vm.add_port_mapping(port, vm.service_port) {
                self.deps.ports.release(port).await;
                return Err(e.into());
            }
        }
        descriptor.set_port_redirection(vm.port_mappings());
        Ok(())
    }

    async fn render(&self, vm: &mut ServiceVm, template_xml: &str) -> Result<String, VmError> {
        let mut descriptor = DomainDescriptor::parse(template_xml)?;
        self.merge(vm, &mut descriptor).await?;
        descriptor.to_xml_string()
    }

    /// Restore `vm` to `before`, releasing an external port allocated since.
    async fn revert(&self, vm: &mut ServiceVm, before: ServiceVm) {
        if before.external_port().is_none() {
            if let Some(port) = vm.external_port() {
                tracing::debug!(vm_id = %vm.id, port, "releasing port of failed merge");
                self.deps.ports.release(port).await;
            }
        }
        *vm = before;
    }

    /// Fail if `vm` was destroyed, through this copy or any other.
    fn ensure_not_destroyed(&self, vm: &mut ServiceVm) -> Result<(), VmError> {
        vm.ensure_live()?;
        let destroyed = self
            .destroyed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&vm.id);
        if destroyed {
            vm.mark_destroyed();
            return Err(CoreError::Destroyed { vm_id: vm.id }.into());
        }
        Ok(())
    }

    /// Reject destroyed VMs and take `running` from the stored record.
    async fn sync_with_record(&self, vm: &mut ServiceVm) -> Result<(), VmError> {
        self.ensure_not_destroyed(vm)?;
        if let Some(stored) = self.deps.repository.find_by_id(vm.id).await? {
            if stored.is_running() != vm.is_running() {
                tracing::debug!(vm_id = %vm.id, running = stored.is_running(), "refreshing stale VM copy");
                vm.set_running(stored.is_running());
            }
        }
        Ok(())
    }

    /// Run one hypervisor step under the timeout and `cancel`.
    async fn step<T, F>(
        &self,
        vm_id: VmId,
        operation: &'static str,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<T, VmError>
    where
        F: Future<Output = Result<T, HypervisorError>>,
    {
        let after = self.config.operation_timeout;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(VmError::Cancelled { vm_id, operation }),
            result = tokio::time::timeout(after, call) => match result {
                Ok(result) => result.map_err(VmError::from),
                Err(_) => Err(VmError::Timeout { vm_id, operation, after }),
            },
        }
    }

    fn lock_for(&self, vm_id: VmId) -> VmLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(vm_id).or_default())
    }

    fn forget_lock(&self, vm_id: VmId) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&vm_id);
    }
}

/// Whether the descriptor already carries the VM's bridged interface, as a
/// saved state does after the first bridged boot.
fn has_bridged_interface(vm: &ServiceVm, descriptor: &DomainDescriptor) -> bool {
    let Some(known) = vm.mac_address.as_deref() else {
        return false;
    };
    descriptor
        .interfaces()
        .iter()
        .any(|(kind, mac)| kind == "bridge" && mac.as_deref() == Some(known))
}
