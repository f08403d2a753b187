//! In-process fakes for the lifecycle collaborators.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cloudlet_core::{DiskImage, ServiceId, ServiceVm, VmId};
use cloudlet_svm::{
    Collaborators, DomainControl, DomainDescriptor, DomainLookup, Hypervisor, HypervisorError,
    InMemoryRepository, PortAllocator, SavedStateStore, SvmConfig, VmController, VmError,
    VncClient,
};

pub const TEMPLATE: &str = r#"<domain type='kvm' xmlns:qemu='http://libvirt.org/schemas/domain/qemu/1.0'>
  <name>template</name>
  <uuid>00000000-0000-0000-0000-000000000000</uuid>
  <memory unit='KiB'>524288</memory>
  <devices>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='/isos/boot.iso'/>
      <target dev='hdc' bus='ide'/>
    </disk>
    <disk type='file' device='disk'>
      <driver name='qemu' type='raw'/>
      <source file='/images/template.img'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='user'>
      <model type='virtio'/>
    </interface>
    <graphics type='vnc' port='5901' autoport='no' listen='127.0.0.1'>
      <listen type='address' address='127.0.0.1'/>
    </graphics>
  </devices>
  <qemu:commandline>
    <qemu:arg value='-usb'/>
    <qemu:arg value='-redir'/>
    <qemu:arg value='tcp:2222::22'/>
    <qemu:arg value='-no-hpet'/>
  </qemu:commandline>
</domain>"#;

pub const SERVICE_PORT: u16 = 80;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn uuid_of(xml: &str) -> Result<VmId, HypervisorError> {
    let call = |reason: String| HypervisorError::Call {
        operation: "parse",
        reason,
    };
    let descriptor = DomainDescriptor::parse(xml).map_err(|e| call(e.to_string()))?;
    let uuid = descriptor.uuid().map_err(|e| call(e.to_string()))?;
    uuid.parse::<uuid::Uuid>()
        .map(VmId::from)
        .map_err(|e| call(e.to_string()))
}

/// Saved-state files kept in memory, keyed by path.
#[derive(Default)]
pub struct FakeSavedState {
    pub files: Mutex<HashMap<PathBuf, String>>,
}

impl FakeSavedState {
    pub fn get(&self, path: &Path) -> Option<String> {
        lock(&self.files).get(path).cloned()
    }
}

#[async_trait]
impl SavedStateStore for FakeSavedState {
    async fn load(&self, path: &Path) -> Result<String, HypervisorError> {
        self.get(path).ok_or_else(|| HypervisorError::Call {
            operation: "read saved state",
            reason: format!("no saved state at {}", path.display()),
        })
    }

    async fn save(&self, path: &Path, xml: &str) -> Result<(), HypervisorError> {
        lock(&self.files).insert(path.to_owned(), xml.to_owned());
        Ok(())
    }
}

/// Knobs and call records shared between the hypervisor and its domains.
#[derive(Default)]
pub struct FakeState {
    pub live: Mutex<HashMap<VmId, String>>,
    pub created: Mutex<Vec<String>>,
    pub restored: Mutex<Vec<(PathBuf, String)>>,
    pub events: Mutex<Vec<String>>,
    pub transfer_rates: Mutex<Vec<u64>>,
    pub destroy_calls: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_restore: AtomicBool,
    pub fail_save: AtomicBool,
    pub vanish_before_destroy: AtomicBool,
    pub create_delay: Mutex<Option<Duration>>,
    pub restore_delay: Mutex<Option<Duration>>,
}

pub struct FakeHypervisor {
    pub state: Arc<FakeState>,
    pub saved_state: Arc<FakeSavedState>,
    pub closed: AtomicBool,
}

impl FakeHypervisor {
    pub fn new(saved_state: Arc<FakeSavedState>) -> Self {
        Self {
            state: Arc::new(FakeState::default()),
            saved_state,
            closed: AtomicBool::new(false),
        }
    }

    pub fn destroy_calls(&self) -> usize {
        self.state.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<String> {
        lock(&self.state.created).clone()
    }

    pub fn restored(&self) -> Vec<(PathBuf, String)> {
        lock(&self.state.restored).clone()
    }

    pub fn is_live(&self, id: VmId) -> bool {
        lock(&self.state.live).contains_key(&id)
    }

    pub fn kill(&self, id: VmId) {
        lock(&self.state.live).remove(&id);
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.state.events).clone()
    }

    pub fn transfer_rates(&self) -> Vec<u64> {
        lock(&self.state.transfer_rates).clone()
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *lock(&self.state.create_delay) = Some(delay);
    }

    pub fn set_restore_delay(&self, delay: Duration) {
        *lock(&self.state.restore_delay) = Some(delay);
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn create_domain(&self, xml: &str) -> Result<(), HypervisorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HypervisorError::Closed);
        }
        let id = uuid_of(xml)?;
        lock(&self.state.created).push(xml.to_owned());
        if self.state.fail_create.load(Ordering::SeqCst) {
            return Err(HypervisorError::Call {
                operation: "create domain",
                reason: "injected failure".to_owned(),
            });
        }
        // The domain exists before create returns, as with a slow boot.
        lock(&self.state.live).insert(id, xml.to_owned());
        let delay = *lock(&self.state.create_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn restore_domain(&self, saved_state: &Path, xml: &str) -> Result<(), HypervisorError> {
        lock(&self.state.restored).push((saved_state.to_owned(), xml.to_owned()));
        if self.state.fail_restore.load(Ordering::SeqCst) {
            return Err(HypervisorError::Call {
                operation: "restore domain",
                reason: "corrupt saved state".to_owned(),
            });
        }
        let id = uuid_of(xml)?;
        lock(&self.state.live).insert(id, xml.to_owned());
        let delay = *lock(&self.state.restore_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn lookup_domain(&self, id: VmId) -> Result<DomainLookup, HypervisorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HypervisorError::Closed);
        }
        if !self.is_live(id) {
            return Ok(DomainLookup::NotFound);
        }
        Ok(DomainLookup::Found(Box::new(FakeDomain {
            id,
            state: Arc::clone(&self.state),
            saved_state: Arc::clone(&self.saved_state),
        })))
    }

    async fn close(&self) -> Result<(), HypervisorError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeDomain {
    id: VmId,
    state: Arc<FakeState>,
    saved_state: Arc<FakeSavedState>,
}

impl FakeDomain {
    fn record(&self, event: &str) {
        lock(&self.state.events).push(event.to_owned());
    }
}

#[async_trait]
impl DomainControl for FakeDomain {
    async fn set_max_transfer_rate(&self, mib_per_sec: u64) -> Result<(), HypervisorError> {
        lock(&self.state.transfer_rates).push(mib_per_sec);
        self.record("set_max_transfer_rate");
        Ok(())
    }

    async fn suspend(&self) -> Result<(), HypervisorError> {
        self.record("suspend");
        Ok(())
    }

    async fn save_to_file(&self, path: &Path) -> Result<(), HypervisorError> {
        self.record("save");
        if self.state.fail_save.load(Ordering::SeqCst) {
            return Err(HypervisorError::Call {
                operation: "save domain",
                reason: "disk full".to_owned(),
            });
        }
        let xml = lock(&self.state.live).get(&self.id).cloned().unwrap_or_default();
        tokio::fs::write(path, b"memory").await.map_err(|e| HypervisorError::Call {
            operation: "save domain",
            reason: e.to_string(),
        })?;
        lock(&self.saved_state.files).insert(path.to_owned(), xml);
        Ok(())
    }

    async fn destroy(&self) -> Result<(), HypervisorError> {
        self.state.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.record("destroy");
        let removed = lock(&self.state.live).remove(&self.id);
        if self.state.vanish_before_destroy.load(Ordering::SeqCst) || removed.is_none() {
            return Err(HypervisorError::DomainNotFound(self.id.to_string()));
        }
        Ok(())
    }

    async fn describe(&self, _secure: bool) -> Result<String, HypervisorError> {
        lock(&self.state.live)
            .get(&self.id)
            .cloned()
            .ok_or_else(|| HypervisorError::DomainNotFound(self.id.to_string()))
    }
}

/// Hands out ports counting up from 40000.
pub struct SequentialPorts {
    next: AtomicU16,
    pub released: Mutex<Vec<u16>>,
}

impl Default for SequentialPorts {
    fn default() -> Self {
        Self {
            next: AtomicU16::new(40_000),
            released: Mutex::new(Vec::new()),
        }
    }
}

impl SequentialPorts {
    pub fn released(&self) -> Vec<u16> {
        lock(&self.released).clone()
    }
}

#[async_trait]
impl PortAllocator for SequentialPorts {
    async fn allocate(&self) -> Result<u16, VmError> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }

    async fn release(&self, port: u16) {
        lock(&self.released).push(port);
    }
}

pub struct FakeVnc {
    pub succeed: bool,
    pub sessions: Mutex<Vec<(u16, bool)>>,
}

impl FakeVnc {
    pub fn new(succeed: bool) -> Self {
        Self {
            succeed,
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn sessions(&self) -> Vec<(u16, bool)> {
        lock(&self.sessions).clone()
    }
}

#[async_trait]
impl VncClient for FakeVnc {
    async fn connect(&self, port: u16, wait: bool) -> bool {
        lock(&self.sessions).push((port, wait));
        self.succeed
    }
}

pub struct Harness {
    pub controller: VmController,
    pub hypervisor: Arc<FakeHypervisor>,
    pub saved_state: Arc<FakeSavedState>,
    pub ports: Arc<SequentialPorts>,
    pub vnc: Arc<FakeVnc>,
    pub repository: Arc<InMemoryRepository>,
    pub template: PathBuf,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(SvmConfig::default(), true)
    }

    pub fn with_config(config: SvmConfig) -> Self {
        Self::build(config, true)
    }

    pub fn with_failing_console() -> Self {
        Self::build(SvmConfig::default(), false)
    }

    fn build(config: SvmConfig, console_ok: bool) -> Self {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let template = dir.path().join("template.xml");
        std::fs::write(&template, TEMPLATE).unwrap_or_else(|e| panic!("write template: {e}"));

        let saved_state = Arc::new(FakeSavedState::default());
        let hypervisor = Arc::new(FakeHypervisor::new(Arc::clone(&saved_state)));
        let ports = Arc::new(SequentialPorts::default());
        let vnc = Arc::new(FakeVnc::new(console_ok));
        let repository = Arc::new(InMemoryRepository::new());

        let deps = Collaborators {
            hypervisor: hypervisor.clone(),
            saved_state: saved_state.clone(),
            ports: ports.clone(),
            console: vnc.clone(),
            repository: repository.clone(),
        };
        Self {
            controller: VmController::new(deps, config),
            hypervisor,
            saved_state,
            ports,
            vnc,
            repository,
            template,
            dir,
        }
    }

    /// A stopped VM whose disk file exists in the harness directory.
    pub fn vm(&self) -> ServiceVm {
        self.vm_named("disk")
    }

    pub fn vm_named(&self, stem: &str) -> ServiceVm {
        let disk = self.dir.path().join(format!("{stem}.qcow2"));
        std::fs::write(&disk, b"disk").unwrap_or_else(|e| panic!("write disk: {e}"));
        let image = DiskImage::new(disk, self.dir.path().join(format!("{stem}.lqs")));
        ServiceVm::new(ServiceId::new("face-recognition"), image, SERVICE_PORT)
    }

    pub fn write_template(&self, name: &str, xml: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, xml).unwrap_or_else(|e| panic!("write template: {e}"));
        path
    }
}

pub fn parse(xml: &str) -> DomainDescriptor {
    DomainDescriptor::parse(xml).unwrap_or_else(|e| panic!("descriptor must parse: {e}\n{xml}"))
}
