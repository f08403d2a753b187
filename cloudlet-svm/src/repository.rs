//! Persistence of [`ServiceVm`] records.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cloudlet_core::{ServiceId, ServiceVm, VmId};
use tokio::sync::RwLock;

use crate::VmError;

/// Store of VM records.
#[async_trait]
pub trait VmRepository: Send + Sync {
    async fn find_by_id(&self, id: VmId) -> Result<Option<ServiceVm>, VmError>;

    async fn find_by_service_id(&self, service_id: &ServiceId) -> Result<Vec<ServiceVm>, VmError>;

    /// Insert or replace the record with the same id.
    async fn save(&self, vm: &ServiceVm) -> Result<(), VmError>;

    /// Remove the record and return it, if it existed.
    async fn find_and_remove_by_id(&self, id: VmId) -> Result<Option<ServiceVm>, VmError>;
}

/// Records held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    records: RwLock<HashMap<VmId, ServiceVm>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl VmRepository for InMemoryRepository {
    async fn find_by_id(&self, id: VmId) -> Result<Option<ServiceVm>, VmError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn find_by_service_id(&self, service_id: &ServiceId) -> Result<Vec<ServiceVm>, VmError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|vm| &vm.service_id == service_id)
            .cloned()
            .collect())
    }

    async fn save(&self, vm: &ServiceVm) -> Result<(), VmError> {
        self.records.write().await.insert(vm.id, vm.clone());
        Ok(())
    }

    async fn find_and_remove_by_id(&self, id: VmId) -> Result<Option<ServiceVm>, VmError> {
        Ok(self.records.write().await.remove(&id))
    }
}

/// One `<id>.json` file per record under a directory.
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    dir: PathBuf,
}

impl JsonFileRepository {
    /// Use `dir`, creating it if needed.
    ///
    /// # Errors
    /// Returns [`VmError::Io`] if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, VmError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn record_path(&self, id: VmId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn read_record(path: &Path) -> Result<Option<ServiceVm>, VmError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| VmError::Repository(format!("corrupt record {}: {e}", path.display())))
    }
}

#[async_trait]
impl VmRepository for JsonFileRepository {
    async fn find_by_id(&self, id: VmId) -> Result<Option<ServiceVm>, VmError> {
        Self::read_record(&self.record_path(id)).await
    }

    async fn find_by_service_id(&self, service_id: &ServiceId) -> Result<Vec<ServiceVm>, VmError> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(vm) = Self::read_record(&path).await? {
                if &vm.service_id == service_id {
                    found.push(vm);
                }
            }
        }
        found.sort_by_key(|vm| vm.created_at);
        Ok(found)
    }

    async fn save(&self, vm: &ServiceVm) -> Result<(), VmError> {
        let json = serde_json::to_vec_pretty(vm)
            .map_err(|e| VmError::Repository(format!("cannot encode record {}: {e}", vm.id)))?;
        let path = self.record_path(vm.id);
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, json).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn find_and_remove_by_id(&self, id: VmId) -> Result<Option<ServiceVm>, VmError> {
        let path = self.record_path(id);
        let Some(vm) = Self::read_record(&path).await? else {
            return Ok(None);
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(Some(vm)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
