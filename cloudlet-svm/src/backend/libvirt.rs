//! libvirt implementation of [`Hypervisor`] and [`SavedStateStore`].
//!
//! Every libvirt call blocks, so each one runs on the blocking pool with the
//! shared connection handle. Domains are re-resolved by UUID per call so a
//! handle never outlives the domain it points at.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cloudlet_core::VmId;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::ErrorNumber;

use crate::hypervisor::{DomainControl, DomainLookup, Hypervisor};
use crate::saved_state::SavedStateStore;
use crate::{HypervisorError, SvmConfig};

/// Flag for `virDomainRestoreFlags`: leave the restored domain running.
const RESTORE_RUNNING: u32 = virt::sys::VIR_DOMAIN_SAVE_RUNNING;

type SharedConnect = Arc<Mutex<Option<Connect>>>;

/// A libvirt connection.
#[derive(Clone)]
pub struct LibvirtHypervisor {
    uri: String,
    conn: SharedConnect,
}

impl std::fmt::Debug for LibvirtHypervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibvirtHypervisor").field("uri", &self.uri).finish_non_exhaustive()
    }
}

impl LibvirtHypervisor {
    /// Connect to the hypervisor at `uri`, e.g. `qemu:///session`.
    ///
    /// # Errors
    /// Returns [`HypervisorError::ConnectionFailed`] if libvirt refuses the
    /// connection.
    pub async fn open(uri: &str) -> Result<Self, HypervisorError> {
        let owned = uri.to_owned();
        let conn = tokio::task::spawn_blocking(move || {
            // libvirt otherwise prints every error to stderr.
            virt::error::clear_error_callback();
            Connect::open(Some(owned.as_str()))
        })
        .await
        .map_err(|e| HypervisorError::ConnectionFailed {
            uri: uri.to_owned(),
            reason: e.to_string(),
        })?
        .map_err(|e| HypervisorError::ConnectionFailed {
            uri: uri.to_owned(),
            reason: e.to_string(),
        })?;

        tracing::info!(uri, "connected to hypervisor");
        Ok(Self {
            uri: uri.to_owned(),
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Connect to [`SvmConfig::hypervisor_uri`].
    ///
    /// # Errors
    /// See [`LibvirtHypervisor::open`].
    pub async fn from_config(config: &SvmConfig) -> Result<Self, HypervisorError> {
        Self::open(&config.hypervisor_uri).await
    }

    /// Saved-state access sharing this connection.
    #[must_use]
    pub fn saved_state(&self) -> LibvirtSavedState {
        LibvirtSavedState {
            conn: Arc::clone(&self.conn),
        }
    }
}

/// Saved-state files read and rewritten through libvirt.
#[derive(Clone)]
pub struct LibvirtSavedState {
    conn: SharedConnect,
}

impl std::fmt::Debug for LibvirtSavedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibvirtSavedState").finish_non_exhaustive()
    }
}

/// A domain addressed by UUID.
pub struct LibvirtDomain {
    uuid: String,
    conn: SharedConnect,
}

async fn blocking<T, F>(conn: &SharedConnect, operation: &'static str, f: F) -> Result<T, HypervisorError>
where
    T: Send + 'static,
    F: FnOnce(&Connect) -> Result<T, HypervisorError> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let guard = conn.lock().map_err(|_| HypervisorError::Call {
            operation,
            reason: "connection lock poisoned".to_owned(),
        })?;
        let conn = guard.as_ref().ok_or(HypervisorError::Closed)?;
        f(conn)
    })
    .await
    .map_err(|e| HypervisorError::Call {
        operation,
        reason: e.to_string(),
    })?
}

fn call_error(operation: &'static str) -> impl Fn(virt::error::Error) -> HypervisorError {
    move |e| {
        if matches!(e.code(), ErrorNumber::NoDomain) {
            HypervisorError::DomainNotFound(e.to_string())
        } else {
            HypervisorError::Call {
                operation,
                reason: e.to_string(),
            }
        }
    }
}

fn path_str(operation: &'static str, path: &Path) -> Result<String, HypervisorError> {
    path.to_str().map(str::to_owned).ok_or_else(|| HypervisorError::Call {
        operation,
        reason: format!("path is not UTF-8: {}", path.display()),
    })
}

#[async_trait]
impl Hypervisor for LibvirtHypervisor {
    async fn create_domain(&self, xml: &str) -> Result<(), HypervisorError> {
        let xml = xml.to_owned();
        blocking(&self.conn, "create domain", move |conn| {
            Domain::create_xml(conn, &xml, 0)
                .map(drop)
                .map_err(call_error("create domain"))
        })
        .await
    }

    async fn restore_domain(&self, saved_state: &Path, xml: &str) -> Result<(), HypervisorError> {
        let path = path_str("restore domain", saved_state)?;
        let xml = xml.to_owned();
        blocking(&self.conn, "restore domain", move |conn| {
            Domain::restore_flags(conn, &path, Some(xml.as_str()), RESTORE_RUNNING)
                .map(drop)
                .map_err(call_error("restore domain"))
        })
        .await
    }

    async fn lookup_domain(&self, id: VmId) -> Result<DomainLookup, HypervisorError> {
        let uuid = id.to_string();
        let found = {
            let uuid = uuid.clone();
            blocking(&self.conn, "lookup domain", move |conn| {
                match Domain::lookup_by_uuid_string(conn, &uuid) {
                    Ok(_) => Ok(true),
                    Err(e) if matches!(e.code(), ErrorNumber::NoDomain) => Ok(false),
                    Err(e) => Err(call_error("lookup domain")(e)),
                }
            })
            .await?
        };
        if !found {
            return Ok(DomainLookup::NotFound);
        }
        Ok(DomainLookup::Found(Box::new(LibvirtDomain {
            uuid,
            conn: Arc::clone(&self.conn),
        })))
    }

    async fn close(&self) -> Result<(), HypervisorError> {
        let conn = Arc::clone(&self.conn);
        let uri = self.uri.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| HypervisorError::Call {
                operation: "close connection",
                reason: "connection lock poisoned".to_owned(),
            })?;
            if let Some(mut conn) = guard.take() {
                conn.close().map_err(call_error("close connection"))?;
                tracing::info!(%uri, "hypervisor connection closed");
            }
            Ok(())
        })
        .await
        .map_err(|e| HypervisorError::Call {
            operation: "close connection",
            reason: e.to_string(),
        })?
    }
}

impl LibvirtDomain {
    async fn with_domain<T, F>(&self, operation: &'static str, f: F) -> Result<T, HypervisorError>
    where
        T: Send + 'static,
        F: FnOnce(&Domain) -> Result<T, virt::error::Error> + Send + 'static,
    {
        let uuid = self.uuid.clone();
        blocking(&self.conn, operation, move |conn| {
            let domain = Domain::lookup_by_uuid_string(conn, &uuid).map_err(call_error(operation))?;
            f(&domain).map_err(call_error(operation))
        })
        .await
    }
}

#[async_trait]
impl DomainControl for LibvirtDomain {
    async fn set_max_transfer_rate(&self, mib_per_sec: u64) -> Result<(), HypervisorError> {
        self.with_domain("set migration speed", move |d| {
            d.migrate_set_max_speed(mib_per_sec, 0).map(drop)
        })
        .await
    }

    async fn suspend(&self) -> Result<(), HypervisorError> {
        self.with_domain("suspend domain", |d| d.suspend().map(drop)).await
    }

    async fn save_to_file(&self, path: &Path) -> Result<(), HypervisorError> {
        let path = path_str("save domain", path)?;
        self.with_domain("save domain", move |d| d.save(&path).map(drop))
            .await
    }

    async fn destroy(&self) -> Result<(), HypervisorError> {
        self.with_domain("destroy domain", |d| d.destroy().map(drop)).await
    }

    async fn describe(&self, secure: bool) -> Result<String, HypervisorError> {
        let flags = if secure {
            virt::sys::VIR_DOMAIN_XML_SECURE
        } else {
            0
        };
        self.with_domain("describe domain", move |d| d.get_xml_desc(flags))
            .await
    }
}

#[async_trait]
impl SavedStateStore for LibvirtSavedState {
    async fn load(&self, path: &Path) -> Result<String, HypervisorError> {
        let path = path_str("read saved state", path)?;
        blocking(&self.conn, "read saved state", move |conn| {
            conn.save_image_get_xml_desc(&path, virt::sys::VIR_DOMAIN_XML_SECURE)
                .map_err(call_error("read saved state"))
        })
        .await
    }

    async fn save(&self, path: &Path, xml: &str) -> Result<(), HypervisorError> {
        let path = path_str("rewrite saved state", path)?;
        let xml = xml.to_owned();
        blocking(&self.conn, "rewrite saved state", move |conn| {
            conn.save_image_define_xml(&path, &xml, 0)
                .map(drop)
                .map_err(call_error("rewrite saved state"))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires a running libvirtd with qemu:///session"]
    async fn unknown_domain_is_not_found() {
        let hypervisor = match LibvirtHypervisor::open("qemu:///session").await {
            Ok(h) => h,
            Err(e) => panic!("open: {e}"),
        };
        let lookup = hypervisor.lookup_domain(VmId::new()).await;
        assert!(matches!(lookup, Ok(DomainLookup::NotFound)), "got {lookup:?}");
        assert!(hypervisor.close().await.is_ok());
        assert!(matches!(
            hypervisor.lookup_domain(VmId::new()).await,
            Err(HypervisorError::Closed)
        ));
    }

    #[tokio::test]
    #[ignore = "requires a running libvirtd"]
    async fn bad_uri_fails_to_connect() {
        let result = LibvirtHypervisor::open("bogus:///nowhere").await;
        assert!(matches!(result, Err(HypervisorError::ConnectionFailed { .. })));
    }
}
