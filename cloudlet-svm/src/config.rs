//! Runtime configuration for the service VM layer.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::descriptor::DEFAULT_BRIDGE;
use crate::VmError;

/// Local session hypervisor.
pub const DEFAULT_HYPERVISOR_URI: &str = "qemu:///session";

/// Bandwidth requested for memory-state transfer when suspending, in MiB/s.
/// Large enough to be effectively unlimited.
pub const DEFAULT_MAX_TRANSFER_RATE: u64 = 1_000_000;

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Settings shared by every lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SvmConfig {
    /// Hypervisor connection URI.
    pub hypervisor_uri: String,

    /// Upper bound for any single hypervisor step.
    pub operation_timeout: Duration,

    /// Transfer rate requested before saving memory state, in MiB/s.
    pub max_transfer_rate: u64,

    /// Host bridge used when a VM runs in bridged mode.
    pub bridge_device: String,

    /// VNC viewer executable used for console sessions.
    pub vnc_viewer: PathBuf,
}

impl Default for SvmConfig {
    fn default() -> Self {
        Self {
            hypervisor_uri: DEFAULT_HYPERVISOR_URI.to_owned(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_transfer_rate: DEFAULT_MAX_TRANSFER_RATE,
            bridge_device: DEFAULT_BRIDGE.to_owned(),
            vnc_viewer: PathBuf::from("vncviewer"),
        }
    }
}

impl SvmConfig {
    /// Build a config from `CLOUDLET_*` environment variables, falling
    /// back to the defaults for unset ones.
    ///
    /// Recognised: `CLOUDLET_HYPERVISOR_URI`, `CLOUDLET_OPERATION_TIMEOUT_SECS`,
    /// `CLOUDLET_MAX_TRANSFER_RATE`, `CLOUDLET_BRIDGE`, `CLOUDLET_VNC_VIEWER`.
    ///
    /// # Errors
    /// Returns [`VmError::Configuration`] if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, VmError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, VmError> {
        let mut config = Self::default();
        if let Some(uri) = lookup("CLOUDLET_HYPERVISOR_URI") {
            config.hypervisor_uri = uri;
        }
        if let Some(secs) = lookup("CLOUDLET_OPERATION_TIMEOUT_SECS") {
            config.operation_timeout =
                Duration::from_secs(parse_var("CLOUDLET_OPERATION_TIMEOUT_SECS", &secs)?);
        }
        if let Some(rate) = lookup("CLOUDLET_MAX_TRANSFER_RATE") {
            config.max_transfer_rate = parse_var("CLOUDLET_MAX_TRANSFER_RATE", &rate)?;
        }
        if let Some(bridge) = lookup("CLOUDLET_BRIDGE") {
            config.bridge_device = bridge;
        }
        if let Some(viewer) = lookup("CLOUDLET_VNC_VIEWER") {
            config.vnc_viewer = PathBuf::from(viewer);
        }
        Ok(config)
    }

    /// Override the per-step timeout.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, VmError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| VmError::Configuration(format!("{key}={value:?}: {e}")))
}
