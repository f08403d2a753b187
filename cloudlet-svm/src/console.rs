//! VNC console sessions.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::SvmConfig;

/// Opens a console session to a VM's VNC server.
#[async_trait]
pub trait VncClient: Send + Sync {
    /// Connect to the VNC server on local `port`.
    ///
    /// With `wait`, returns once the session ends. Returns `false` if the
    /// session could not be opened or ended abnormally.
    async fn connect(&self, port: u16, wait: bool) -> bool;
}

/// Launches an external viewer as `<viewer> 127.0.0.1::<port>`.
#[derive(Debug, Clone)]
pub struct ViewerVncClient {
    viewer: PathBuf,
}

impl ViewerVncClient {
    pub fn new(viewer: impl Into<PathBuf>) -> Self {
        Self {
            viewer: viewer.into(),
        }
    }

    /// Use the viewer named in [`SvmConfig::vnc_viewer`].
    #[must_use]
    pub fn from_config(config: &SvmConfig) -> Self {
        Self::new(config.vnc_viewer.clone())
    }

    fn target(port: u16) -> String {
        format!("127.0.0.1::{port}")
    }
}

#[async_trait]
impl VncClient for ViewerVncClient {
    async fn connect(&self, port: u16, wait: bool) -> bool {
        let mut child = match Command::new(&self.viewer).arg(Self::target(port)).spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(viewer = %self.viewer.display(), port, error = %e, "cannot launch VNC viewer");
                return false;
            }
        };

        if !wait {
            tokio::spawn(async move {
                if let Err(e) = child.wait().await {
                    tracing::debug!(error = %e, "VNC viewer exited abnormally");
                }
            });
            return true;
        }

        match child.wait().await {
            Ok(status) if status.success() => true,
            Ok(status) => {
                tracing::warn!(port, %status, "VNC viewer failed");
                false
            }
            Err(e) => {
                tracing::warn!(port, error = %e, "VNC viewer could not be awaited");
                false
            }
        }
    }
}
