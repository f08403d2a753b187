//! Host port allocation for NAT redirections.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::VmError;

const DEFAULT_MAX_ATTEMPTS: u32 = 64;

/// Supplies host ports that are free for forwarding.
#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// Reserve a port that is unused on the host and not held by any other VM.
    ///
    /// # Errors
    /// Returns [`VmError::PortsExhausted`] if no free port was found.
    async fn allocate(&self) -> Result<u16, VmError>;

    /// Return a port to the pool.
    async fn release(&self, port: u16);
}

/// Finds free ports by binding an ephemeral loopback socket.
///
/// Issued ports are remembered until released, so two VMs never receive the
/// same port even if neither has bound it yet.
#[derive(Debug)]
pub struct LocalPortAllocator {
    issued: Mutex<BTreeSet<u16>>,
    max_attempts: u32,
}

impl Default for LocalPortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalPortAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            issued: Mutex::new(BTreeSet::new()),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Ports currently issued and not yet released.
    pub async fn issued(&self) -> Vec<u16> {
        self.issued.lock().await.iter().copied().collect()
    }
}

#[async_trait]
impl PortAllocator for LocalPortAllocator {
    async fn allocate(&self) -> Result<u16, VmError> {
        let mut issued = self.issued.lock().await;
        for _ in 0..self.max_attempts {
            let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
            let port = listener.local_addr()?.port();
            drop(listener);
            if issued.insert(port) {
                tracing::debug!(port, "host port allocated");
                return Ok(port);
            }
        }
        Err(VmError::PortsExhausted {
            attempts: self.max_attempts,
        })
    }

    async fn release(&self, port: u16) {
        if self.issued.lock().await.remove(&port) {
            tracing::debug!(port, "host port released");
        }
    }
}
