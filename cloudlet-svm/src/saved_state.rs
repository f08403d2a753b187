use std::path::Path;

use async_trait::async_trait;

use crate::HypervisorError;

/// Access to the domain description embedded in a saved-state file.
#[async_trait]
pub trait SavedStateStore: Send + Sync {
    /// Read the description stored in the saved-state file at `path`.
    async fn load(&self, path: &Path) -> Result<String, HypervisorError>;

    /// Replace the description stored in the saved-state file at `path`.
    async fn save(&self, path: &Path, xml: &str) -> Result<(), HypervisorError>;
}
