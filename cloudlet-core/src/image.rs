//! Disk image owned by a service VM.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Disk format written into the descriptor when none is given.
pub const DEFAULT_DISK_FORMAT: &str = "qcow2";

/// A VM disk plus the file its suspended memory state is saved to.
///
/// A cloned image is a disposable copy: it is never snapshotted and its
/// files are deleted on cleanup. An original image is kept, and is only
/// write-protected while no hypervisor is using it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct DiskImage {
    /// Path to the disk image file.
    pub path: PathBuf,
    /// Image format, e.g. `qcow2`.
    pub format: String,
    /// Whether this is a disposable clone.
    pub cloned: bool,
    /// Path to the saved-state (snapshot) file.
    pub state_image_path: PathBuf,
    /// Whether the read-only guard is currently applied.
    pub protected: bool,
}

impl DiskImage {
    /// Create an original (non-cloned) image in the default format.
    pub fn new(path: impl Into<PathBuf>, state_image_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: DEFAULT_DISK_FORMAT.to_owned(),
            cloned: false,
            state_image_path: state_image_path.into(),
            protected: false,
        }
    }

    /// Mark this image as a disposable clone.
    #[must_use]
    pub fn into_clone(mut self) -> Self {
        self.cloned = true;
        self
    }

    /// Override the image format.
    #[must_use]
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    /// Make the disk and any saved state read-only.
    ///
    /// # Errors
    /// Returns [`CoreError::DiskImageMissing`] if the disk file is gone, or
    /// [`CoreError::Permission`] if the permissions cannot be changed.
    pub fn protect(&mut self) -> Result<(), CoreError> {
        self.set_guard(true)?;
        self.protected = true;
        tracing::debug!(path = %self.path.display(), "disk image protected");
        Ok(())
    }

    /// Lift the read-only guard so the hypervisor can write the image.
    ///
    /// # Errors
    /// Same as [`DiskImage::protect`].
    pub fn unprotect(&mut self) -> Result<(), CoreError> {
        self.set_guard(false)?;
        self.protected = false;
        tracing::debug!(path = %self.path.display(), "disk image unprotected");
        Ok(())
    }

    /// Release the image once its VM is gone.
    ///
    /// Clones are deleted together with their saved state. Originals are
    /// unprotected and left in place.
    ///
    /// # Errors
    /// Returns [`CoreError::Permission`] if a file cannot be removed, or the
    /// errors of [`DiskImage::unprotect`] for originals.
    pub fn cleanup(&mut self) -> Result<(), CoreError> {
        if !self.cloned {
            return self.unprotect();
        }
        for path in [&self.path, &self.state_image_path] {
            match fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed cloned image file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(CoreError::Permission {
                        path: path.clone(),
                        source,
                    })
                }
            }
        }
        self.protected = false;
        Ok(())
    }

    fn set_guard(&self, read_only: bool) -> Result<(), CoreError> {
        if !self.path.exists() {
            return Err(CoreError::DiskImageMissing {
                path: self.path.clone(),
            });
        }
        set_read_only(&self.path, read_only)?;
        // The state file only exists once the VM has been suspended.
        if self.state_image_path.exists() {
            set_read_only(&self.state_image_path, read_only)?;
        }
        Ok(())
    }
}

fn set_read_only(path: &Path, read_only: bool) -> Result<(), CoreError> {
    let to_err = |source| CoreError::Permission {
        path: path.to_owned(),
        source,
    };
    let mut perms = fs::metadata(path).map_err(to_err)?.permissions();
    apply_guard(&mut perms, read_only);
    fs::set_permissions(path, perms).map_err(to_err)
}

#[cfg(unix)]
fn apply_guard(perms: &mut fs::Permissions, read_only: bool) {
    use std::os::unix::fs::PermissionsExt;

    let mode = perms.mode();
    let mode = if read_only { mode & !0o222 } else { mode | 0o200 };
    perms.set_mode(mode);
}

#[cfg(not(unix))]
#[allow(clippy::permissions_set_readonly_false)]
fn apply_guard(perms: &mut fs::Permissions, read_only: bool) {
    perms.set_readonly(read_only);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_in(dir: &Path) -> DiskImage {
        let disk = dir.join("disk.qcow2");
        fs::write(&disk, b"disk").unwrap_or_else(|e| panic!("write disk: {e}"));
        DiskImage::new(disk, dir.join("disk.lqs"))
    }

    fn is_read_only(path: &Path) -> bool {
        match fs::metadata(path) {
            Ok(m) => m.permissions().readonly(),
            Err(e) => panic!("metadata for {}: {e}", path.display()),
        }
    }

    #[test]
    fn new_image_defaults_to_qcow2_original() {
        let image = DiskImage::new("/vm/disk.qcow2", "/vm/disk.lqs");
        assert_eq!(image.format, "qcow2");
        assert!(!image.cloned);
        assert!(!image.protected);
        assert!(image.into_clone().cloned);
    }

    #[test]
    fn protect_then_unprotect_toggles_read_only() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let mut image = image_in(dir.path());
        fs::write(&image.state_image_path, b"state").unwrap_or_else(|e| panic!("write: {e}"));

        image.protect().unwrap_or_else(|e| panic!("protect: {e}"));
        assert!(image.protected);
        assert!(is_read_only(&image.path));
        assert!(is_read_only(&image.state_image_path));

        image.unprotect().unwrap_or_else(|e| panic!("unprotect: {e}"));
        assert!(!image.protected);
        assert!(!is_read_only(&image.path));
        assert!(!is_read_only(&image.state_image_path));
    }

    #[test]
    fn protect_missing_disk_is_resource_error() {
        let mut image = DiskImage::new("/nonexistent/disk.qcow2", "/nonexistent/disk.lqs");
        assert!(matches!(
            image.protect(),
            Err(CoreError::DiskImageMissing { .. })
        ));
    }

    #[test]
    fn cleanup_deletes_clone_files() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let mut image = image_in(dir.path()).into_clone();
        fs::write(&image.state_image_path, b"state").unwrap_or_else(|e| panic!("write: {e}"));

        image.cleanup().unwrap_or_else(|e| panic!("cleanup: {e}"));
        assert!(!image.path.exists());
        assert!(!image.state_image_path.exists());
    }

    #[test]
    fn cleanup_keeps_original_and_unprotects_it() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let mut image = image_in(dir.path());
        image.protect().unwrap_or_else(|e| panic!("protect: {e}"));

        image.cleanup().unwrap_or_else(|e| panic!("cleanup: {e}"));
        assert!(image.path.exists(), "original disk must be retained");
        assert!(!is_read_only(&image.path));
    }
}
