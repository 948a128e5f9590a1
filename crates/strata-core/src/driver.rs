//! Contract of the host layer driver.
//!
//! The driver mounts a layer stack directly on the host when no VM is
//! involved, and grants VMs access to host disk files.

use std::path::{Path, PathBuf};

use strata_common::error::HostResult;
use uuid::Uuid;

/// Host-side layer activation and preparation.
pub trait HostLayerDriver: Send + Sync {
    /// Activates the layer at `path`, making its storage available.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer cannot be activated.
    fn activate(&self, path: &Path) -> HostResult<()>;

    /// Reverses [`activate`](Self::activate).
    ///
    /// # Errors
    ///
    /// Returns an error if the layer cannot be deactivated.
    fn deactivate(&self, path: &Path) -> HostResult<()>;

    /// Links the read-only `parents` (base first) beneath the activated
    /// layer at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the layers cannot be composed.
    fn prepare(&self, path: &Path, parents: &[PathBuf]) -> HostResult<()>;

    /// Reverses [`prepare`](Self::prepare).
    ///
    /// # Errors
    ///
    /// Returns an error if the composition cannot be removed.
    fn unprepare(&self, path: &Path) -> HostResult<()>;

    /// Returns the host path where the prepared layer is mounted.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer is not mounted.
    fn mount_path(&self, path: &Path) -> HostResult<PathBuf>;

    /// Grants the VM identified by `vm_id` access to the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file's access control cannot be changed.
    fn grant_vm_access(&self, vm_id: &str, path: &Path) -> HostResult<()>;

    /// Derives the stable identifier of the layer stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if no identifier can be derived from the path.
    fn layer_id(&self, path: &Path) -> HostResult<Uuid> {
        crate::layer_id::layer_id(path)
    }
}
