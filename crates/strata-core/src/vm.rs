//! Contract of a running utility VM, as seen by the layer mounter.

use std::path::Path;

use strata_common::error::HostResult;
use strata_common::types::{GuestOs, ScsiLocation};

use crate::schema::{ModifyRequest, ShareFlags};

/// Handle to a running utility VM.
///
/// Implementations must be safe to call from several threads at once:
/// containers sharing a VM mount and unmount concurrently. Read-only layer
/// attachments are reference-counted by the implementation; adding an
/// already-attached path takes another reference, and removing it only
/// detaches once the last reference is dropped.
pub trait UtilityVm: Send + Sync {
    /// Identifier of the VM, used when granting it access to host files.
    fn id(&self) -> &str;

    /// Operating system family running in the VM.
    fn guest_os(&self) -> GuestOs;

    /// Exposes a host folder to the guest as a share.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot add the share.
    fn add_shared_folder(
        &self,
        host_path: &Path,
        name: Option<&str>,
        flags: ShareFlags,
    ) -> HostResult<()>;

    /// Drops one reference to a shared folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the share is not attached or cannot be removed.
    fn remove_shared_folder(&self, host_path: &Path) -> HostResult<()>;

    /// Returns the guest path assigned to an attached shared folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder is not shared with the VM.
    fn shared_folder_guest_path(&self, host_path: &Path) -> HostResult<String>;

    /// Exposes a host file as a persistent-memory block device, returning
    /// its slot and the guest path it is mounted at.
    ///
    /// # Errors
    ///
    /// Returns an error if no slot is free or the host rejects the device.
    fn add_memory_mapped_device(
        &self,
        host_path: &Path,
        read_only: bool,
    ) -> HostResult<(u32, String)>;

    /// Drops one reference to a memory-mapped device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is not attached or cannot be removed.
    fn remove_memory_mapped_device(&self, host_path: &Path) -> HostResult<()>;

    /// Attaches a virtual disk to the next free block-storage slot and asks
    /// the guest to mount it at `guest_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if no slot is free or the host rejects the disk.
    fn add_block_device(&self, host_path: &Path, guest_path: &str) -> HostResult<ScsiLocation>;

    /// Detaches a virtual disk from block storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the disk is not attached or cannot be removed.
    fn remove_block_device(&self, host_path: &Path) -> HostResult<()>;

    /// Applies a modify request to the running VM.
    ///
    /// # Errors
    ///
    /// Returns an error if the host or guest rejects the request.
    fn modify(&self, request: &ModifyRequest) -> HostResult<()>;
}
