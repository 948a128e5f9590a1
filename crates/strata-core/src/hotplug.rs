//! Reference-counting [`UtilityVm`] adapter over a raw device host.
//!
//! A [`DeviceHost`] performs single hot-add and hot-remove operations and
//! knows nothing about sharing. [`SharedUtilityVm`] puts a [`RefRegistry`]
//! in front of each device class, picks free slots, and assigns guest
//! paths, so several containers can attach the same layer safely.

use std::path::Path;

use sha2::{Digest, Sha256};
use strata_common::config::DeviceLimits;
use strata_common::constants::{PMEM_GUEST_PREFIX, VSMB_GUEST_PREFIX};
use strata_common::error::{HostError, HostResult};
use strata_common::types::{AttachmentKind, GuestOs, ScsiLocation};

use crate::registry::RefRegistry;
use crate::schema::{ModifyRequest, ShareFlags};
use crate::vm::UtilityVm;

/// Raw device hotplug operations of a running VM.
pub trait DeviceHost: Send + Sync {
    /// Adds a share named `name` backed by `host_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the hypervisor rejects the share.
    fn hot_add_share(&self, name: &str, host_path: &Path, flags: ShareFlags) -> HostResult<()>;

    /// Removes the share named `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the hypervisor cannot remove the share.
    fn hot_remove_share(&self, name: &str) -> HostResult<()>;

    /// Plugs `host_path` into persistent-memory slot `slot`.
    ///
    /// # Errors
    ///
    /// Returns an error if the hypervisor rejects the device.
    fn hot_add_pmem(&self, slot: u32, host_path: &Path, read_only: bool) -> HostResult<()>;

    /// Unplugs persistent-memory slot `slot`.
    ///
    /// # Errors
    ///
    /// Returns an error if the hypervisor cannot unplug the device.
    fn hot_remove_pmem(&self, slot: u32) -> HostResult<()>;

    /// Attaches `host_path` at `location` and mounts it at `guest_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the hypervisor rejects the disk.
    fn hot_add_scsi(
        &self,
        location: ScsiLocation,
        host_path: &Path,
        guest_path: &str,
    ) -> HostResult<()>;

    /// Detaches the disk at `location`.
    ///
    /// # Errors
    ///
    /// Returns an error if the hypervisor cannot detach the disk.
    fn hot_remove_scsi(&self, location: ScsiLocation) -> HostResult<()>;

    /// Forwards a modify request to the guest.
    ///
    /// # Errors
    ///
    /// Returns an error if the host or guest rejects the request.
    fn modify(&self, request: &ModifyRequest) -> HostResult<()>;
}

#[derive(Debug, Clone)]
struct Share {
    name: String,
    guest_path: String,
}

#[derive(Debug, Clone)]
struct Pmem {
    slot: u32,
    guest_path: String,
}

#[derive(Debug, Clone)]
struct Scsi {
    location: ScsiLocation,
}

/// Number of distinct live attachments per device class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachmentCounts {
    /// Live shares.
    pub shared_folders: usize,
    /// Live persistent-memory devices.
    pub memory_mapped_devices: usize,
    /// Live block-storage disks.
    pub block_devices: usize,
}

impl AttachmentCounts {
    /// Sum over all device classes.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.shared_folders + self.memory_mapped_devices + self.block_devices
    }
}

/// A utility VM whose attachments are shared between containers.
#[derive(Debug)]
pub struct SharedUtilityVm<H> {
    id: String,
    os: GuestOs,
    host: H,
    limits: DeviceLimits,
    shares: RefRegistry<Share>,
    pmem: RefRegistry<Pmem>,
    scsi: RefRegistry<Scsi>,
}

impl<H: DeviceHost> SharedUtilityVm<H> {
    /// Wraps `host` with the default device limits.
    #[must_use]
    pub fn new(id: impl Into<String>, os: GuestOs, host: H) -> Self {
        Self::with_limits(id, os, host, DeviceLimits::default())
    }

    /// Wraps `host` with explicit device limits.
    #[must_use]
    pub fn with_limits(id: impl Into<String>, os: GuestOs, host: H, limits: DeviceLimits) -> Self {
        Self {
            id: id.into(),
            os,
            host,
            limits,
            shares: RefRegistry::new(AttachmentKind::SharedFolder),
            pmem: RefRegistry::new(AttachmentKind::MemoryMappedDevice),
            scsi: RefRegistry::new(AttachmentKind::BlockDevice),
        }
    }

    /// Returns the wrapped device host.
    #[must_use]
    pub const fn host(&self) -> &H {
        &self.host
    }

    /// Returns the number of live attachments per device class.
    ///
    /// # Errors
    ///
    /// Returns an error if a registry lock is poisoned.
    pub fn attachment_counts(&self) -> HostResult<AttachmentCounts> {
        Ok(AttachmentCounts {
            shared_folders: self.shares.len()?,
            memory_mapped_devices: self.pmem.len()?,
            block_devices: self.scsi.len()?,
        })
    }

    /// Returns the number of references held on `host_path`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Unsupported`] for [`AttachmentKind::HostLayer`],
    /// which the VM never tracks, or an error if a registry lock is poisoned.
    pub fn ref_count(&self, kind: AttachmentKind, host_path: &Path) -> HostResult<usize> {
        match kind {
            AttachmentKind::SharedFolder => self.shares.ref_count(host_path),
            AttachmentKind::MemoryMappedDevice => self.pmem.ref_count(host_path),
            AttachmentKind::BlockDevice => self.scsi.ref_count(host_path),
            AttachmentKind::HostLayer => Err(HostError::Unsupported {
                operation: "counting host layer references",
                os: self.os,
            }),
        }
    }

    fn require(&self, os: GuestOs, operation: &'static str) -> HostResult<()> {
        if self.os == os {
            Ok(())
        } else {
            Err(HostError::Unsupported {
                operation,
                os: self.os,
            })
        }
    }
}

impl<H: DeviceHost> UtilityVm for SharedUtilityVm<H> {
    fn id(&self) -> &str {
        &self.id
    }

    fn guest_os(&self) -> GuestOs {
        self.os
    }

    fn add_shared_folder(
        &self,
        host_path: &Path,
        name: Option<&str>,
        flags: ShareFlags,
    ) -> HostResult<()> {
        self.require(GuestOs::Windows, "add shared folder")?;
        let _ = self.shares.acquire(host_path, |key, _| {
            let name = name.map_or_else(|| share_name(key), str::to_string);
            self.host.hot_add_share(&name, key, flags)?;
            tracing::info!(vm = %self.id, share = %name, path = %key.display(), "share added");
            Ok(Share {
                guest_path: format!("{VSMB_GUEST_PREFIX}{name}"),
                name,
            })
        })?;
        Ok(())
    }

    fn remove_shared_folder(&self, host_path: &Path) -> HostResult<()> {
        let _ = self.shares.release(host_path, |share| {
            self.host.hot_remove_share(&share.name)?;
            tracing::info!(vm = %self.id, share = %share.name, "share removed");
            Ok(())
        })?;
        Ok(())
    }

    fn shared_folder_guest_path(&self, host_path: &Path) -> HostResult<String> {
        self.shares
            .get(host_path)?
            .map(|share| share.guest_path)
            .ok_or_else(|| HostError::NotAttached {
                kind: AttachmentKind::SharedFolder,
                path: host_path.to_path_buf(),
            })
    }

    fn add_memory_mapped_device(
        &self,
        host_path: &Path,
        read_only: bool,
    ) -> HostResult<(u32, String)> {
        self.require(GuestOs::Linux, "add memory-mapped device")?;
        let device = self.pmem.acquire(host_path, |key, live| {
            let slot = (0..self.limits.pmem_devices)
                .find(|slot| !live.values().any(|p| p.slot == *slot))
                .ok_or(HostError::SlotsExhausted {
                    kind: AttachmentKind::MemoryMappedDevice,
                })?;
            self.host.hot_add_pmem(slot, key, read_only)?;
            tracing::info!(vm = %self.id, slot, path = %key.display(), "pmem device added");
            Ok(Pmem {
                slot,
                guest_path: format!("{PMEM_GUEST_PREFIX}{slot}"),
            })
        })?;
        Ok((device.slot, device.guest_path))
    }

    fn remove_memory_mapped_device(&self, host_path: &Path) -> HostResult<()> {
        let _ = self.pmem.release(host_path, |device| {
            self.host.hot_remove_pmem(device.slot)?;
            tracing::info!(vm = %self.id, slot = device.slot, "pmem device removed");
            Ok(())
        })?;
        Ok(())
    }

    fn add_block_device(&self, host_path: &Path, guest_path: &str) -> HostResult<ScsiLocation> {
        let disk = self.scsi.acquire(host_path, |key, live| {
            let location = free_scsi_location(self.limits, live.values().map(|s| s.location))
                .ok_or(HostError::SlotsExhausted {
                    kind: AttachmentKind::BlockDevice,
                })?;
            self.host.hot_add_scsi(location, key, guest_path)?;
            tracing::info!(
                vm = %self.id,
                %location,
                path = %key.display(),
                guest_path,
                "scsi disk added"
            );
            Ok(Scsi { location })
        })?;
        Ok(disk.location)
    }

    fn remove_block_device(&self, host_path: &Path) -> HostResult<()> {
        let _ = self.scsi.release(host_path, |disk| {
            self.host.hot_remove_scsi(disk.location)?;
            tracing::info!(vm = %self.id, location = %disk.location, "scsi disk removed");
            Ok(())
        })?;
        Ok(())
    }

    fn modify(&self, request: &ModifyRequest) -> HostResult<()> {
        tracing::debug!(
            vm = %self.id,
            resource = %request.resource_type,
            request = %request.request_type,
            "modify request"
        );
        self.host.modify(request)
    }
}

/// Derives a share name from the normalized host path.
fn share_name(host_path: &Path) -> String {
    let digest = Sha256::digest(host_path.to_string_lossy().as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("s{hex}")
}

/// Returns the first free (controller, LUN) pair within `limits`.
fn free_scsi_location(
    limits: DeviceLimits,
    used: impl Iterator<Item = ScsiLocation>,
) -> Option<ScsiLocation> {
    let used: Vec<ScsiLocation> = used.collect();
    (0..limits.scsi_controllers)
        .flat_map(|controller| {
            (0..limits.scsi_luns_per_controller).map(move |lun| ScsiLocation { controller, lun })
        })
        .find(|location| !used.contains(location))
}
