//! Best-effort reversal of a partially applied mount.
//!
//! Rollback runs on a path that is already failing, so its own failures
//! are logged as warnings and never replace the error being returned.

use std::path::{Path, PathBuf};

use strata_core::vm::UtilityVm;

/// A read-only layer disk attached as a memory-mapped device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedDevice {
    /// Host path of the layer disk.
    pub host_path: PathBuf,
    /// Guest path the device is mounted at.
    pub guest_path: String,
}

/// Attachments made so far by one mount call.
///
/// Only one of `shared_folders` and `devices` is ever populated, chosen by
/// the VM's guest family.
#[derive(Debug, Default)]
pub struct AttachmentRecord {
    /// Layer folders attached as shared folders.
    pub shared_folders: Vec<PathBuf>,
    /// Layer disks attached as memory-mapped devices.
    pub devices: Vec<MappedDevice>,
    /// Scratch disk attached to block storage, once attached.
    pub scratch: Option<PathBuf>,
}

impl AttachmentRecord {
    /// Releases every attachment in the record.
    pub fn roll_back(&self, vm: &dyn UtilityVm) {
        cleanup_on_mount_failure(
            vm,
            &self.shared_folders,
            &self.devices,
            self.scratch.as_deref(),
        );
    }
}

/// Releases every listed attachment, warning about the ones that fail.
pub fn cleanup_on_mount_failure(
    vm: &dyn UtilityVm,
    shared_folders: &[PathBuf],
    devices: &[MappedDevice],
    scratch: Option<&Path>,
) {
    for folder in shared_folders {
        if let Err(e) = vm.remove_shared_folder(folder) {
            tracing::warn!(
                vm = vm.id(),
                path = %folder.display(),
                error = %e,
                "possibly leaked shared folder on error removal path"
            );
        }
    }
    for device in devices {
        if let Err(e) = vm.remove_memory_mapped_device(&device.host_path) {
            tracing::warn!(
                vm = vm.id(),
                path = %device.host_path.display(),
                error = %e,
                "possibly leaked memory-mapped device on error removal path"
            );
        }
    }
    if let Some(scratch) = scratch {
        if let Err(e) = vm.remove_block_device(scratch) {
            tracing::warn!(
                vm = vm.id(),
                path = %scratch.display(),
                error = %e,
                "possibly leaked scratch disk on error removal path"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use strata_common::types::GuestOs;
    use strata_core::hotplug::SharedUtilityVm;
    use strata_core::schema::ShareFlags;
    use strata_core::testing::{FailurePoint, FakeDeviceHost};

    use super::*;

    #[test]
    fn releases_everything_recorded() {
        let vm = SharedUtilityVm::new("uvm", GuestOs::Windows, FakeDeviceHost::new());
        let mut record = AttachmentRecord::default();
        for layer in ["base", "overlay1"] {
            vm.add_shared_folder(Path::new(layer), None, ShareFlags::read_only_layer())
                .expect("add");
            record.shared_folders.push(PathBuf::from(layer));
        }
        let _ = vm
            .add_block_device(Path::new("scratch/sandbox.vhdx"), r"C:\c\scratch")
            .expect("scsi");
        record.scratch = Some(PathBuf::from("scratch/sandbox.vhdx"));

        record.roll_back(&vm);
        assert_eq!(vm.host().live_devices(), 0);
    }

    #[test]
    fn unattached_scratch_is_not_touched() {
        let vm = SharedUtilityVm::new("uvm", GuestOs::Linux, FakeDeviceHost::new());
        AttachmentRecord::default().roll_back(&vm);
        assert_eq!(vm.host().calls(FailurePoint::ScsiRemove), 0);
    }

    #[test]
    fn failures_do_not_stop_the_remaining_releases() {
        let vm = SharedUtilityVm::new("uvm", GuestOs::Linux, FakeDeviceHost::new());
        let mut devices = Vec::new();
        for layer in ["a/layer.vhd", "b/layer.vhd"] {
            let (_, guest_path) = vm
                .add_memory_mapped_device(Path::new(layer), true)
                .expect("add");
            devices.push(MappedDevice {
                host_path: PathBuf::from(layer),
                guest_path,
            });
        }
        vm.host().fail_on(FailurePoint::PmemRemove, 1);

        cleanup_on_mount_failure(&vm, &[], &devices, None);
        assert_eq!(vm.host().calls(FailurePoint::PmemRemove), 2);
        assert_eq!(vm.host().live_pmem(), 1);
    }
}
