//! Composition of a layer stack into a container root filesystem.
//!
//! Without a utility VM the scratch folder is activated and prepared on the
//! host by the [`HostLayerDriver`]. With a VM, every read-only layer is
//! attached in the style of the guest family, the scratch disk is attached
//! to block storage, and the guest is asked to combine them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_common::config::LayoutConfig;
use strata_common::error::{Result, StrataError};
use strata_common::types::{AttachmentKind, GuestOs, RequestType, ResourceType};
use strata_core::driver::HostLayerDriver;
use strata_core::guest_path;
use strata_core::schema::{CombinedLayers, LayerDescriptor, ModifyRequest, ShareFlags};
use strata_core::vm::UtilityVm;

use crate::resolve::resolve_layer_descriptors;
use crate::rollback::{AttachmentRecord, MappedDevice};
use crate::stack::LayerStack;

/// Outcome of a successful mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountedLayers {
    /// Host path of the composed filesystem, for mounts without a VM.
    DirectMount(PathBuf),
    /// Composition the guest was asked to build.
    ComposedLayers(CombinedLayers),
}

impl MountedLayers {
    /// Returns the host path of a direct mount.
    #[must_use]
    pub fn host_path(&self) -> Option<&Path> {
        match self {
            Self::DirectMount(path) => Some(path),
            Self::ComposedLayers(_) => None,
        }
    }

    /// Returns the guest composition of a VM mount.
    #[must_use]
    pub const fn combined_layers(&self) -> Option<&CombinedLayers> {
        match self {
            Self::DirectMount(_) => None,
            Self::ComposedLayers(combined) => Some(combined),
        }
    }
}

/// Mounts and unmounts container layer stacks.
///
/// The mounter keeps no per-mount state: the caller holds on to the stack,
/// guest root and VM it mounted with and passes them back to
/// [`LayerMounter::unmount`].
pub struct LayerMounter {
    pub(crate) driver: Arc<dyn HostLayerDriver>,
    pub(crate) layout: LayoutConfig,
}

impl fmt::Debug for LayerMounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerMounter")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl LayerMounter {
    /// Creates a mounter with the default guest layouts.
    #[must_use]
    pub fn new(driver: Arc<dyn HostLayerDriver>) -> Self {
        Self::with_layout(driver, LayoutConfig::default())
    }

    /// Creates a mounter with explicit guest layouts.
    #[must_use]
    pub fn with_layout(driver: Arc<dyn HostLayerDriver>, layout: LayoutConfig) -> Self {
        Self { driver, layout }
    }

    /// Returns the guest layouts in use.
    #[must_use]
    pub const fn layout(&self) -> &LayoutConfig {
        &self.layout
    }

    /// Mounts `stack`, directly on the host when `vm` is `None` and inside
    /// the VM otherwise.
    ///
    /// A failed mount leaves nothing attached: everything attached by this
    /// call is released again before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::InvalidArgument`] if the stack has no
    /// read-only layer, before any host call. Otherwise returns the first
    /// failing step as [`StrataError::Attach`], [`StrataError::Grant`],
    /// [`StrataError::Resolve`] or [`StrataError::HostProtocol`].
    pub fn mount(
        &self,
        stack: &LayerStack,
        guest_root: &str,
        vm: Option<&dyn UtilityVm>,
    ) -> Result<MountedLayers> {
        stack.require_read_only("mount")?;
        tracing::debug!(
            layers = ?stack.read_only(),
            scratch = %stack.scratch().display(),
            guest_root,
            vm = ?vm.map(|vm| vm.id()),
            "mounting layer stack"
        );

        match vm {
            None => self.mount_direct(stack).map(MountedLayers::DirectMount),
            Some(vm) => self
                .mount_in_vm(stack, guest_root, vm)
                .map(MountedLayers::ComposedLayers),
        }
    }

    fn mount_direct(&self, stack: &LayerStack) -> Result<PathBuf> {
        let scratch = stack.scratch();
        let attach_err = |source| StrataError::Attach {
            kind: AttachmentKind::HostLayer,
            path: scratch.to_path_buf(),
            source,
        };

        self.driver.activate(scratch).map_err(attach_err)?;
        if let Err(e) = self.driver.prepare(scratch, stack.read_only()) {
            self.undo_activate(scratch);
            return Err(attach_err(e));
        }
        match self.driver.mount_path(scratch) {
            Ok(path) => {
                tracing::info!(
                    scratch = %scratch.display(),
                    mount = %path.display(),
                    "layers mounted on host"
                );
                Ok(path)
            }
            Err(e) => {
                if let Err(undo) = self.driver.unprepare(scratch) {
                    tracing::warn!(
                        path = %scratch.display(),
                        error = %undo,
                        "failed to unprepare layer after mount failure"
                    );
                }
                self.undo_activate(scratch);
                Err(attach_err(e))
            }
        }
    }

    fn undo_activate(&self, scratch: &Path) {
        if let Err(e) = self.driver.deactivate(scratch) {
            tracing::warn!(
                path = %scratch.display(),
                error = %e,
                "failed to deactivate layer after mount failure"
            );
        }
    }

    fn mount_in_vm(
        &self,
        stack: &LayerStack,
        guest_root: &str,
        vm: &dyn UtilityVm,
    ) -> Result<CombinedLayers> {
        let mut record = AttachmentRecord::default();
        match self.compose(stack, guest_root, vm, &mut record) {
            Ok(combined) => {
                tracing::info!(
                    vm = vm.id(),
                    root = %combined.container_root_path,
                    layers = combined.layers.len(),
                    "layers mounted in utility VM"
                );
                Ok(combined)
            }
            Err(e) => {
                tracing::debug!(vm = vm.id(), error = %e, "rolling back failed mount");
                record.roll_back(vm);
                Err(e)
            }
        }
    }

    /// Attaches everything the guest needs, recording each attachment in
    /// `record` as soon as it succeeds.
    fn compose(
        &self,
        stack: &LayerStack,
        guest_root: &str,
        vm: &dyn UtilityVm,
        record: &mut AttachmentRecord,
    ) -> Result<CombinedLayers> {
        let os = vm.guest_os();
        let layout = self.layout.for_os(os);

        for layer in stack.read_only() {
            match os {
                GuestOs::Windows => {
                    vm.add_shared_folder(layer, None, ShareFlags::read_only_layer())
                        .map_err(|source| StrataError::Attach {
                            kind: AttachmentKind::SharedFolder,
                            path: layer.clone(),
                            source,
                        })?;
                    tracing::debug!(vm = vm.id(), path = %layer.display(), "layer shared");
                    record.shared_folders.push(layer.clone());
                }
                GuestOs::Linux => {
                    let disk = layer.join(&layout.layer_disk);
                    let (slot, guest_path) = vm
                        .add_memory_mapped_device(&disk, true)
                        .map_err(|source| StrataError::Attach {
                            kind: AttachmentKind::MemoryMappedDevice,
                            path: disk.clone(),
                            source,
                        })?;
                    tracing::debug!(
                        vm = vm.id(),
                        path = %disk.display(),
                        slot,
                        guest_path = %guest_path,
                        "layer mapped"
                    );
                    record.devices.push(MappedDevice {
                        host_path: disk,
                        guest_path,
                    });
                }
            }
        }

        let scratch_disk = stack.scratch().join(&layout.scratch_disk);
        if os == GuestOs::Linux {
            self.driver
                .grant_vm_access(vm.id(), &scratch_disk)
                .map_err(|source| StrataError::Grant {
                    vm_id: vm.id().to_string(),
                    path: scratch_disk.clone(),
                    source,
                })?;
        }
        let scratch_guest = guest_path::join(os, guest_root, &layout.scratch_dir);
        let location = vm
            .add_block_device(&scratch_disk, &scratch_guest)
            .map_err(|source| StrataError::Attach {
                kind: AttachmentKind::BlockDevice,
                path: scratch_disk.clone(),
                source,
            })?;
        tracing::debug!(
            vm = vm.id(),
            path = %scratch_disk.display(),
            %location,
            guest_path = %scratch_guest,
            "scratch attached"
        );
        record.scratch = Some(scratch_disk);

        let combined = match os {
            GuestOs::Windows => CombinedLayers {
                layers: resolve_layer_descriptors(vm, self.driver.as_ref(), &record.shared_folders)?,
                container_root_path: scratch_guest,
                scratch_path: None,
            },
            GuestOs::Linux => CombinedLayers {
                container_root_path: guest_path::join(os, guest_root, &layout.rootfs_dir),
                layers: record
                    .devices
                    .iter()
                    .map(|device| LayerDescriptor {
                        id: String::new(),
                        path: device.guest_path.clone(),
                    })
                    .collect(),
                scratch_path: Some(scratch_guest),
            },
        };

        vm.modify(&ModifyRequest::add_combined_layers(combined.clone()))
            .map_err(|source| StrataError::HostProtocol {
                resource: ResourceType::CombinedLayers,
                request: RequestType::Add,
                source,
            })?;
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use strata_core::hotplug::SharedUtilityVm;
    use strata_core::testing::{DriverOp, FailurePoint, FakeDeviceHost, FakeLayerDriver};

    use super::*;

    fn stack() -> LayerStack {
        LayerStack::from_folders(["base", "overlay1", "scratchDirA"]).expect("stack")
    }

    fn mounter() -> (Arc<FakeLayerDriver>, LayerMounter) {
        let driver = Arc::new(FakeLayerDriver::new());
        let mounter = LayerMounter::new(driver.clone());
        (driver, mounter)
    }

    #[test]
    fn direct_mount_returns_resolved_host_path() {
        let (driver, mounter) = mounter();
        let mounted = mounter.mount(&stack(), "", None).expect("mount");

        let path = mounted.host_path().expect("direct mount");
        assert!(path.starts_with("/volumes"));
        assert_eq!(
            driver.log(),
            vec![DriverOp::Activate, DriverOp::Prepare, DriverOp::MountPath]
        );
        assert_eq!(
            driver.parents_of(Path::new("scratchDirA")),
            Some(vec![PathBuf::from("base"), PathBuf::from("overlay1")])
        );
    }

    #[test]
    fn direct_prepare_failure_deactivates() {
        let (driver, mounter) = mounter();
        driver.fail_always(DriverOp::Prepare);

        let err = mounter.mount(&stack(), "", None).expect_err("prepare fails");
        assert!(matches!(
            err,
            StrataError::Attach {
                kind: AttachmentKind::HostLayer,
                ..
            }
        ));
        assert_eq!(driver.active(), 0);
        assert_eq!(driver.calls(DriverOp::Deactivate), 1);
    }

    #[test]
    fn direct_mount_path_failure_unprepares_then_deactivates() {
        let (driver, mounter) = mounter();
        driver.fail_always(DriverOp::MountPath);

        let _ = mounter.mount(&stack(), "", None).expect_err("mount path fails");
        assert_eq!(driver.prepared(), 0);
        assert_eq!(driver.active(), 0);
        let log = driver.log();
        assert_eq!(&log[log.len() - 2..], &[DriverOp::Unprepare, DriverOp::Deactivate]);
    }

    #[test]
    fn linux_mount_grants_scratch_access_before_attaching() {
        let (driver, mounter) = mounter();
        let vm = SharedUtilityVm::new("uvm", GuestOs::Linux, FakeDeviceHost::new());

        let _ = mounter
            .mount(&stack(), "/run/gcs/c/1", Some(&vm))
            .expect("mount");
        assert_eq!(
            driver.grants(),
            vec![(
                "uvm".to_string(),
                PathBuf::from("scratchDirA").join("sandbox.vhdx")
            )]
        );
    }

    #[test]
    fn windows_mount_does_not_grant() {
        let (driver, mounter) = mounter();
        let vm = SharedUtilityVm::new("uvm", GuestOs::Windows, FakeDeviceHost::new());

        let _ = mounter.mount(&stack(), r"C:\c\1", Some(&vm)).expect("mount");
        assert!(driver.grants().is_empty());
    }

    #[test]
    fn failed_grant_rolls_back_layers_without_touching_scsi() {
        let (driver, mounter) = mounter();
        driver.fail_always(DriverOp::GrantVmAccess);
        let vm = SharedUtilityVm::new("uvm", GuestOs::Linux, FakeDeviceHost::new());

        let err = mounter
            .mount(&stack(), "/run/gcs/c/1", Some(&vm))
            .expect_err("grant fails");
        assert!(matches!(err, StrataError::Grant { .. }));
        assert_eq!(vm.host().calls(FailurePoint::ScsiAdd), 0);
        assert_eq!(vm.host().live_devices(), 0);
    }

    #[test]
    fn failed_scratch_attach_rolls_back_layers() {
        let (_, mounter) = mounter();
        let vm = SharedUtilityVm::new("uvm", GuestOs::Windows, FakeDeviceHost::new());
        vm.host().fail_always(FailurePoint::ScsiAdd);

        let err = mounter
            .mount(&stack(), r"C:\c\1", Some(&vm))
            .expect_err("scsi fails");
        assert!(matches!(
            err,
            StrataError::Attach {
                kind: AttachmentKind::BlockDevice,
                ..
            }
        ));
        assert_eq!(vm.host().calls(FailurePoint::ShareRemove), 2);
        assert_eq!(vm.host().live_devices(), 0);
        assert_eq!(vm.host().calls(FailurePoint::ModifyAdd), 0);
    }

    #[test]
    fn guest_layout_is_configurable() {
        let driver = Arc::new(FakeLayerDriver::new());
        let mut layout = LayoutConfig::default();
        layout.linux.rootfs_dir = "root".into();
        layout.linux.scratch_dir = "rw".into();
        let mounter = LayerMounter::with_layout(driver, layout);
        let vm = SharedUtilityVm::new("uvm", GuestOs::Linux, FakeDeviceHost::new());

        let mounted = mounter.mount(&stack(), "/c/1", Some(&vm)).expect("mount");
        let combined = mounted.combined_layers().expect("composed");
        assert_eq!(combined.container_root_path, "/c/1/root");
        assert_eq!(combined.scratch_path.as_deref(), Some("/c/1/rw"));
    }
}
