//! Teardown of a mounted layer stack.

use std::path::Path;

use strata_common::error::{Result, StrataError, TeardownErrors};
use strata_common::types::{AttachmentKind, GuestOs, RequestType, ResourceType};
use strata_core::guest_path;
use strata_core::schema::ModifyRequest;
use strata_core::vm::UtilityVm;

use crate::mounter::LayerMounter;
use crate::operation::UnmountOperation;
use crate::stack::LayerStack;

impl LayerMounter {
    /// Tears down what [`LayerMounter::mount`] set up for `stack`.
    ///
    /// Inside a VM each class selected by `op` is released independently and
    /// every failure is collected, so one stuck resource does not keep the
    /// others attached. Read-only layers are ref-counted by the VM and are
    /// only detached once no other container uses them.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::InvalidArgument`] for a direct mount with any
    /// selector other than [`UnmountOperation::ALL`], or for a VM mount
    /// without a read-only layer. A direct unmount returns the first failing
    /// step as [`StrataError::Detach`]; a VM unmount returns every failure
    /// as [`StrataError::Teardown`].
    pub fn unmount(
        &self,
        stack: &LayerStack,
        guest_root: &str,
        vm: Option<&dyn UtilityVm>,
        op: UnmountOperation,
    ) -> Result<()> {
        tracing::debug!(
            layers = ?stack.read_only(),
            scratch = %stack.scratch().display(),
            guest_root,
            vm = ?vm.map(|vm| vm.id()),
            %op,
            "unmounting layer stack"
        );
        match vm {
            None => self.unmount_direct(stack.scratch(), op),
            Some(vm) => self.unmount_in_vm(stack, guest_root, vm, op),
        }
    }

    fn unmount_direct(&self, scratch: &Path, op: UnmountOperation) -> Result<()> {
        if op != UnmountOperation::ALL {
            return Err(StrataError::InvalidArgument {
                message: format!("direct host mounts only support full unmount, got {op}"),
            });
        }
        let detach_err = |source| StrataError::Detach {
            kind: AttachmentKind::HostLayer,
            path: scratch.to_path_buf(),
            source,
        };

        let unprepared = self.driver.unprepare(scratch).map_err(detach_err);
        let deactivated = self.driver.deactivate(scratch).map_err(detach_err);
        unprepared.and(deactivated)?;
        tracing::info!(scratch = %scratch.display(), "layers unmounted from host");
        Ok(())
    }

    fn unmount_in_vm(
        &self,
        stack: &LayerStack,
        guest_root: &str,
        vm: &dyn UtilityVm,
        op: UnmountOperation,
    ) -> Result<()> {
        stack.require_read_only("unmount")?;
        let os = vm.guest_os();
        let layout = self.layout.for_os(os);
        let mut errors = TeardownErrors::default();

        if op.contains(UnmountOperation::SCRATCH) {
            let root = match os {
                GuestOs::Windows => guest_path::join(os, guest_root, &layout.scratch_dir),
                GuestOs::Linux => guest_path::join(os, guest_root, &layout.rootfs_dir),
            };
            if let Err(source) = vm.modify(&ModifyRequest::remove_combined_layers(root.as_str())) {
                tracing::error!(
                    vm = vm.id(),
                    root = %root,
                    error = %source,
                    "failed to remove combined layers"
                );
                errors.push(StrataError::HostProtocol {
                    resource: ResourceType::CombinedLayers,
                    request: RequestType::Remove,
                    source,
                });
            }

            let scratch_disk = stack.scratch().join(&layout.scratch_disk);
            match vm.remove_block_device(&scratch_disk) {
                Ok(()) => {
                    tracing::debug!(vm = vm.id(), path = %scratch_disk.display(), "scratch detached");
                }
                Err(source) => errors.push(StrataError::Detach {
                    kind: AttachmentKind::BlockDevice,
                    path: scratch_disk,
                    source,
                }),
            }
        }

        if op.contains(UnmountOperation::SHARED_FOLDERS) && os == GuestOs::Windows {
            for layer in stack.read_only() {
                match vm.remove_shared_folder(layer) {
                    Ok(()) => {
                        tracing::debug!(vm = vm.id(), path = %layer.display(), "layer unshared");
                    }
                    Err(source) => errors.push(StrataError::Detach {
                        kind: AttachmentKind::SharedFolder,
                        path: layer.clone(),
                        source,
                    }),
                }
            }
        }

        if op.contains(UnmountOperation::DEVICES) && os == GuestOs::Linux {
            for layer in stack.read_only() {
                let disk = layer.join(&layout.layer_disk);
                match vm.remove_memory_mapped_device(&disk) {
                    Ok(()) => {
                        tracing::debug!(vm = vm.id(), path = %disk.display(), "layer unmapped");
                    }
                    Err(source) => errors.push(StrataError::Detach {
                        kind: AttachmentKind::MemoryMappedDevice,
                        path: disk,
                        source,
                    }),
                }
            }
        }

        if errors.is_empty() {
            tracing::info!(vm = vm.id(), %op, "layers unmounted from utility VM");
        } else {
            tracing::warn!(vm = vm.id(), %op, failures = errors.len(), "unmount incomplete");
        }
        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use strata_core::driver::HostLayerDriver;
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
    fn direct_unmount_rejects_partial_selector() {
        let (driver, mounter) = mounter();
        let err = mounter
            .unmount(&stack(), "", None, UnmountOperation::SCRATCH)
            .expect_err("partial");
        assert!(err.is_invalid_argument());
        assert!(driver.log().is_empty());
        assert_eq!(driver.calls(DriverOp::Unprepare), 0);
    }

    #[test]
    fn direct_unmount_needs_only_the_scratch() {
        let (driver, mounter) = mounter();
        let scratch_only = LayerStack::new(Vec::new(), "scratch");
        driver.activate(Path::new("scratch")).expect("activate");
        driver
            .prepare(Path::new("scratch"), &[PathBuf::from("base")])
            .expect("prepare");

        mounter
            .unmount(&scratch_only, "", None, UnmountOperation::ALL)
            .expect("unmount");
        assert_eq!(driver.active(), 0);
        assert_eq!(driver.prepared(), 0);
    }

    #[test]
    fn direct_unmount_attempts_deactivate_after_unprepare_failure() {
        let (driver, mounter) = mounter();
        let _ = mounter.mount(&stack(), "", None).expect("mount");
        driver.fail_always(DriverOp::Unprepare);

        let err = mounter
            .unmount(&stack(), "", None, UnmountOperation::ALL)
            .expect_err("unprepare fails");
        assert!(matches!(err, StrataError::Detach { .. }));
        assert_eq!(driver.calls(DriverOp::Deactivate), 1);
        assert_eq!(driver.active(), 0);
    }

    #[test]
    fn vm_unmount_requires_a_read_only_layer() {
        let (_, mounter) = mounter();
        let vm = SharedUtilityVm::new("uvm", GuestOs::Linux, FakeDeviceHost::new());
        let err = mounter
            .unmount(
                &LayerStack::new(Vec::new(), "scratch"),
                "/c/1",
                Some(&vm),
                UnmountOperation::ALL,
            )
            .expect_err("too few layers");
        assert!(err.is_invalid_argument());
        assert_eq!(vm.host().calls(FailurePoint::ModifyRemove), 0);
    }

    #[test]
    fn remove_request_targets_the_composed_root() {
        let (_, mounter) = mounter();
        let vm = SharedUtilityVm::new("uvm", GuestOs::Linux, FakeDeviceHost::new());
        let _ = mounter.mount(&stack(), "/c/1", Some(&vm)).expect("mount");

        mounter
            .unmount(&stack(), "/c/1", Some(&vm), UnmountOperation::SCRATCH)
            .expect("unmount");
        assert!(vm.host().composed_roots().is_empty());
        let last = vm.host().requests().pop().expect("remove request");
        assert_eq!(last.request_type, RequestType::Remove);
        assert_eq!(
            last.combined_layers().expect("payload").container_root_path,
            "/c/1/rootfs"
        );
    }

    #[test]
    fn failed_remove_request_still_detaches_scratch() {
        let (_, mounter) = mounter();
        let vm = SharedUtilityVm::new("uvm", GuestOs::Windows, FakeDeviceHost::new());
        let _ = mounter.mount(&stack(), r"C:\c\1", Some(&vm)).expect("mount");
        vm.host().fail_always(FailurePoint::ModifyRemove);

        let err = mounter
            .unmount(&stack(), r"C:\c\1", Some(&vm), UnmountOperation::ALL)
            .expect_err("modify fails");
        let StrataError::Teardown(failures) = err else {
            panic!("expected teardown error");
        };
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures.iter().next(),
            Some(StrataError::HostProtocol {
                request: RequestType::Remove,
                ..
            })
        ));
        assert_eq!(vm.host().live_devices(), 0);
    }

    #[test]
    fn phases_for_the_other_guest_family_are_skipped() {
        let (_, mounter) = mounter();
        let vm = SharedUtilityVm::new("uvm", GuestOs::Linux, FakeDeviceHost::new());
        let _ = mounter.mount(&stack(), "/c/1", Some(&vm)).expect("mount");

        mounter
            .unmount(&stack(), "/c/1", Some(&vm), UnmountOperation::SHARED_FOLDERS)
            .expect("nothing to do");
        assert_eq!(vm.host().live_pmem(), 2);
        assert_eq!(vm.host().live_scsi(), 1);
        assert_eq!(vm.host().calls(FailurePoint::ShareRemove), 0);
    }
}
