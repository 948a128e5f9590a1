//! Maps attached shared-folder layers to the descriptors the guest's
//! storage filter expects.

use std::path::PathBuf;

use strata_common::error::{Result, StrataError};
use strata_core::driver::HostLayerDriver;
use strata_core::schema::LayerDescriptor;
use strata_core::vm::UtilityVm;

/// Resolves the guest path and layer identifier of every shared folder, in
/// order.
///
/// # Errors
///
/// Returns [`StrataError::Resolve`] for the first layer that cannot be
/// resolved. A partial list is never returned.
pub fn resolve_layer_descriptors(
    vm: &dyn UtilityVm,
    driver: &dyn HostLayerDriver,
    shared_folders: &[PathBuf],
) -> Result<Vec<LayerDescriptor>> {
    shared_folders
        .iter()
        .map(|folder| {
            let resolve_err = |source| StrataError::Resolve {
                path: folder.clone(),
                source,
            };
            let path = vm.shared_folder_guest_path(folder).map_err(resolve_err)?;
            let id = driver.layer_id(folder).map_err(resolve_err)?;
            Ok(LayerDescriptor {
                id: id.to_string(),
                path,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use strata_common::types::GuestOs;
    use strata_core::hotplug::SharedUtilityVm;
    use strata_core::schema::ShareFlags;
    use strata_core::testing::{FakeDeviceHost, FakeLayerDriver};

    use super::*;

    fn windows_vm_with(layers: &[&str]) -> SharedUtilityVm<FakeDeviceHost> {
        let vm = SharedUtilityVm::new("uvm", GuestOs::Windows, FakeDeviceHost::new());
        for layer in layers {
            vm.add_shared_folder(Path::new(layer), None, ShareFlags::read_only_layer())
                .expect("add");
        }
        vm
    }

    #[test]
    fn descriptors_follow_input_order() {
        let vm = windows_vm_with(&["base", "overlay1"]);
        let folders = vec![PathBuf::from("base"), PathBuf::from("overlay1")];
        let layers =
            resolve_layer_descriptors(&vm, &FakeLayerDriver::new(), &folders).expect("resolve");

        assert_eq!(layers.len(), 2);
        for (layer, folder) in layers.iter().zip(&folders) {
            assert_eq!(
                layer.path,
                vm.shared_folder_guest_path(folder).expect("guest path")
            );
            let id = strata_core::layer_id::layer_id(folder).expect("id");
            assert_eq!(layer.id, id.to_string());
        }
    }

    #[test]
    fn unshared_folder_fails_the_whole_resolution() {
        let vm = windows_vm_with(&["base"]);
        let folders = vec![PathBuf::from("base"), PathBuf::from("missing")];
        let err = resolve_layer_descriptors(&vm, &FakeLayerDriver::new(), &folders)
            .expect_err("missing share");
        match err {
            StrataError::Resolve { path, .. } => assert_eq!(path, PathBuf::from("missing")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
