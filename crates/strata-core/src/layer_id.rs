//! Stable layer identifiers.
//!
//! A layer's identifier is a name-based UUID derived from the final
//! component of its folder path, so every host computes the same identifier
//! for the same layer without any shared state.

use std::path::Path;

use strata_common::error::{HostError, HostResult};
use uuid::Uuid;

/// Namespace for layer identifiers.
const LAYER_NAMESPACE: Uuid = Uuid::from_u128(0xcc3a_c2a4_5e6c_4a3b_8a3e_1f6e_2d43_b2a1);

/// Derives the identifier of the layer stored at `path`.
///
/// # Errors
///
/// Returns [`HostError::InvalidPath`] if the path has no final component or
/// that component is not valid UTF-8.
pub fn layer_id(path: &Path) -> HostResult<Uuid> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| HostError::InvalidPath {
            path: path.to_path_buf(),
            reason: "layer path has no folder name",
        })?;
    Ok(Uuid::new_v5(&LAYER_NAMESPACE, name.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_folder_name_yields_same_id() {
        let a = layer_id(Path::new("/var/lib/layers/f9b22d90")).expect("id");
        let b = layer_id(Path::new("/mnt/other/f9b22d90")).expect("id");
        assert_eq!(a, b);
    }

    #[test]
    fn different_folders_yield_different_ids() {
        let a = layer_id(Path::new("/layers/base")).expect("id");
        let b = layer_id(Path::new("/layers/overlay1")).expect("id");
        assert_ne!(a, b);
    }

    #[test]
    fn id_is_name_based() {
        let id = layer_id(Path::new("base")).expect("id");
        assert_eq!(id.get_version_num(), 5);
    }

    #[test]
    fn root_path_is_rejected() {
        let err = layer_id(Path::new("/")).expect_err("no file name");
        assert!(matches!(err, HostError::InvalidPath { .. }));
    }
}
