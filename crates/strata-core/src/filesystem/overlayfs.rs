//! `OverlayFS` host layer driver.
//!
//! Activating a scratch folder creates its `upper`, `work`, and `merged`
//! directories; preparing it stacks the read-only parents beneath `upper`
//! and mounts the result at `merged`.

use std::path::{Path, PathBuf};

use strata_common::constants::{OVERLAY_MERGED_DIR, OVERLAY_UPPER_DIR, OVERLAY_WORK_DIR};
use strata_common::error::{HostError, HostResult};
use strata_common::types::AttachmentKind;

use crate::driver::HostLayerDriver;

/// Configuration for an `OverlayFS` mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Read-only lower layers, topmost first as `OverlayFS` expects.
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper layer directory.
    pub upper_dir: PathBuf,
    /// Work directory required by `OverlayFS`.
    pub work_dir: PathBuf,
    /// Final merged mount point.
    pub merged_dir: PathBuf,
}

impl OverlayConfig {
    /// Builds the mount configuration for a scratch folder and its
    /// read-only parents, given base first.
    #[must_use]
    pub fn for_scratch(scratch: &Path, parents: &[PathBuf]) -> Self {
        Self {
            lower_dirs: parents.iter().rev().cloned().collect(),
            upper_dir: scratch.join(OVERLAY_UPPER_DIR),
            work_dir: scratch.join(OVERLAY_WORK_DIR),
            merged_dir: scratch.join(OVERLAY_MERGED_DIR),
        }
    }

    /// Renders the `mount(2)` data string.
    #[must_use]
    pub fn mount_options(&self) -> String {
        let lowers = self
            .lower_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        format!(
            "lowerdir={},upperdir={},workdir={}",
            lowers,
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }
}

/// Mounts an `OverlayFS` with the given configuration.
///
/// # Errors
///
/// Returns an error if the mount syscall fails.
#[cfg(target_os = "linux")]
pub fn mount_overlay(config: &OverlayConfig) -> HostResult<()> {
    use nix::mount::{MsFlags, mount};

    let opts = config.mount_options();
    mount(
        Some("overlay"),
        &config.merged_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    )
    .map_err(|e| HostError::Rejected {
        operation: "mount overlay",
        message: e.to_string(),
    })?;

    tracing::info!(merged = %config.merged_dir.display(), "overlayfs mounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; `OverlayFS` mounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_overlay(_config: &OverlayConfig) -> HostResult<()> {
    Err(HostError::Rejected {
        operation: "mount overlay",
        message: "Linux required for overlay mounts".into(),
    })
}

/// Unmounts an `OverlayFS` at the given path.
///
/// Uses `MNT_DETACH` to lazily detach the filesystem.
///
/// # Errors
///
/// Returns an error if the unmount syscall fails.
#[cfg(target_os = "linux")]
pub fn unmount_overlay(merged_dir: &Path) -> HostResult<()> {
    nix::mount::umount2(merged_dir, nix::mount::MntFlags::MNT_DETACH).map_err(|e| {
        HostError::Rejected {
            operation: "unmount overlay",
            message: e.to_string(),
        }
    })?;
    tracing::info!(path = %merged_dir.display(), "overlayfs unmounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; `OverlayFS` unmounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn unmount_overlay(_merged_dir: &Path) -> HostResult<()> {
    Err(HostError::Rejected {
        operation: "unmount overlay",
        message: "Linux required for overlay mounts".into(),
    })
}

/// Host layer driver backed by `OverlayFS`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayDriver;

impl OverlayDriver {
    /// Creates the driver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl HostLayerDriver for OverlayDriver {
    fn activate(&self, path: &Path) -> HostResult<()> {
        for dir in [OVERLAY_UPPER_DIR, OVERLAY_WORK_DIR, OVERLAY_MERGED_DIR] {
            let dir = path.join(dir);
            std::fs::create_dir_all(&dir).map_err(|e| HostError::Io {
                path: dir.clone(),
                source: e,
            })?;
        }
        tracing::debug!(path = %path.display(), "overlay scratch activated");
        Ok(())
    }

    fn deactivate(&self, path: &Path) -> HostResult<()> {
        let work = path.join(OVERLAY_WORK_DIR);
        if work.exists() {
            std::fs::remove_dir_all(&work).map_err(|e| HostError::Io {
                path: work.clone(),
                source: e,
            })?;
        }
        let merged = path.join(OVERLAY_MERGED_DIR);
        if merged.exists() {
            std::fs::remove_dir(&merged).map_err(|e| HostError::Io {
                path: merged.clone(),
                source: e,
            })?;
        }
        tracing::debug!(path = %path.display(), "overlay scratch deactivated");
        Ok(())
    }

    fn prepare(&self, path: &Path, parents: &[PathBuf]) -> HostResult<()> {
        if parents.is_empty() {
            return Err(HostError::InvalidPath {
                path: path.to_path_buf(),
                reason: "overlay needs at least one lower layer",
            });
        }
        mount_overlay(&OverlayConfig::for_scratch(path, parents))
    }

    fn unprepare(&self, path: &Path) -> HostResult<()> {
        unmount_overlay(&path.join(OVERLAY_MERGED_DIR))
    }

    fn mount_path(&self, path: &Path) -> HostResult<PathBuf> {
        let merged = path.join(OVERLAY_MERGED_DIR);
        if merged.is_dir() {
            Ok(merged)
        } else {
            Err(HostError::NotAttached {
                kind: AttachmentKind::HostLayer,
                path: path.to_path_buf(),
            })
        }
    }

    #[cfg(unix)]
    fn grant_vm_access(&self, vm_id: &str, path: &Path) -> HostResult<()> {
        use std::os::unix::fs::PermissionsExt;

        let io_err = |e| HostError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        let mut perms = std::fs::metadata(path).map_err(io_err)?.permissions();
        perms.set_mode(perms.mode() | 0o660);
        std::fs::set_permissions(path, perms).map_err(io_err)?;
        tracing::debug!(vm = vm_id, path = %path.display(), "granted VM access");
        Ok(())
    }

    #[cfg(not(unix))]
    fn grant_vm_access(&self, _vm_id: &str, path: &Path) -> HostResult<()> {
        Err(HostError::InvalidPath {
            path: path.to_path_buf(),
            reason: "access grants require a unix host",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_dirs_are_topmost_first() {
        let parents = vec![PathBuf::from("/l/base"), PathBuf::from("/l/overlay1")];
        let config = OverlayConfig::for_scratch(Path::new("/l/scratch"), &parents);
        assert_eq!(
            config.mount_options(),
            "lowerdir=/l/overlay1:/l/base,upperdir=/l/scratch/upper,workdir=/l/scratch/work"
        );
        assert_eq!(config.merged_dir, PathBuf::from("/l/scratch/merged"));
    }

    #[test]
    fn activate_creates_overlay_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        OverlayDriver::new().activate(dir.path()).expect("activate");
        assert!(dir.path().join("upper").is_dir());
        assert!(dir.path().join("work").is_dir());
        assert!(dir.path().join("merged").is_dir());
    }

    #[test]
    fn deactivate_keeps_upper_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = OverlayDriver::new();
        driver.activate(dir.path()).expect("activate");
        std::fs::write(dir.path().join("upper").join("data"), b"kept").expect("write");

        driver.deactivate(dir.path()).expect("deactivate");
        assert!(dir.path().join("upper").join("data").exists());
        assert!(!dir.path().join("work").exists());
        assert!(!dir.path().join("merged").exists());
    }

    #[test]
    fn mount_path_requires_activation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = OverlayDriver::new();
        assert!(driver.mount_path(dir.path()).is_err());
        driver.activate(dir.path()).expect("activate");
        assert_eq!(
            driver.mount_path(dir.path()).expect("mount path"),
            dir.path().join("merged")
        );
    }

    #[test]
    fn prepare_without_parents_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = OverlayDriver::new()
            .prepare(dir.path(), &[])
            .expect_err("no lower layers");
        assert!(matches!(err, HostError::InvalidPath { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn grant_adds_group_read_write() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let disk = dir.path().join("sandbox.vhdx");
        std::fs::write(&disk, b"").expect("write");
        std::fs::set_permissions(&disk, std::fs::Permissions::from_mode(0o600)).expect("chmod");

        OverlayDriver::new()
            .grant_vm_access("uvm", &disk)
            .expect("grant");
        let mode = std::fs::metadata(&disk).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o660);
    }

    #[cfg(unix)]
    #[test]
    fn grant_on_missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = OverlayDriver::new()
            .grant_vm_access("uvm", &dir.path().join("absent.vhdx"))
            .expect_err("missing");
        assert!(matches!(err, HostError::Io { .. }));
    }
}
