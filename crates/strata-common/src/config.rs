//! Configuration model for guest layouts and device limits.
//!
//! Every section implements [`Default`] and is `#[serde(default)]`, so a
//! configuration file only needs to name the values it overrides.

use std::ffi::OsStr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, StrataError};
use crate::types::GuestOs;

/// Fixed path segments and file names for one guest OS family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestLayout {
    /// Scratch mount directory, relative to the container's guest root.
    pub scratch_dir: String,
    /// Composed root directory, relative to the container's guest root.
    pub rootfs_dir: String,
    /// Virtual disk file inside each read-only layer folder.
    pub layer_disk: String,
    /// Virtual disk file inside the scratch folder.
    pub scratch_disk: String,
}

impl Default for GuestLayout {
    fn default() -> Self {
        Self {
            scratch_dir: constants::DEFAULT_SCRATCH_DIR.into(),
            rootfs_dir: constants::DEFAULT_ROOTFS_DIR.into(),
            layer_disk: constants::LAYER_DISK_NAME.into(),
            scratch_disk: constants::SCRATCH_DISK_NAME.into(),
        }
    }
}

/// Guest layouts for both guest OS families.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Layout used for Windows guests.
    pub windows: GuestLayout,
    /// Layout used for Linux guests.
    pub linux: GuestLayout,
}

impl LayoutConfig {
    /// Returns the layout for the given guest family.
    #[must_use]
    pub const fn for_os(&self, os: GuestOs) -> &GuestLayout {
        match os {
            GuestOs::Windows => &self.windows,
            GuestOs::Linux => &self.linux,
        }
    }
}

/// Device slot limits of a utility VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceLimits {
    /// Number of persistent-memory device slots.
    pub pmem_devices: u32,
    /// Number of block-storage controllers.
    pub scsi_controllers: u8,
    /// Logical units available on each block-storage controller.
    pub scsi_luns_per_controller: u8,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            pmem_devices: constants::DEFAULT_PMEM_DEVICES,
            scsi_controllers: constants::DEFAULT_SCSI_CONTROLLERS,
            scsi_luns_per_controller: constants::DEFAULT_SCSI_LUNS_PER_CONTROLLER,
        }
    }
}

/// Root configuration for Strata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Guest path layouts, injected into the layer mounter.
    pub layout: LayoutConfig,
    /// Device limits, injected into the utility VM adapter.
    pub devices: DeviceLimits,
}

impl StrataConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// names a layout with an empty path segment.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading configuration");
        let content = std::fs::read_to_string(path).map_err(|e| StrataError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file named by `STRATA_CONFIG`, or the defaults when the
    /// variable is unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable names a file that cannot be loaded.
    pub fn from_env() -> Result<Self> {
        Self::from_config_var(std::env::var_os(constants::CONFIG_ENV_VAR).as_deref())
    }

    fn from_config_var(value: Option<&OsStr>) -> Result<Self> {
        value.map_or_else(|| Ok(Self::default()), |p| Self::load(Path::new(p)))
    }

    /// Checks that every layout segment is non-empty and every device class
    /// has at least one slot.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Config`] naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        for (os, layout) in [
            (GuestOs::Windows, &self.layout.windows),
            (GuestOs::Linux, &self.layout.linux),
        ] {
            let fields = [
                ("scratch_dir", &layout.scratch_dir),
                ("rootfs_dir", &layout.rootfs_dir),
                ("layer_disk", &layout.layer_disk),
                ("scratch_disk", &layout.scratch_disk),
            ];
            if let Some((name, _)) = fields.iter().find(|(_, v)| v.is_empty()) {
                return Err(StrataError::Config {
                    message: format!("{os} layout field {name} must not be empty"),
                });
            }
        }
        if self.devices.pmem_devices == 0
            || self.devices.scsi_controllers == 0
            || self.devices.scsi_luns_per_controller == 0
        {
            return Err(StrataError::Config {
                message: "device limits must allow at least one slot per class".into(),
            });
        }
        Ok(())
    }
}
