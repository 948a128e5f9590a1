//! System-wide constants and default guest layout values.

/// Default name of the per-container scratch mount under the guest root.
pub const DEFAULT_SCRATCH_DIR: &str = "scratch";

/// Default name of the composed root filesystem under the guest root.
pub const DEFAULT_ROOTFS_DIR: &str = "rootfs";

/// Well-known virtual disk inside every read-only layer folder.
pub const LAYER_DISK_NAME: &str = "layer.vhd";

/// Well-known virtual disk inside every scratch folder.
pub const SCRATCH_DISK_NAME: &str = "sandbox.vhdx";

/// Guest-side prefix under which Windows guests see shared folders.
pub const VSMB_GUEST_PREFIX: &str = r"\\?\VMSMB\VSMB-{dcc079ae-60ba-4d07-847c-3493609c0870}\";

/// Guest-side prefix under which Linux guests mount persistent-memory layers.
pub const PMEM_GUEST_PREFIX: &str = "/tmp/p";

/// Default number of persistent-memory device slots per VM.
pub const DEFAULT_PMEM_DEVICES: u32 = 64;

/// Default number of block-storage controllers per VM.
pub const DEFAULT_SCSI_CONTROLLERS: u8 = 4;

/// Default number of logical units per block-storage controller.
pub const DEFAULT_SCSI_LUNS_PER_CONTROLLER: u8 = 64;

/// Environment variable naming a JSON configuration file.
pub const CONFIG_ENV_VAR: &str = "STRATA_CONFIG";

/// Writable directory inside an overlay scratch folder.
pub const OVERLAY_UPPER_DIR: &str = "upper";

/// Overlay work directory inside a scratch folder.
pub const OVERLAY_WORK_DIR: &str = "work";

/// Merged mount point inside a scratch folder.
pub const OVERLAY_MERGED_DIR: &str = "merged";
