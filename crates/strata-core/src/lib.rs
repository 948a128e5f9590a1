//! # strata-core
//!
//! The attachment layer beneath the layer mounter.
//!
//! This crate provides:
//! - **VM handle**: the [`vm::UtilityVm`] contract for attaching shares,
//!   persistent-memory devices, and block-storage disks to a running VM.
//! - **Host driver**: the [`driver::HostLayerDriver`] contract for mounting
//!   layers directly on the host, and an `OverlayFS` implementation of it.
//! - **Ref-counting**: [`registry::RefRegistry`] and the
//!   [`hotplug::SharedUtilityVm`] adapter, which lets several containers in
//!   one VM share the same read-only layers.
//! - **Schema**: the modify request sent to the guest to compose layers.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod driver;
pub mod filesystem;
pub mod guest_path;
pub mod hotplug;
pub mod layer_id;
pub mod registry;
pub mod schema;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod vm;
