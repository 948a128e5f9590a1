//! Direct host mounting of layer stacks.
//!
//! Provides an `OverlayFS` implementation of
//! [`HostLayerDriver`](crate::driver::HostLayerDriver) for hosts that run
//! containers without a utility VM.

pub mod overlayfs;
