//! Container layer mounting for the Strata runtime.
//!
//! [`LayerMounter`] composes a [`LayerStack`] either directly on the host
//! or inside a running utility VM, and tears it down again, fully or
//! selectively by [`UnmountOperation`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::panic, clippy::unwrap_used))]

pub mod mounter;
pub mod operation;
pub mod resolve;
pub mod rollback;
pub mod stack;
mod unmount;

pub use mounter::{LayerMounter, MountedLayers};
pub use operation::UnmountOperation;
pub use stack::LayerStack;
