//! Selector for what an unmount tears down.
//!
//! A caller that knows the VM is about to be destroyed can skip releasing
//! the read-only layers and only detach the scratch, which is what keeps
//! the container's filesystem consistent.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bitmask over the three independently removable attachment classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnmountOperation(u8);

impl UnmountOperation {
    /// The storage-filter composition and the scratch block device.
    pub const SCRATCH: Self = Self(0x01);
    /// Read-only layers attached as shared folders.
    pub const SHARED_FOLDERS: Self = Self(0x02);
    /// Read-only layers attached as memory-mapped devices.
    pub const DEVICES: Self = Self(0x04);
    /// Everything. The only selector accepted for direct host mounts.
    pub const ALL: Self = Self(0x07);

    /// A selector that tears nothing down.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns whether every class in `other` is selected.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns whether no class is selected.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl Default for UnmountOperation {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for UnmountOperation {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for UnmountOperation {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for UnmountOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names = [
            (Self::SCRATCH, "scratch"),
            (Self::SHARED_FOLDERS, "shared-folders"),
            (Self::DEVICES, "devices"),
        ];
        let selected: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", selected.join("|"))
    }
}
