//! Domain primitive types used across the Strata workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Operating system family running inside a utility VM.
///
/// The family decides how read-only layers are attached (shared folders for
/// Windows guests, memory-mapped block devices for Linux guests) and which
/// path syntax guest paths use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestOs {
    /// Windows guest: layers are exposed as read-only shared folders.
    Windows,
    /// Linux guest: layers are exposed as persistent-memory block devices.
    Linux,
}

impl fmt::Display for GuestOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Windows => write!(f, "windows"),
            Self::Linux => write!(f, "linux"),
        }
    }
}

/// Class of resource attached to (or detached from) a container's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttachmentKind {
    /// A host directory exposed to the VM as a share.
    SharedFolder,
    /// A host file exposed as a persistent-memory backed block device.
    MemoryMappedDevice,
    /// A virtual disk on the VM's block-storage controller.
    BlockDevice,
    /// A layer activated directly on the host, without virtualization.
    HostLayer,
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedFolder => write!(f, "shared folder"),
            Self::MemoryMappedDevice => write!(f, "memory-mapped device"),
            Self::BlockDevice => write!(f, "block device"),
            Self::HostLayer => write!(f, "host layer"),
        }
    }
}

/// Slot on the VM's virtual block-storage controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScsiLocation {
    /// Controller index.
    pub controller: u8,
    /// Logical unit number on the controller.
    pub lun: u8,
}

impl fmt::Display for ScsiLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.controller, self.lun)
    }
}

/// Resource tag carried by a modify request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    /// A storage-filter composition of read-only layers beneath a scratch.
    CombinedLayers,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CombinedLayers => write!(f, "combined layers"),
        }
    }
}

/// Verb carried by a modify request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    /// Add the resource to the running VM.
    Add,
    /// Remove the resource from the running VM.
    Remove,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
        }
    }
}
