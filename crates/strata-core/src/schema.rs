//! Modify-request schema understood by the virtualization host.
//!
//! Field names follow the host's `PascalCase` wire format.

use serde::{Deserialize, Serialize};
use strata_common::types::{RequestType, ResourceType};

/// Flags applied when exposing a host folder as a share.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[allow(clippy::struct_excessive_bools)]
pub struct ShareFlags {
    /// The guest may not write to the share.
    pub read_only: bool,
    /// Use pseudo-oplocks instead of real opportunistic locks.
    pub pseudo_oplocks: bool,
    /// Open files with backup privilege so ACLs do not block the guest.
    pub take_backup_privilege: bool,
    /// Allow the guest to cache file contents.
    #[serde(rename = "CacheIO")]
    pub cache_io: bool,
    /// Allow other openers to read while the share holds a file open.
    pub share_read: bool,
}

impl ShareFlags {
    /// Flags used for immutable container layers.
    #[must_use]
    pub const fn read_only_layer() -> Self {
        Self {
            read_only: true,
            pseudo_oplocks: true,
            take_backup_privilege: true,
            cache_io: true,
            share_read: true,
        }
    }
}

/// One read-only layer as seen from inside the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LayerDescriptor {
    /// Stable layer identifier. Empty when the guest does not need one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Path of the layer inside the guest.
    pub path: String,
}

/// Composition of read-only layers beneath a writable scratch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CombinedLayers {
    /// Guest path that becomes the container's root filesystem.
    pub container_root_path: String,
    /// Read-only layers, base first.
    #[serde(default)]
    pub layers: Vec<LayerDescriptor>,
    /// Guest path of the scratch mount holding the overlay upper and work
    /// directories. Only set when the guest composes the overlay itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_path: Option<String>,
}

/// Resource-specific payload of a [`ModifyRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostedSettings {
    /// Payload for [`ResourceType::CombinedLayers`].
    CombinedLayers(CombinedLayers),
}

/// Request applied to a running VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifyRequest {
    /// Resource the request targets.
    pub resource_type: ResourceType,
    /// Whether the resource is added or removed.
    pub request_type: RequestType,
    /// Resource-specific payload.
    pub hosted_settings: HostedSettings,
}

impl ModifyRequest {
    /// Builds a request asking the guest to compose the given layers.
    #[must_use]
    pub const fn add_combined_layers(settings: CombinedLayers) -> Self {
        Self {
            resource_type: ResourceType::CombinedLayers,
            request_type: RequestType::Add,
            hosted_settings: HostedSettings::CombinedLayers(settings),
        }
    }

    /// Builds a request asking the guest to tear down the composition rooted
    /// at `container_root_path`.
    #[must_use]
    pub fn remove_combined_layers(container_root_path: impl Into<String>) -> Self {
        Self {
            resource_type: ResourceType::CombinedLayers,
            request_type: RequestType::Remove,
            hosted_settings: HostedSettings::CombinedLayers(CombinedLayers {
                container_root_path: container_root_path.into(),
                ..CombinedLayers::default()
            }),
        }
    }

    /// Returns the combined-layers payload, if the request carries one.
    #[must_use]
    pub const fn combined_layers(&self) -> Option<&CombinedLayers> {
        match &self.hosted_settings {
            HostedSettings::CombinedLayers(c) => Some(c),
        }
    }
}
