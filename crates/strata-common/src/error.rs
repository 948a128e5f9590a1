//! Unified error types for the Strata workspace.
//!
//! [`HostError`] is what external collaborators (the VM handle, the device
//! host, the host layer driver) report. [`StrataError`] is what the layer
//! mounter returns; it keeps the collaborator's error as its `source`.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::{AttachmentKind, GuestOs, RequestType, ResourceType};

/// Failure reported by a virtualization host or host layer driver.
#[derive(Debug, Error)]
pub enum HostError {
    /// The host refused or failed the operation.
    #[error("{operation} rejected by host: {message}")]
    Rejected {
        /// Operation that was attempted.
        operation: &'static str,
        /// Host-provided reason.
        message: String,
    },

    /// The resource was never attached, or has already been released.
    #[error("{kind} not attached: {path}")]
    NotAttached {
        /// Class of the missing attachment.
        kind: AttachmentKind,
        /// Host path used as the attachment key.
        path: PathBuf,
    },

    /// Every slot of a device class is in use.
    #[error("no free {kind} slot available")]
    SlotsExhausted {
        /// Class of the exhausted device.
        kind: AttachmentKind,
    },

    /// The operation does not apply to the VM's guest family.
    #[error("{operation} is not supported for {os} guests")]
    Unsupported {
        /// Operation that was attempted.
        operation: &'static str,
        /// Guest family of the VM.
        os: GuestOs,
    },

    /// A host path cannot be used for the operation.
    #[error("invalid host path {path}: {reason}")]
    InvalidPath {
        /// Offending path.
        path: PathBuf,
        /// Why the path was rejected.
        reason: &'static str,
    },

    /// An internal lock was poisoned by a panicking thread.
    #[error("{resource} lock poisoned")]
    Poisoned {
        /// Resource guarded by the lock.
        resource: &'static str,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Top-level error type returned by the layer mounter.
#[derive(Debug, Error)]
pub enum StrataError {
    /// The caller supplied arguments the operation cannot accept.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the rejected argument.
        message: String,
    },

    /// Attaching a resource during composition failed.
    #[error("failed to attach {kind} {path}: {source}")]
    Attach {
        /// Class of the resource.
        kind: AttachmentKind,
        /// Host path of the resource.
        path: PathBuf,
        /// Underlying host failure.
        source: HostError,
    },

    /// Granting the VM access to the scratch disk failed.
    #[error("failed to grant VM {vm_id} access to {path}: {source}")]
    Grant {
        /// Identifier of the VM.
        vm_id: String,
        /// Host path of the scratch disk.
        path: PathBuf,
        /// Underlying host failure.
        source: HostError,
    },

    /// Resolving a shared layer's guest path or identifier failed.
    #[error("failed to resolve layer {path}: {source}")]
    Resolve {
        /// Host path of the layer.
        path: PathBuf,
        /// Underlying host failure.
        source: HostError,
    },

    /// A modify request submitted to the VM failed.
    #[error("{request} {resource} request failed: {source}")]
    HostProtocol {
        /// Resource tag of the request.
        resource: ResourceType,
        /// Verb of the request.
        request: RequestType,
        /// Underlying host failure.
        source: HostError,
    },

    /// Detaching a resource during decomposition failed.
    #[error("failed to detach {kind} {path}: {source}")]
    Detach {
        /// Class of the resource.
        kind: AttachmentKind,
        /// Host path of the resource.
        path: PathBuf,
        /// Underlying host failure.
        source: HostError,
    },

    /// One or more teardown steps failed.
    #[error(transparent)]
    Teardown(TeardownErrors),

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl StrataError {
    /// Returns whether this error rejected the caller's arguments.
    #[must_use]
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }
}

/// Every failure collected while tearing down a mount, in the order they
/// occurred.
#[derive(Debug, Default)]
pub struct TeardownErrors {
    failures: Vec<StrataError>,
}

impl TeardownErrors {
    /// Records a failure.
    pub fn push(&mut self, error: StrataError) {
        self.failures.push(error);
    }

    /// Returns whether no failure has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of recorded failures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Iterates the recorded failures in order.
    pub fn iter(&self) -> impl Iterator<Item = &StrataError> {
        self.failures.iter()
    }

    /// Converts the collection into `Ok(())` when empty, or a
    /// [`StrataError::Teardown`] otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Teardown`] when at least one failure was
    /// recorded.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(StrataError::Teardown(self))
        }
    }
}

impl fmt::Display for TeardownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} teardown failure(s)", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownErrors {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl<'a> IntoIterator for &'a TeardownErrors {
    type Item = &'a StrataError;
    type IntoIter = std::slice::Iter<'a, StrataError>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.iter()
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Result of an operation performed by an external collaborator.
pub type HostResult<T> = std::result::Result<T, HostError>;
