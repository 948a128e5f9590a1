//! The ordered layer stack of one container.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_common::error::{Result, StrataError};

/// Read-only layers (base first, outermost last) plus the container's
/// writable scratch folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerStack {
    read_only: Vec<PathBuf>,
    scratch: PathBuf,
}

impl LayerStack {
    /// Creates a stack from its read-only layers and scratch folder.
    #[must_use]
    pub fn new(read_only: Vec<PathBuf>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            read_only,
            scratch: scratch.into(),
        }
    }

    /// Splits a folder list in the `base, [layer..], scratch` convention.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::InvalidArgument`] if `folders` is empty.
    pub fn from_folders<I, P>(folders: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut read_only: Vec<PathBuf> = folders.into_iter().map(Into::into).collect();
        let scratch = read_only.pop().ok_or_else(|| StrataError::InvalidArgument {
            message: "layer folder list is empty".into(),
        })?;
        Ok(Self { read_only, scratch })
    }

    /// Read-only layers, base first.
    #[must_use]
    pub fn read_only(&self) -> &[PathBuf] {
        &self.read_only
    }

    /// The writable scratch folder.
    #[must_use]
    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    /// Total number of folders, scratch included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_only.len() + 1
    }

    /// Always `false`: a stack holds at least its scratch folder.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Returns every folder in `base, [layer..], scratch` order.
    #[must_use]
    pub fn folders(&self) -> Vec<PathBuf> {
        let mut folders = self.read_only.clone();
        folders.push(self.scratch.clone());
        folders
    }

    pub(crate) fn require_read_only(&self, operation: &str) -> Result<()> {
        if self.read_only.is_empty() {
            return Err(StrataError::InvalidArgument {
                message: format!(
                    "{operation} needs at least two layers - base and scratch, got {}",
                    self.len()
                ),
            });
        }
        Ok(())
    }
}
