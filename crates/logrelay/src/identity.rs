// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! File identity tracking.
//!
//! A log path keeps its name across rotations while the file behind it is
//! replaced. The device and inode pair tells the two apart, so a checkpoint
//! recorded against the old file is never applied to the new one.

use std::fs::Metadata;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::store::Checkpoint;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("file identity is not available on this platform")]
    Unavailable,

    #[error("failed to stat {0}")]
    Io(#[from] std::io::Error),
}

/// Device and inode of a file. The zero value means "not known yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub dev: u64,
    pub inode: u64,
}

impl FileIdentity {
    /// The identity of a file that was never observed.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.dev == 0 && self.inode == 0
    }

    #[cfg(unix)]
    #[allow(clippy::unnecessary_wraps)]
    pub fn from_metadata(metadata: &Metadata) -> Result<Self, IdentityError> {
        use std::os::unix::fs::MetadataExt;
        Ok(Self {
            dev: metadata.dev(),
            inode: metadata.ino(),
        })
    }

    #[cfg(not(unix))]
    pub fn from_metadata(_metadata: &Metadata) -> Result<Self, IdentityError> {
        Err(IdentityError::Unavailable)
    }
}

/// Reads the identity of the file at `path` without opening it.
pub fn identity_of(path: &Path) -> Result<FileIdentity, IdentityError> {
    let metadata = std::fs::metadata(path)?;
    FileIdentity::from_metadata(&metadata)
}

/// Aligns `checkpoint` with the file currently at its path and returns the
/// offset to resume reading from.
///
/// A different identity means the file was replaced: reading restarts at 0.
/// A zero stored identity is adopted as is. An offset past the end of the file
/// means it was truncated in place, which also restarts at 0.
pub fn reconcile(checkpoint: &mut Checkpoint, current: FileIdentity, size: u64) -> u64 {
    if checkpoint.identity != current {
        if !checkpoint.identity.is_zero() {
            checkpoint.last_offset = 0;
        }
        checkpoint.identity = current;
    }
    if checkpoint.last_offset > size {
        checkpoint.last_offset = 0;
    }
    checkpoint.last_offset
}
