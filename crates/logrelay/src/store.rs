// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sled-backed checkpoint storage.
//!
//! One JSON record per logical log, keyed by `(package, log_id, path)`. The
//! key is the JSON encoding of that tuple, so field contents can never make two
//! distinct tuples collide.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sled::{Config as SledConfig, Db, Tree};
use thiserror::Error;
use tracing::debug;

use crate::identity::FileIdentity;

/// Tree holding all checkpoints.
pub const TREE_CHECKPOINTS: &str = "checkpoints";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("checkpoint database {0} is locked by another process")]
    Locked(PathBuf),
    #[error("checkpoint store is open read-only")]
    ReadOnly,
}

/// Shipping and rotation progress of one logical log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Checkpoint {
    pub package: String,
    pub log_id: String,
    pub path: String,
    pub identity: FileIdentity,
    pub last_offset: u64,
    pub last_sent_at: i64,
    pub last_error: String,
    pub last_attempt_at: i64,
    pub last_status_code: u16,
    pub last_bytes_sent: u64,
    pub last_duration_ms: u64,
    pub last_rotate_at: i64,
    pub last_lines_sent: u64,
    pub last_window_start: i64,
    pub last_window_end: i64,
}

impl Checkpoint {
    #[must_use]
    pub fn new(package: &str, log_id: &str, path: &Path) -> Self {
        Self {
            package: package.to_string(),
            log_id: log_id.to_string(),
            path: path.to_string_lossy().into_owned(),
            ..Self::default()
        }
    }
}

/// Persistent checkpoints, one record per `(package, log_id, path)`.
///
/// Backed by a sled database, which allows a single process to hold it open.
/// A read-only store never writes and may have no database at all.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    /// `None` for a read-only handle on a database that does not exist.
    inner: Option<(Db, Tree)>,
    path: PathBuf,
    read_only: bool,
}

impl CheckpointStore {
    /// Opens (or creates) the database at `path` for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories.
                fs::create_dir_all(parent)?;
            }
        }
        let (db, tree) = open_db(&path)?;
        Ok(Self {
            inner: Some((db, tree)),
            path,
            read_only: false,
        })
    }

    /// Opens the database at `path` for inspection without creating it.
    ///
    /// A missing database yields an empty store. A database held by a running
    /// agent yields [`StoreError::Locked`].
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let inner = if path.exists() {
            Some(open_db(&path)?)
        } else {
            debug!("Checkpoint database {} does not exist", path.display());
            None
        };
        Ok(Self {
            inner,
            path,
            read_only: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn get(
        &self,
        package: &str,
        log_id: &str,
        path: &Path,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let Some((_, tree)) = &self.inner else {
            return Ok(None);
        };
        let key = checkpoint_key(package, log_id, &path.to_string_lossy())?;
        match tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The stored checkpoint, or a fresh one for a log never seen before.
    pub fn get_or_default(
        &self,
        package: &str,
        log_id: &str,
        path: &Path,
    ) -> Result<Checkpoint, StoreError> {
        Ok(self
            .get(package, log_id, path)?
            .unwrap_or_else(|| Checkpoint::new(package, log_id, path)))
    }

    /// Upserts `checkpoint` and flushes it to disk.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let Some((db, tree)) = self.inner.as_ref().filter(|_| !self.read_only) else {
            return Err(StoreError::ReadOnly);
        };
        let key = checkpoint_key(&checkpoint.package, &checkpoint.log_id, &checkpoint.path)?;
        let value = serde_json::to_vec(checkpoint)?;
        tree.insert(key, value)?;
        db.flush()?;
        Ok(())
    }
}

fn checkpoint_key(package: &str, log_id: &str, path: &str) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(&(package, log_id, path))?)
}

fn sled_config(path: &Path) -> SledConfig {
    SledConfig::new().path(path).cache_capacity(8 * 1024 * 1024)
}

fn open_db(path: &Path) -> Result<(Db, Tree), StoreError> {
    let db = sled_config(path)
        .open()
        .map_err(|err| classify_open_error(path, err))?;
    let tree = db.open_tree(TREE_CHECKPOINTS)?;
    Ok((db, tree))
}

/// sled reports a held database lock as a plain IO error.
fn classify_open_error(path: &Path, err: sled::Error) -> StoreError {
    match err {
        sled::Error::Io(io)
            if io.kind() == ErrorKind::WouldBlock
                || io.to_string().to_lowercase().contains("lock") =>
        {
            StoreError::Locked(path.to_path_buf())
        }
        other => StoreError::Db(other),
    }
}
