// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Incremental shipping of log files to the collector.
//!
//! Each call to [`Shipper::ship_once`] moves at most one bounded chunk of one
//! file:
//!
//! ```text
//!   checkpoint ──> reconcile identity ──> read chunk ──> envelope ──> gzip POST
//!        ^                                                              │
//!        └────── offset advanced on 200, attempt recorded otherwise ────┘
//! ```

pub mod client;
pub mod envelope;

use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use std::time::Instant;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::config::{Config, DEFAULT_MAX_BYTES_PER_SHIP};
use crate::identity::{reconcile, FileIdentity, IdentityError};
use crate::registry::LogInput;
use crate::rotate::time_window;
use crate::store::{Checkpoint, CheckpointStore, StoreError};
use client::CollectorClient;
use envelope::{Envelope, ShipFormat};

#[derive(Debug, Error)]
pub enum ShipError {
    #[error("no collector endpoint configured")]
    Unconfigured,
    #[error("checkpoint store is not available")]
    StoreUnavailable,
    #[error("{0} does not exist")]
    NotFound(PathBuf),
    #[error("file identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("unsupported ship format {0:?}")]
    InvalidFormat(String),
    #[error("{message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },
    #[error("checkpoint store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("http client: {0}")]
    Client(String),
}

/// Ships new bytes of registered inputs. Built once per configuration.
#[derive(Debug, Clone)]
pub struct Shipper {
    client: Option<CollectorClient>,
    device_id: String,
    hostname: String,
    max_bytes: u64,
    format: String,
}

impl Shipper {
    /// Builds the shipper and its HTTP client. A configuration without an
    /// endpoint yields a shipper whose every shipment fails with
    /// [`ShipError::Unconfigured`].
    pub fn new(config: &Config) -> Result<Self, ShipError> {
        let client = match config.endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => Some(CollectorClient::new(endpoint, config)?),
            _ => None,
        };
        Ok(Self {
            client,
            device_id: config.device_id.clone().unwrap_or_default(),
            hostname: hostname(),
            max_bytes: if config.max_bytes_per_ship == 0 {
                DEFAULT_MAX_BYTES_PER_SHIP
            } else {
                config.max_bytes_per_ship
            },
            format: config.ship_format.clone(),
        })
    }

    /// Ships the next unsent chunk of `input` and returns the checkpoint as it
    /// stands afterwards.
    ///
    /// The offset only advances when the collector answered 200. A failed
    /// attempt is recorded in the checkpoint and reported as
    /// [`ShipError::Transport`]; the same byte range is sent again next time.
    pub async fn ship_once(
        &self,
        input: &LogInput,
        store: Option<&CheckpointStore>,
    ) -> Result<Checkpoint, ShipError> {
        let Some(client) = &self.client else {
            return Err(ShipError::Unconfigured);
        };
        let Some(store) = store else {
            return Err(ShipError::StoreUnavailable);
        };

        let path = &input.path;
        let io_err = |source| ShipError::Io {
            path: path.clone(),
            source,
        };
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ShipError::NotFound(path.clone()))
            }
            Err(e) => return Err(io_err(e)),
        };
        let metadata = file.metadata().await.map_err(io_err)?;
        let identity = FileIdentity::from_metadata(&metadata)?;

        let stored = store.get(&input.package, &input.log_id, path)?;
        let mut checkpoint = stored
            .clone()
            .unwrap_or_else(|| Checkpoint::new(&input.package, &input.log_id, path));
        let offset = reconcile(&mut checkpoint, identity, metadata.len());

        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        let mut chunk = Vec::new();
        (&mut file)
            .take(self.max_bytes)
            .read_to_end(&mut chunk)
            .await
            .map_err(io_err)?;

        if chunk.is_empty() {
            if stored.as_ref() != Some(&checkpoint) {
                store.save(&checkpoint)?;
            }
            debug!("Nothing new in {} at offset {offset}", path.display());
            return Ok(checkpoint);
        }

        let format =
            ShipFormat::parse(&self.format).ok_or_else(|| ShipError::InvalidFormat(self.format.clone()))?;
        let text = String::from_utf8_lossy(&chunk);
        let sent = chunk.len() as u64;

        let mut envelope = Envelope {
            device_id: self.device_id.clone(),
            hostname: self.hostname.clone(),
            package: input.package.clone(),
            log_id: input.log_id.clone(),
            path: checkpoint.path.clone(),
            dev: identity.dev,
            inode: identity.inode,
            offset_start: offset,
            offset_end: offset + sent,
            sent_at: chrono::Utc::now().timestamp(),
            line_count: 0,
            lines: None,
            raw: None,
            window_start: None,
            window_end: None,
        };
        envelope.set_payload(&text, format);
        let window = input
            .timestamp_layout()
            .and_then(|layout| time_window(text.lines(), layout));
        if let Some((start, end)) = window {
            envelope.window_start = Some(start.timestamp());
            envelope.window_end = Some(end.timestamp());
        }
        let body = envelope.encode().map_err(io_err)?;

        let started = Instant::now();
        let result = client.post(body).await;
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        checkpoint.last_attempt_at = chrono::Utc::now().timestamp();
        checkpoint.last_bytes_sent = sent;
        checkpoint.last_duration_ms = elapsed;

        match result {
            Ok(()) => {
                checkpoint.last_offset = offset + sent;
                checkpoint.last_sent_at = checkpoint.last_attempt_at;
                checkpoint.last_status_code = 200;
                checkpoint.last_error.clear();
                checkpoint.last_lines_sent = envelope.line_count;
                checkpoint.last_window_start = envelope.window_start.unwrap_or(0);
                checkpoint.last_window_end = envelope.window_end.unwrap_or(0);
                store.save(&checkpoint)?;
                info!(
                    "Shipped {} bytes of {} ({}..{}) in {elapsed}ms",
                    sent,
                    path.display(),
                    offset,
                    offset + sent
                );
                Ok(checkpoint)
            }
            Err(failure) => {
                checkpoint.last_status_code = failure.status.unwrap_or(0);
                checkpoint.last_error.clone_from(&failure.message);
                if let Err(e) = store.save(&checkpoint) {
                    warn!("Failed to record shipping attempt for {}: {e}", path.display());
                }
                Err(ShipError::Transport {
                    status: failure.status,
                    message: failure.message,
                })
            }
        }
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}
