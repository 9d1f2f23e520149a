// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Input registry.
//!
//! Every package that wants its logs handled drops a `*.json` descriptor into
//! the inputs directory. A descriptor holds either a list of inputs, a single
//! input, or an object with an `inputs` list:
//!
//! ```json
//! { "inputs": [
//!     { "package": "web", "log_id": "access", "path": "/var/log/web/access.log",
//!       "policy": { "max_size_mb": 10, "keep": 5 },
//!       "timestamp_layout": "%Y-%m-%dT%H:%M:%S%z",
//!       "post_rotate_pidfile": "/var/run/web.pid", "post_rotate_signal": "USR1" }
//! ] }
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::deserialize_count_lossy;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read inputs from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid input descriptor {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

/// Per-input overrides of the rotation defaults. Zero and `None` mean "use the
/// default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputPolicy {
    #[serde(skip_serializing_if = "is_zero")]
    #[serde(deserialize_with = "deserialize_count_lossy")]
    pub max_size_mb: u64,
    #[serde(skip_serializing_if = "is_zero_u32")]
    #[serde(deserialize_with = "deserialize_count_lossy")]
    pub keep: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
    #[serde(skip_serializing_if = "is_zero")]
    #[serde(deserialize_with = "deserialize_count_lossy")]
    pub max_age_days: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ship_enabled: Option<bool>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(v: &u64) -> bool {
    *v == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

/// A log file registered for rotation and shipping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogInput {
    pub package: String,
    pub log_id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub policy: InputPolicy,
    /// chrono format of the timestamp every line starts with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_layout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_rotate_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_rotate_pidfile: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_rotate_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_rotate_signal: Option<String>,
    /// Descriptor file this input was loaded from.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// What to do after an input's file was rotated so its writer reopens it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostRotateAction {
    Command(String),
    Pidfile { path: PathBuf, signal: Option<String> },
    Match { pattern: String, signal: Option<String> },
}

impl LogInput {
    #[must_use]
    pub fn new(package: &str, log_id: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            package: package.to_string(),
            log_id: log_id.to_string(),
            path: path.into(),
            policy: InputPolicy::default(),
            timestamp_layout: None,
            post_rotate_command: None,
            post_rotate_pidfile: None,
            post_rotate_match: None,
            post_rotate_signal: None,
            source: None,
        }
    }

    /// Shipping is on unless the input opts out.
    #[must_use]
    pub fn ship_enabled(&self) -> bool {
        self.policy.ship_enabled.unwrap_or(true)
    }

    #[must_use]
    pub fn timestamp_layout(&self) -> Option<&str> {
        self.timestamp_layout
            .as_deref()
            .filter(|layout| !layout.trim().is_empty())
    }

    /// The configured post-rotation action. A command wins over a pidfile,
    /// which wins over a process match.
    #[must_use]
    pub fn post_rotate(&self) -> Option<PostRotateAction> {
        let non_empty = |s: &Option<String>| s.clone().filter(|s| !s.trim().is_empty());
        if let Some(command) = non_empty(&self.post_rotate_command) {
            return Some(PostRotateAction::Command(command));
        }
        if let Some(path) = self
            .post_rotate_pidfile
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
        {
            return Some(PostRotateAction::Pidfile {
                path,
                signal: non_empty(&self.post_rotate_signal),
            });
        }
        non_empty(&self.post_rotate_match).map(|pattern| PostRotateAction::Match {
            pattern,
            signal: non_empty(&self.post_rotate_signal),
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InputFile {
    Many(Vec<LogInput>),
    One(LogInput),
    Wrapped { inputs: Vec<LogInput> },
}

/// Loads every `*.json` descriptor in `dir`, in file name order. A missing
/// directory yields no inputs.
pub fn load_inputs(dir: &Path) -> Result<Vec<LogInput>, RegistryError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Inputs directory {} does not exist", dir.display());
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(RegistryError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| RegistryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();

    let mut inputs = Vec::new();
    for path in files {
        inputs.extend(parse_input_file(&path)?);
    }
    debug!("Loaded {} inputs from {}", inputs.len(), dir.display());
    Ok(inputs)
}

fn parse_input_file(path: &Path) -> Result<Vec<LogInput>, RegistryError> {
    let data = fs::read(path).map_err(|source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: InputFile = serde_json::from_slice(&data).map_err(|e| RegistryError::Invalid {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let mut inputs = match parsed {
        InputFile::Many(inputs) | InputFile::Wrapped { inputs } => inputs,
        InputFile::One(input) => vec![input],
    };
    for input in &mut inputs {
        input.source = Some(path.to_path_buf());
    }
    Ok(inputs)
}
