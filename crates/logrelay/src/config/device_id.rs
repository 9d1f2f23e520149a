// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistent device identifier attached to every shipment.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::info;

use super::{Config, ConfigError};

/// Makes sure `config.device_id` is set.
///
/// A configured id wins. Otherwise the id stored at `path` is used, and when
/// there is none a random one is generated and written there.
pub fn ensure_device_id(config: &mut Config, path: &Path) -> Result<String, ConfigError> {
    if let Some(id) = config.device_id.as_deref().filter(|id| !id.trim().is_empty()) {
        return Ok(id.trim().to_string());
    }

    let io_err = |source| ConfigError::DeviceId {
        path: path.to_path_buf(),
        source,
    };

    let id = match fs::read_to_string(path) {
        Ok(stored) if !stored.trim().is_empty() => stored.trim().to_string(),
        Ok(_) => generate(path).map_err(io_err)?,
        Err(e) if e.kind() == ErrorKind::NotFound => generate(path).map_err(io_err)?,
        Err(e) => return Err(io_err(e)),
    };
    config.device_id = Some(id.clone());
    Ok(id)
}

fn generate(path: &Path) -> std::io::Result<String> {
    let id = uuid::Uuid::new_v4().simple().to_string();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, format!("{id}\n"))?;
    info!("Generated device id {id} at {}", path.display());
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_id_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("device_id");
        let mut config = Config {
            device_id: Some("configured".to_string()),
            ..Config::default()
        };
        assert_eq!(ensure_device_id(&mut config, &path).expect("id"), "configured");
        assert!(!path.exists());
    }

    #[test]
    fn test_generated_id_is_persisted_and_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("device_id");

        let mut first = Config::default();
        let id = ensure_device_id(&mut first, &path).expect("id");
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(first.device_id.as_deref(), Some(id.as_str()));

        let mut second = Config::default();
        assert_eq!(ensure_device_id(&mut second, &path).expect("id"), id);
    }
}
