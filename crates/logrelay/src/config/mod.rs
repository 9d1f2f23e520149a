// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! Sources are applied in order, later sources overriding earlier ones:
//!
//! 1. **Defaults** - hard-coded in [`Config::default`]
//! 2. **JSON file** - `config.json` (a missing file is not an error)
//! 3. **Environment variables** - `LOGRELAY_*`, nested keys separated by `__`
//!    (`LOGRELAY_DEFAULTS__KEEP=5`)
//!
//! Numeric settings left at zero fall back to their defaults after all sources
//! were applied, see [`Config::apply_defaults`].

pub mod device_id;

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::scheduler::{DailyAt, Schedule};

pub const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/logrelay/config.json";
pub const DEFAULT_INPUTS_DIR: &str = "/usr/local/etc/logrelay/inputs.d";
pub const DEFAULT_STATE_PATH: &str = "/var/db/logrelay/state.db";
pub const DEFAULT_DEVICE_ID_PATH: &str = "/var/db/logrelay/device_id";

pub const ENV_PREFIX: &str = "LOGRELAY_";

pub const DEFAULT_AUTH_HEADER: &str = "X-Auth-Token";
pub const DEFAULT_ROTATE_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_SHIP_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_MAX_BYTES_PER_SHIP: u64 = 256 * 1024;
pub const DEFAULT_SHIP_FORMAT: &str = "lines";
pub const DEFAULT_MAX_SIZE_MB: u64 = 50;
pub const DEFAULT_KEEP: u32 = 10;
pub const DEFAULT_LICENSE_CHECK_SECS: u64 = 3600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration from {source_name}: {message}")]
    Parse {
        source_name: &'static str,
        message: String,
    },

    #[error("invalid rotate_at {0:?}: expected \"HH\" or \"HH:MM\"")]
    InvalidRotateAt(String),

    #[error("device id file {path}: {source}")]
    DeviceId {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// TLS settings of the collector connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    #[serde(deserialize_with = "deserialize_bool_lossy")]
    pub insecure_skip_verify: bool,
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
}

/// Rotation defaults applied to every input that does not override them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultPolicy {
    #[serde(deserialize_with = "deserialize_count_lossy")]
    pub max_size_mb: u64,
    #[serde(deserialize_with = "deserialize_count_lossy")]
    pub keep: u32,
    pub compress: Option<bool>,
    #[serde(deserialize_with = "deserialize_count_lossy")]
    pub max_age_days: u64,
    #[serde(deserialize_with = "deserialize_bool_lossy")]
    pub rotate_on_start: bool,
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        Self {
            max_size_mb: DEFAULT_MAX_SIZE_MB,
            keep: DEFAULT_KEEP,
            compress: Some(true),
            max_age_days: 0,
            rotate_on_start: false,
        }
    }
}

/// Settings of the local license service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    #[serde(deserialize_with = "deserialize_bool_lossy")]
    pub enabled: bool,
    pub package: String,
    pub socket_path: PathBuf,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub master_secret: Option<String>,
    pub unique_id_path: PathBuf,
    #[serde(deserialize_with = "deserialize_count_lossy")]
    pub check_interval_secs: u64,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            package: "logrelay".to_string(),
            socket_path: PathBuf::from("/var/run/license.sock"),
            master_secret: None,
            unique_id_path: PathBuf::from("/etc/machine-id"),
            check_interval_secs: DEFAULT_LICENSE_CHECK_SECS,
        }
    }
}

/// Agent-wide settings, see the module docs for how they are layered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_bool_lossy")]
    pub enabled: bool,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub auth_token: Option<String>,
    pub auth_header: String,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub device_id: Option<String>,
    #[serde(deserialize_with = "deserialize_count_lossy")]
    pub interval_rotate_seconds: u64,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub rotate_at: Option<String>,
    #[serde(deserialize_with = "deserialize_count_lossy")]
    pub ship_interval_hours: u64,
    #[serde(deserialize_with = "deserialize_count_lossy")]
    pub interval_ship_seconds: u64,
    #[serde(deserialize_with = "deserialize_count_lossy")]
    pub max_bytes_per_ship: u64,
    pub ship_format: String,
    #[serde(deserialize_with = "deserialize_bool_lossy")]
    pub dry_run: bool,
    pub log_level: String,
    pub tls: TlsConfig,
    pub defaults: DefaultPolicy,
    pub license: LicenseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            auth_token: None,
            auth_header: DEFAULT_AUTH_HEADER.to_string(),
            device_id: None,
            interval_rotate_seconds: DEFAULT_ROTATE_INTERVAL_SECS,
            rotate_at: None,
            ship_interval_hours: 0,
            interval_ship_seconds: 0,
            max_bytes_per_ship: DEFAULT_MAX_BYTES_PER_SHIP,
            ship_format: DEFAULT_SHIP_FORMAT.to_string(),
            dry_run: false,
            log_level: "info".to_string(),
            tls: TlsConfig::default(),
            defaults: DefaultPolicy::default(),
            license: LicenseConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from `path` and the process environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        ConfigBuilder::default()
            .add_source(Box::new(JsonConfigSource {
                path: path.to_path_buf(),
            }))
            .add_source(Box::new(EnvConfigSource))
            .build()
    }

    /// Replaces unset or non-positive numeric settings with their defaults.
    pub fn apply_defaults(&mut self) {
        if self.interval_rotate_seconds == 0 {
            self.interval_rotate_seconds = DEFAULT_ROTATE_INTERVAL_SECS;
        }
        if self.max_bytes_per_ship == 0 {
            self.max_bytes_per_ship = DEFAULT_MAX_BYTES_PER_SHIP;
        }
        if self.ship_format.trim().is_empty() {
            self.ship_format = DEFAULT_SHIP_FORMAT.to_string();
        }
        if self.auth_header.trim().is_empty() {
            self.auth_header = DEFAULT_AUTH_HEADER.to_string();
        }
        if self.defaults.max_size_mb == 0 {
            self.defaults.max_size_mb = DEFAULT_MAX_SIZE_MB;
        }
        if self.defaults.keep == 0 {
            self.defaults.keep = DEFAULT_KEEP;
        }
        if self.license.check_interval_secs == 0 {
            self.license.check_interval_secs = DEFAULT_LICENSE_CHECK_SECS;
        }
        if let Some(rotate_at) = &self.rotate_at {
            if rotate_at.trim().is_empty() {
                self.rotate_at = None;
            }
        }
    }

    /// Schedule of the rotate trigger: daily at `rotate_at` when set, otherwise
    /// every `interval_rotate_seconds`.
    pub fn rotate_schedule(&self) -> Result<Schedule, ConfigError> {
        Ok(match self.daily_rotate_at()? {
            Some(at) => Schedule::DailyAt(at),
            None => Schedule::Every(Duration::from_secs(self.interval_rotate_seconds.max(1))),
        })
    }

    /// Parsed `rotate_at`, if configured.
    pub fn daily_rotate_at(&self) -> Result<Option<DailyAt>, ConfigError> {
        self.rotate_at
            .as_deref()
            .map(|at| {
                DailyAt::parse(at).ok_or_else(|| ConfigError::InvalidRotateAt(at.to_string()))
            })
            .transpose()
    }

    /// Schedule of the ship trigger. Hours win over seconds, one hour otherwise.
    #[must_use]
    pub fn ship_schedule(&self) -> Schedule {
        Schedule::Every(self.ship_interval())
    }

    #[must_use]
    pub fn ship_interval(&self) -> Duration {
        if self.ship_interval_hours > 0 {
            Duration::from_secs(self.ship_interval_hours.saturating_mul(3600))
        } else if self.interval_ship_seconds > 0 {
            Duration::from_secs(self.interval_ship_seconds)
        } else {
            Duration::from_secs(DEFAULT_SHIP_INTERVAL_SECS)
        }
    }

    /// Checks the settings every daemon run needs and returns one message per
    /// problem found.
    #[must_use]
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.endpoint.as_deref().map_or(true, |e| e.trim().is_empty()) {
            problems.push("endpoint is not set".to_string());
        }
        if self
            .auth_token
            .as_deref()
            .map_or(true, |t| t.trim().is_empty())
        {
            problems.push("auth_token is not set".to_string());
        }
        if let Err(e) = self.daily_rotate_at() {
            problems.push(e.to_string());
        }
        if !matches!(self.ship_format.as_str(), "" | "lines" | "raw") {
            problems.push(format!("unsupported ship_format {:?}", self.ship_format));
        }
        problems
    }
}

/// Filesystem locations the agent works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub config_file: PathBuf,
    pub inputs_dir: PathBuf,
    pub state_path: PathBuf,
    pub device_id_path: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from(DEFAULT_CONFIG_PATH),
            inputs_dir: PathBuf::from(DEFAULT_INPUTS_DIR),
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            device_id_path: PathBuf::from(DEFAULT_DEVICE_ID_PATH),
        }
    }
}

#[allow(clippy::module_name_repetitions)]
pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    config: Config,
}

#[allow(clippy::module_name_repetitions)]
impl ConfigBuilder {
    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(mut self) -> Result<Config, ConfigError> {
        for source in &self.sources {
            source.load(&mut self.config)?;
        }
        self.config.apply_defaults();
        debug!("Configuration loaded from {} sources", self.sources.len());
        Ok(self.config)
    }
}

/// Layers a JSON file over the configuration built so far.
#[derive(Debug, PartialEq, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct JsonConfigSource {
    pub path: PathBuf,
}

impl ConfigSource for JsonConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        if !self.path.exists() {
            debug!("No configuration file at {}, using defaults", self.path.display());
            return Ok(());
        }
        let figment = Figment::from(Serialized::defaults(&*config)).merge(Json::file(&self.path));
        *config = figment.extract().map_err(|e| ConfigError::Parse {
            source_name: "json file",
            message: e.to_string(),
        })?;
        Ok(())
    }
}

/// Layers `LOGRELAY_*` environment variables over the configuration.
#[derive(Debug, PartialEq, Clone, Copy)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment =
            Figment::from(Serialized::defaults(&*config)).merge(Env::prefixed(ENV_PREFIX).split("__"));
        *config = figment.extract().map_err(|e| ConfigError::Parse {
            source_name: "environment",
            message: e.to_string(),
        })?;
        Ok(())
    }
}

/// Accepts strings and numbers; anything else, or a blank string, is `None`.
pub fn deserialize_optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Null => Ok(None),
        other => {
            warn!("Failed to parse value, expected a string, got: {other}, ignoring");
            Ok(None)
        }
    }
}

/// Accepts counts as numbers or numeric strings. Negative, fractional,
/// out-of-range or malformed values read as zero, which
/// [`Config::apply_defaults`] then replaces with the default.
pub fn deserialize_count_lossy<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64> + Default,
{
    let count = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        Value::Null => None,
        other => {
            warn!("Failed to parse value, expected a count, got: {other}, ignoring");
            None
        }
    };
    Ok(count.and_then(|n| T::try_from(n).ok()).unwrap_or_default())
}

/// Accepts booleans, numbers (non-zero is true) and the usual truthy strings.
pub fn deserialize_bool_lossy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        _ => false,
    })
}
