//! Console settings – reads/writes `~/.teleop/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use teleop_perception::PointCloudConfig;
use teleop_runtime::LatencyTestConfig;
use teleop_transport::TransportConfig;
use teleop_types::TeleopError;

/// Persisted console configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory latency CSV files are written to.
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub point_cloud: PointCloudConfig,

    #[serde(default)]
    pub latency: LatencyTestConfig,
}

fn default_export_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            export_dir: default_export_dir(),
            transport: TransportConfig::default(),
            point_cloud: PointCloudConfig::default(),
            latency: LatencyTestConfig::default(),
        }
    }
}

/// Return the path to `~/.teleop/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".teleop").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, TeleopError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, TeleopError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        TeleopError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| TeleopError::Config(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(Some(cfg))
}

/// Apply `TELEOP_*` overrides read through `var`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TELEOP_CONTROL_URL` | `transport.endpoints.control` |
/// | `TELEOP_TELEMETRY_URL` | `transport.endpoints.telemetry` |
/// | `TELEOP_STREAMING_URL` | `transport.endpoints.streaming` |
/// | `TELEOP_SIGNALING_URL` | `transport.endpoints.signaling` |
/// | `TELEOP_RECONNECT_MS` | `transport.reconnect_interval_ms` |
/// | `TELEOP_ENCODING` | `transport.encoding` |
pub fn apply_env_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    let endpoints = &mut cfg.transport.endpoints;
    if let Some(v) = var("TELEOP_CONTROL_URL") {
        endpoints.control = v;
    }
    if let Some(v) = var("TELEOP_TELEMETRY_URL") {
        endpoints.telemetry = v;
    }
    if let Some(v) = var("TELEOP_STREAMING_URL") {
        endpoints.streaming = v;
    }
    if let Some(v) = var("TELEOP_SIGNALING_URL") {
        endpoints.signaling = v;
    }
    if let Some(v) = var("TELEOP_RECONNECT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.transport.reconnect_interval_ms = ms;
    }
    if let Some(v) = var("TELEOP_ENCODING") {
        cfg.transport.encoding = v;
    }
}

/// Save the config to disk, creating `~/.teleop/` if necessary.
pub fn save(cfg: &Config) -> Result<(), TeleopError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), TeleopError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            TeleopError::Config(format!("failed to create config directory: {e}"))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                TeleopError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| TeleopError::Config(format!("failed to serialize config: {e}")))?;
    let write_err =
        |e: std::io::Error| TeleopError::Config(format!("failed to write {}: {e}", path.display()));
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
