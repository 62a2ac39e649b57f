//! Library configuration
//!
//! Values are layered: built-in defaults, then `~/.scuttle.toml`, then `SCUTTLE_*`
//! environment variables. [`read`] loads them once per process; [`Config::load`]
//! always re-reads, and tests usually build a [`Config`] by hand.

use crate::errors::{ConfigError, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

/// Default sidecar image
pub const DEFAULT_REAPER_IMAGE: &str = "testcontainers/ryuk:0.11.0";

/// File name looked up in the user's home directory
pub const CONFIG_FILE_NAME: &str = ".scuttle.toml";

/// Effective library configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Disable the reaper sidecar entirely
    pub ryuk_disabled: bool,
    /// Run the sidecar privileged (needed on some rootless setups)
    pub ryuk_privileged: bool,
    /// Ask the sidecar to log verbosely
    pub ryuk_verbose: bool,
    /// How long to wait when dialing the sidecar
    #[serde(with = "duration_str")]
    pub ryuk_connection_timeout: Duration,
    /// How long the sidecar waits for a client to reconnect before reaping
    #[serde(with = "duration_str")]
    pub ryuk_reconnection_timeout: Duration,
    /// Sidecar image reference
    pub reaper_image: String,
    /// Registry prefix prepended to library-managed images
    pub hub_image_name_prefix: Option<String>,
    /// Address used to reach published ports
    pub host_override: Option<String>,
    /// Docker CLI binary
    pub docker_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ryuk_disabled: false,
            ryuk_privileged: false,
            ryuk_verbose: false,
            ryuk_connection_timeout: Duration::from_secs(60),
            ryuk_reconnection_timeout: Duration::from_secs(10),
            reaper_image: DEFAULT_REAPER_IMAGE.to_string(),
            hub_image_name_prefix: None,
            host_override: None,
            docker_path: "docker".to_string(),
        }
    }
}

impl Config {
    /// Load defaults, the home config file (if present) and environment overrides
    #[instrument]
    pub fn load() -> Result<Self> {
        let mut config = match default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        debug!(?config, "Loaded configuration");
        Ok(config)
    }

    /// Parse a TOML config file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| {
            ConfigError::Parsing {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Apply `SCUTTLE_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SCUTTLE_RYUK_DISABLED") {
            self.ryuk_disabled = parse_bool("SCUTTLE_RYUK_DISABLED", &v)?;
        }
        if let Some(v) = lookup("SCUTTLE_RYUK_CONTAINER_PRIVILEGED") {
            self.ryuk_privileged = parse_bool("SCUTTLE_RYUK_CONTAINER_PRIVILEGED", &v)?;
        }
        if let Some(v) = lookup("SCUTTLE_RYUK_VERBOSE") {
            self.ryuk_verbose = parse_bool("SCUTTLE_RYUK_VERBOSE", &v)?;
        }
        if let Some(v) = lookup("SCUTTLE_RYUK_CONNECTION_TIMEOUT") {
            self.ryuk_connection_timeout = parse_duration("SCUTTLE_RYUK_CONNECTION_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("SCUTTLE_RYUK_RECONNECTION_TIMEOUT") {
            self.ryuk_reconnection_timeout =
                parse_duration("SCUTTLE_RYUK_RECONNECTION_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("SCUTTLE_REAPER_IMAGE") {
            self.reaper_image = v;
        }
        if let Some(v) = lookup("SCUTTLE_HUB_IMAGE_NAME_PREFIX") {
            self.hub_image_name_prefix = non_empty(v);
        }
        if let Some(v) = lookup("SCUTTLE_HOST_OVERRIDE") {
            self.host_override = non_empty(v);
        }
        if let Some(v) = lookup("SCUTTLE_DOCKER_PATH") {
            self.docker_path = v;
        }
        Ok(())
    }

    /// Image reference with the hub prefix applied
    pub fn prefixed_image(&self, image: &str) -> String {
        match self.hub_image_name_prefix.as_deref() {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), image),
            None => image.to_string(),
        }
    }
}

static CONFIG: OnceCell<Config> = OnceCell::new();

/// Process-wide configuration, loaded on first use
pub fn read() -> Result<&'static Config> {
    CONFIG.get_or_try_init(Config::load)
}

/// `~/.scuttle.toml`, if a home directory can be determined
pub fn default_config_path() -> Option<PathBuf> {
    directories_next::BaseDirs::new().map(|dirs| dirs.home_dir().join(CONFIG_FILE_NAME))
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Parse `true/false/1/0/yes/no` (case-insensitive)
pub fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::Validation {
            key: key.to_string(),
            message: format!("expected a boolean, got '{}'", other),
        }
        .into()),
    }
}

/// Parse `250ms`, `5s`, `2m`, `1h` or a bare number of seconds
pub fn parse_duration(key: &str, raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let invalid = || ConfigError::Validation {
        key: key.to_string(),
        message: format!("expected a duration like '10s' or '250ms', got '{}'", raw),
    };

    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(3600)),
        _ => return Err(invalid().into()),
    };
    Ok(duration)
}

fn format_duration(duration: &Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}ms", millis)
    }
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration("duration", &raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.ryuk_disabled);
        assert_eq!(config.ryuk_connection_timeout, Duration::from_secs(60));
        assert_eq!(config.ryuk_reconnection_timeout, Duration::from_secs(10));
        assert_eq!(config.reaper_image, DEFAULT_REAPER_IMAGE);
        assert_eq!(config.docker_path, "docker");
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("k", "TRUE").unwrap());
        assert!(parse_bool("k", "yes").unwrap());
        assert!(!parse_bool("k", "0").unwrap());
        assert!(parse_bool("k", "maybe").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("k", "250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("k", "5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("k", "2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("k", "1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("k", "30").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("k", "soon").is_err());
        assert!(parse_duration("k", "5d").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            ("SCUTTLE_RYUK_DISABLED", "true"),
            ("SCUTTLE_RYUK_CONNECTION_TIMEOUT", "15s"),
            ("SCUTTLE_HUB_IMAGE_NAME_PREFIX", "mirror.local"),
            ("SCUTTLE_DOCKER_PATH", "/usr/local/bin/docker"),
        ]);
        let mut config = Config::default();
        config.apply_env(|k| vars.get(k).cloned()).unwrap();

        assert!(config.ryuk_disabled);
        assert_eq!(config.ryuk_connection_timeout, Duration::from_secs(15));
        assert_eq!(config.hub_image_name_prefix.as_deref(), Some("mirror.local"));
        assert_eq!(config.docker_path, "/usr/local/bin/docker");
    }

    #[test]
    fn test_invalid_env_value_is_error() {
        let vars = env(&[("SCUTTLE_RYUK_VERBOSE", "loud")]);
        let mut config = Config::default();
        let err = config.apply_env(|k| vars.get(k).cloned()).unwrap_err();
        assert!(err.to_string().contains("SCUTTLE_RYUK_VERBOSE"));
    }

    #[test]
    fn test_from_file_keeps_defaults_for_missing_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ryuk_privileged = true").unwrap();
        writeln!(file, "ryuk_reconnection_timeout = \"30s\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert!(config.ryuk_privileged);
        assert_eq!(config.ryuk_reconnection_timeout, Duration::from_secs(30));
        assert_eq!(config.reaper_image, DEFAULT_REAPER_IMAGE);
    }

    #[test]
    fn test_malformed_file_is_parsing_error() {
        let err = Config::from_toml_str("ryuk_disabled = [").unwrap_err();
        assert!(err.to_string().contains("Failed to parse configuration file"));
    }

    #[test]
    fn test_prefixed_image() {
        let mut config = Config::default();
        assert_eq!(config.prefixed_image("redis:7"), "redis:7");
        config.hub_image_name_prefix = Some("mirror.local/".to_string());
        assert_eq!(config.prefixed_image("redis:7"), "mirror.local/redis:7");
    }

    #[test]
    fn test_json_roundtrip_uses_duration_strings() {
        let json = serde_json::to_value(Config::default()).unwrap();
        assert_eq!(json["ryuk_connection_timeout"], "60s");
        let back: Config = serde_json::from_value(json).unwrap();
        assert_eq!(back, Config::default());
    }
}
