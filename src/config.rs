//! Configuration - typed options persisted as JSON
//!
//! Everything lives in one cache directory so a user reporting a problem
//! only has to zip a single folder: config, key maps and the daily logs all
//! sit next to each other.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::DEFAULT_NTP_SERVERS;

/// Errors from reading or writing the config file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read or written
    #[error("config file {path}: {source}")]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The file is not valid JSON for the config shape
    #[error("config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Network time options
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct NtpConfig {
    /// Whether background sync runs at all
    pub enabled: bool,

    /// Servers in preference order
    pub servers: Vec<String>,

    /// Per-server timeout in seconds
    pub timeout: f64,

    /// Servers asked per sync before giving up
    pub max_tries: usize,

    /// Seconds between background syncs
    pub resync_interval_sec: f64,

    /// Re-arm schedules when the target moves by more than this
    pub adjust_threshold_ms: f64,

    /// Fold the NTP-vs-system delta into scheduled fires
    pub include_delta: bool,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            servers: DEFAULT_NTP_SERVERS.iter().map(|s| s.to_string()).collect(),
            timeout: 1.5,
            max_tries: 3,
            resync_interval_sec: 1.0,
            adjust_threshold_ms: 5.0,
            include_delta: true,
        }
    }
}

/// Playback options
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Key map profile name, e.g. `piano`, `genshin`, `bass`, `drums`
    pub keymap_profile: String,

    /// Tempo multiplier performances start with
    pub tempo_default: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            keymap_profile: "piano".to_string(),
            tempo_default: 1.0,
        }
    }
}

/// The whole persisted configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Network time options
    pub ntp: NtpConfig,

    /// Playback options
    pub playback: PlaybackConfig,
}

impl Config {
    /// Load from a JSON file; unknown keys are ignored, missing ones default
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str::<Self>(&text)?.normalized())
    }

    /// Load, or fall back to defaults with a warning
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(error) => {
                warn!("using default configuration: {error}");
                Self::default()
            }
        }
    }

    /// Persist as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Clamp every option into its documented range
    pub fn normalized(mut self) -> Self {
        self.ntp.resync_interval_sec = self.ntp.resync_interval_sec.clamp(0.2, 10.0);
        self.ntp.adjust_threshold_ms = self.ntp.adjust_threshold_ms.max(0.0);
        self.ntp.timeout = self.ntp.timeout.clamp(0.1, 30.0);
        self.ntp.max_tries = self.ntp.max_tries.max(1);
        self.playback.tempo_default = self.playback.tempo_default.clamp(0.25, 3.0);
        self
    }
}

/// Path to the cache location, based on OS convention
///
/// Config, key maps and logs all land here; one directory entry to collect
/// when a user needs to report a bug.
pub fn cache_path() -> PathBuf {
    let path = dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pianola");
    let _ = std::fs::create_dir_all(&path);
    path
}

/// Default location of the config file
pub fn default_config_path() -> PathBuf {
    cache_path().join("config.json")
}

/// Default location of the editable key map
pub fn default_keymap_path() -> PathBuf {
    cache_path().join("keymap.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert!(config.ntp.enabled);
        assert_eq!(config.ntp.timeout, 1.5);
        assert_eq!(config.ntp.max_tries, 3);
        assert_eq!(config.ntp.resync_interval_sec, 1.0);
        assert_eq!(config.ntp.adjust_threshold_ms, 5.0);
        assert!(config.ntp.include_delta);
        assert_eq!(config.playback.keymap_profile, "piano");
        assert_eq!(config.playback.tempo_default, 1.0);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"ntp": {"enabled": false}}"#).unwrap();
        assert!(!config.ntp.enabled);
        assert_eq!(config.ntp.max_tries, 3);
        assert_eq!(config.playback.keymap_profile, "piano");
    }

    #[test]
    fn normalization_clamps_out_of_range_values() {
        let mut config = Config::default();
        config.ntp.resync_interval_sec = 0.01;
        config.playback.tempo_default = 9.0;
        config.ntp.max_tries = 0;
        let normalized = config.normalized();
        assert_eq!(normalized.ntp.resync_interval_sec, 0.2);
        assert_eq!(normalized.playback.tempo_default, 3.0);
        assert_eq!(normalized.ntp.max_tries, 1);
    }

    #[test]
    fn json_round_trip_preserves_settings() {
        let path = std::env::temp_dir().join(format!("pianola-config-{}.json", std::process::id()));
        let mut config = Config::default();
        config.ntp.servers = vec!["ntp.example.org".to_string()];
        config.playback.tempo_default = 1.5;
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = std::fs::remove_file(&path);
    }
}
