//! Engine configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/lumen/config.toml)
//! 3. Environment variables (LUMEN_* prefix)
//!
//! Environment variables take precedence over config file values. The relay
//! endpoint is always injected through this layer; nothing in the engine
//! hardcodes a server address.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix
const ENV_PREFIX: &str = "LUMEN";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory for durable storage (SQLite database)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Relay server endpoint, e.g. `ws://localhost:9090` (optional)
    #[serde(default)]
    pub relay_url: Option<String>,

    /// Whether the network provider should run
    #[serde(default)]
    pub sync_enabled: bool,

    /// Update-log entries per project before compacting into a snapshot
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            relay_url: None,
            sync_enabled: false,
            compact_threshold: default_compact_threshold(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from the default location.
    ///
    /// `LUMEN_*` environment variables override file values, which override
    /// defaults. The file location itself can be moved with `LUMEN_CONFIG`.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path, falling back to defaults
    /// when the file does not exist. Environment overrides still apply.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: SyncConfig =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // An empty LUMEN_RELAY_URL clears any configured endpoint
        if let Ok(val) = std::env::var(format!("{}_RELAY_URL", ENV_PREFIX)) {
            self.relay_url = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_ENABLED", ENV_PREFIX)) {
            self.sync_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with LUMEN_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lumen")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("lumen.db")
    }
}

/// Connection settings for the network provider.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Relay endpoint, e.g. `ws://localhost:9090`
    pub endpoint: String,
    /// Room to join; one room per project id
    pub room: String,
    /// Delay before the first reconnect attempt
    pub initial_reconnect_delay: Duration,
    /// Ceiling for the exponential backoff
    pub max_reconnect_delay: Duration,
}

impl NetworkConfig {
    pub fn new(endpoint: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            room: room.into(),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }

    /// The full websocket URL for this room.
    pub fn room_url(&self) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), self.room)
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lumen")
}

fn default_compact_threshold() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Environment variables are process-global; tests that touch them take
    // this lock and restore the previous values on drop.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap();
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &["LUMEN_DATA_DIR", "LUMEN_RELAY_URL", "LUMEN_SYNC_ENABLED"];

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.sync_enabled);
        assert!(config.relay_url.is_none());
        assert_eq!(config.compact_threshold, 64);
        assert!(config.data_dir.ends_with("lumen"));
    }

    #[test]
    fn test_sqlite_path() {
        let config = SyncConfig::default();
        assert!(config.sqlite_path().ends_with("lumen.db"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = SyncConfig::default();

        env::set_var("LUMEN_DATA_DIR", "/tmp/lumen-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/lumen-test"));
    }

    #[test]
    fn test_env_override_sync_enabled() {
        let _guard = EnvGuard::new(ENV_VARS);

        // Both "true" and "1" enable; anything else disables
        for (value, expected) in [("true", true), ("1", true), ("false", false), ("no", false)] {
            let mut config = SyncConfig::default();
            env::set_var("LUMEN_SYNC_ENABLED", value);
            config.apply_env_overrides();
            assert_eq!(config.sync_enabled, expected, "LUMEN_SYNC_ENABLED={}", value);
        }
    }

    #[test]
    fn test_env_override_relay_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = SyncConfig::default();
        assert!(config.relay_url.is_none());

        env::set_var("LUMEN_RELAY_URL", "ws://localhost:9090");
        config.apply_env_overrides();
        assert_eq!(config.relay_url, Some("ws://localhost:9090".to_string()));

        // Empty string clears it
        env::set_var("LUMEN_RELAY_URL", "");
        config.apply_env_overrides();
        assert!(config.relay_url.is_none());
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = SyncConfig {
            data_dir: PathBuf::from("/data/lumen"),
            relay_url: Some("ws://sync.example.com".to_string()),
            sync_enabled: true,
            compact_threshold: 32,
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("relay_url"));
        assert!(toml_str.contains("sync_enabled"));

        let parsed: SyncConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.data_dir, config.data_dir);
        assert_eq!(parsed.relay_url, config.relay_url);
        assert_eq!(parsed.sync_enabled, config.sync_enabled);
        assert_eq!(parsed.compact_threshold, 32);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            relay_url = "ws://example.com"
            sync_enabled = true
        "#;

        let config = SyncConfig::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.relay_url, Some("ws://example.com".to_string()));
        assert!(config.sync_enabled);
        assert_eq!(config.compact_threshold, 64);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = SyncConfig::load_from_path(&path).unwrap();
        // Missing file falls back to defaults
        assert!(!config.sync_enabled);
        assert!(config.relay_url.is_none());
    }

    #[test]
    fn test_room_url() {
        let net = NetworkConfig::new("ws://localhost:9090/", "project-42");
        assert_eq!(net.room_url(), "ws://localhost:9090/project-42");
        assert_eq!(net.initial_reconnect_delay, Duration::from_secs(1));
        assert_eq!(net.max_reconnect_delay, Duration::from_secs(30));
    }
}
