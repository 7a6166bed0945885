use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// JSON document backing the station store.
    #[serde(default = "default_storage_file")]
    pub storage_file: PathBuf,
    /// TCP port UI clients attach to.
    #[serde(default = "default_daemon_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Where the core station catalog comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Remote JSON catalog fetched at startup.  Unset means bundled only.
    #[serde(default)]
    pub url: Option<String>,
    /// Local catalog used when the fetch fails, before the compiled-in copy.
    #[serde(default)]
    pub bundled_path: Option<PathBuf>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

/// Order in which `next`/`prev` walk the stations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NavigationOrder {
    /// Every station in store order (core catalog, then user stations),
    /// hidden core stations included.
    #[default]
    Catalog,
    /// Like `Catalog`, but hidden core stations are skipped.
    Visible,
    /// Favorites in their saved order, then the remaining stations.
    FavoritesFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Volume used before anything was persisted (0-100).
    #[serde(default = "default_volume")]
    pub default_volume: u8,
    #[serde(default = "default_volume_step")]
    pub volume_step: u8,
    /// Stream errors tolerated per station before entering the Error state.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Seconds in Buffering before it counts as a stream error.  0 disables.
    #[serde(default = "default_buffering_timeout_secs")]
    pub buffering_timeout_secs: u64,
    #[serde(default)]
    pub navigation: NavigationOrder,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            storage_file: default_storage_file(),
            port: default_daemon_port(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: None,
            bundled_path: None,
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            volume_step: default_volume_step(),
            max_attempts: default_max_attempts(),
            buffering_timeout_secs: default_buffering_timeout_secs(),
            navigation: NavigationOrder::default(),
        }
    }
}

fn default_storage_file() -> PathBuf {
    platform::data_dir().join("storage.json")
}

fn default_daemon_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8989
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_volume() -> u8 {
    80
}

fn default_volume_step() -> u8 {
    5
}

fn default_max_attempts() -> u32 {
    10
}

fn default_buffering_timeout_secs() -> u64 {
    15
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
