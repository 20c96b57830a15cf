//! Configuration for media-catalog

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("media-catalog")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the catalog database and config file
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// SQLite database file name inside `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// External reference sources, most authoritative first.
    /// Sources not listed here are consulted after these, in the order supplied.
    #[serde(default = "default_source_preference")]
    pub source_preference: Vec<String>,

    /// Result cap for a smart list query without its own limit
    #[serde(default = "default_smart_list_limit")]
    pub smart_list_limit: u32,

    /// Upper bound on a single smart list catalog query
    #[serde(default = "default_refresh_timeout")]
    pub smart_refresh_timeout_secs: u64,

    /// Smart lists older than this are picked up by `refresh-due`
    #[serde(default = "default_refresh_max_age")]
    pub smart_refresh_max_age_secs: u64,

    /// Maximum list title length in characters
    #[serde(default = "default_max_title_length")]
    pub max_title_length: usize,

    /// Event bus channel capacity
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_database_file() -> String {
    "catalog.db".to_string()
}

fn default_source_preference() -> Vec<String> {
    ["imdb", "tmdb", "tvdb", "musicbrainz", "spotify", "plex"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_smart_list_limit() -> u32 {
    500
}

fn default_refresh_timeout() -> u64 {
    30
}

fn default_refresh_max_age() -> u64 {
    3600
}

fn default_max_title_length() -> usize {
    500
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
            source_preference: default_source_preference(),
            smart_list_limit: default_smart_list_limit(),
            smart_refresh_timeout_secs: default_refresh_timeout(),
            smart_refresh_max_age_secs: default_refresh_max_age(),
            max_title_length: default_max_title_length(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get catalog database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database_file)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}
