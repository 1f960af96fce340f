//! # bdup-config
//!
//! Configuration management for the bdup btrfs client.
//!
//! Loads configuration from:
//! 1. `~/.bdup/config.toml` (global)
//! 2. `.bdup/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};
use tracing::debug;

pub use logging::{init_logging, Component, LogLevel};

/// Kernel cap mirrored by the tree search request size.
pub const DEFAULT_ITEMS_PER_PAGE: u32 = 4096;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> RwLockReadGuard<'static, Config> {
    // A poisoned lock still holds a fully written Config.
    CONFIG.read().unwrap_or_else(|e| e.into_inner())
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(|e| e.into_inner()) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub search: SearchConfig,
    pub ino_paths: InoPathsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::from_file(&global_path)?;
            }
        }

        let project_path = Path::new(".bdup/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let project_config = Self::from_file(project_path)?;
            config.merge(project_config);
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a single TOML file, missing sections take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.bdup/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".bdup/config.toml"))
    }

    /// Merge a project config over this one. Only values that differ from
    /// the defaults replace ours.
    pub fn merge(&mut self, other: Config) {
        let defaults = Config::default();
        if other.search.items_per_page != defaults.search.items_per_page {
            self.search.items_per_page = other.search.items_per_page;
        }
        if other.ino_paths.initial_buffer != defaults.ino_paths.initial_buffer {
            self.ino_paths.initial_buffer = other.ino_paths.initial_buffer;
        }
        if other.ino_paths.max_buffer != defaults.ino_paths.max_buffer {
            self.ino_paths.max_buffer = other.ino_paths.max_buffer;
        }
        if other.logging.level != defaults.logging.level {
            self.logging.level = other.logging.level;
        }
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(items) = std::env::var("BDUP_ITEMS_PER_PAGE") {
            if let Ok(n) = items.parse() {
                self.search.items_per_page = n;
            }
        }
        if let Ok(max) = std::env::var("BDUP_INO_PATHS_MAX_BUFFER") {
            if let Ok(n) = max.parse() {
                self.ino_paths.max_buffer = n;
            }
        }
        if let Ok(level) = std::env::var("BDUP_LOG") {
            if let Some(level) = LogLevel::parse(&level) {
                self.logging.level = level;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Tree search configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Items requested per tree search round trip
    pub items_per_page: u32,
}

impl SearchConfig {
    /// Request size actually sent to the kernel: at least one item, at most
    /// the per-call cap.
    pub fn effective_items_per_page(&self) -> u32 {
        self.items_per_page.clamp(1, DEFAULT_ITEMS_PER_PAGE)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            items_per_page: DEFAULT_ITEMS_PER_PAGE,
        }
    }
}

/// Inode-to-paths output buffer sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InoPathsConfig {
    /// Size of the first output buffer handed to the kernel
    pub initial_buffer: usize,
    /// Upper bound when growing the buffer for a retry
    pub max_buffer: usize,
}

impl Default for InoPathsConfig {
    fn default() -> Self {
        Self {
            initial_buffer: 4096,
            max_buffer: 64 * 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.search.items_per_page, 4096);
        assert_eq!(config.ino_paths.initial_buffer, 4096);
        assert!(config.ino_paths.max_buffer >= config.ino_paths.initial_buffer);
        assert_eq!(config.logging.level, LogLevel::Warn);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[search]"));
        assert!(toml_str.contains("[ino_paths]"));
        assert!(toml_str.contains("items_per_page = 4096"));
        assert!(toml_str.contains("level = \"warn\""));
    }

    #[test]
    fn test_zero_items_per_page_is_clamped() {
        let search = SearchConfig { items_per_page: 0 };
        assert_eq!(search.effective_items_per_page(), 1);
    }

    #[test]
    fn test_oversized_items_per_page_is_capped() {
        let search = SearchConfig {
            items_per_page: 1_000_000,
        };
        assert_eq!(search.effective_items_per_page(), DEFAULT_ITEMS_PER_PAGE);
    }

    #[test]
    fn test_merge_keeps_global_values_left_at_default() {
        let mut global = Config::default();
        global.search.items_per_page = 128;

        let mut project = Config::default();
        project.ino_paths.max_buffer = 8192;

        global.merge(project);
        assert_eq!(global.search.items_per_page, 128);
        assert_eq!(global.ino_paths.max_buffer, 8192);
    }
}
