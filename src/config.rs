use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub render: RenderConfig,
}

/// Tuning for the in-memory notes cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_update_debounce_ms")]
    pub update_debounce_ms: u64,
    #[serde(default = "default_search_debounce_ms")]
    pub search_debounce_ms: u64,
    #[serde(default = "default_search_cache_ttl_ms")]
    pub search_cache_ttl_ms: i64,
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_render_cache_size")]
    pub render_cache_size: usize,
    #[serde(default = "default_render_cache_ttl_ms")]
    pub render_cache_ttl_ms: i64,
    #[serde(default = "default_highlight_cache_size")]
    pub highlight_cache_size: usize,
    #[serde(default = "default_math_cache_size")]
    pub math_cache_size: usize,
    /// Allow math commands that can emit links or raw classes (`\href`, `\htmlClass`, ...).
    #[serde(default)]
    pub trust_math: bool,
    #[serde(default = "default_diagram_zoom")]
    pub diagram_zoom: bool,
}

fn default_page_size() -> usize { 50 }
fn default_update_debounce_ms() -> u64 { 500 }
fn default_search_debounce_ms() -> u64 { 300 }
fn default_search_cache_ttl_ms() -> i64 { 30_000 }
fn default_search_limit() -> usize { 100 }

fn default_render_cache_size() -> usize { 100 }
fn default_render_cache_ttl_ms() -> i64 { 5 * 60 * 1000 }
fn default_highlight_cache_size() -> usize { 500 }
fn default_math_cache_size() -> usize { 200 }
fn default_diagram_zoom() -> bool { true }

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mindnote")
}

fn default_database_path() -> PathBuf { data_dir().join("notes.sqlite") }
fn default_backup_dir() -> PathBuf { data_dir().join("backups") }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            update_debounce_ms: default_update_debounce_ms(),
            search_debounce_ms: default_search_debounce_ms(),
            search_cache_ttl_ms: default_search_cache_ttl_ms(),
            search_limit: default_search_limit(),
        }
    }
}

impl CacheConfig {
    pub fn update_debounce(&self) -> Duration {
        Duration::from_millis(self.update_debounce_ms)
    }

    pub fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            render_cache_size: default_render_cache_size(),
            render_cache_ttl_ms: default_render_cache_ttl_ms(),
            highlight_cache_size: default_highlight_cache_size(),
            math_cache_size: default_math_cache_size(),
            trust_math: false,
            diagram_zoom: default_diagram_zoom(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            backup_dir: default_backup_dir(),
            cache: CacheConfig::default(),
            render: RenderConfig::default(),
        }
    }
}

impl Config {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mindnote")
            .join("config.toml")
    }

    /// Load the user config, falling back to defaults if it is missing or broken.
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring config at {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cache.page_size == 0 {
            return Err(Error::Config("cache.page_size must be at least 1".into()));
        }
        if self.render.render_cache_size == 0 {
            return Err(Error::Config("render.render_cache_size must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "database_path = \"/tmp/notes.sqlite\"\n[cache]\npage_size = 20\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/notes.sqlite"));
        assert_eq!(config.cache.page_size, 20);
        assert_eq!(config.cache.update_debounce_ms, 500);
        assert_eq!(config.render, RenderConfig::default());
    }

    #[test]
    fn rejects_zero_page_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[cache]\npage_size = 0\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }

    #[test]
    fn broken_toml_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[cache\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }
}
