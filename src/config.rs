use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::db::migrate::DEFAULT_BATCH_SIZE;
use crate::db::{BackendDescriptor, BackendKind};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "PHOTOCAT_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub repository: RepositoryConfig,

    #[serde(default)]
    pub migration: MigrationConfig,

    #[serde(default)]
    pub thumbnails: ThumbnailConfig,
}

/// Which backend is active and where each one keeps its data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,

    /// Directory holding `catalog.script` and friends.
    #[serde(default = "default_script_dir")]
    pub script_dir: PathBuf,
}

fn default_backend() -> BackendKind {
    BackendKind::Sqlite
}

fn data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photocat")
}

fn default_sqlite_path() -> PathBuf {
    data_root().join("catalog.db")
}

fn default_script_dir() -> PathBuf {
    data_root().join("catalog")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_path: default_sqlite_path(),
            script_dir: default_script_dir(),
        }
    }
}

impl StorageConfig {
    pub fn location(&self, kind: BackendKind) -> &Path {
        match kind {
            BackendKind::Sqlite => &self.sqlite_path,
            BackendKind::Script => &self.script_dir,
        }
    }

    /// Descriptor of the active backend.
    pub fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor::new(self.backend, self.location(self.backend))
    }

    /// Make `descriptor` the active backend.
    pub fn activate(&mut self, descriptor: &BackendDescriptor) {
        self.backend = descriptor.kind;
        match descriptor.kind {
            BackendKind::Sqlite => self.sqlite_path = descriptor.location.clone(),
            BackendKind::Script => self.script_dir = descriptor.location.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Delete keywords once no file uses them.
    #[serde(default)]
    pub prune_orphan_keywords: bool,

    #[serde(default = "default_search_page_size")]
    pub search_page_size: usize,
}

fn default_search_page_size() -> usize {
    200
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            prune_orphan_keywords: false,
            search_page_size: default_search_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default = "default_thumb_cache_path")]
    pub path: PathBuf,

    #[serde(default = "default_thumb_cache_max_size")]
    pub max_size_bytes: u64,
}

fn default_thumb_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("photocat/thumbnails")
}

fn default_thumb_cache_max_size() -> u64 {
    512 * 1024 * 1024 // 512MB
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            path: default_thumb_cache_path(),
            max_size_bytes: default_thumb_cache_max_size(),
        }
    }
}

impl Config {
    /// Load from `$PHOTOCAT_CONFIG` or the default location, writing a
    /// default file on first run.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photocat")
    }

    pub fn config_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::config_dir().join("config.toml"))
    }
}
