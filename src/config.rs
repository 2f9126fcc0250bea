use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

const APP_DIR: &str = "recipe-shelf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Memory,
    #[default]
    Database,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_prefs_path")]
    pub prefs_path: String,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    #[serde(default = "default_images_base_url")]
    pub images_base_url: String,

    #[serde(default = "default_share_base_url")]
    pub share_base_url: String,

    #[serde(default)]
    pub cache: CacheMode,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Upper bound on concurrent lookups when resolving favorites
    #[serde(default = "default_resolve_concurrency")]
    pub resolve_concurrency: usize,
}

fn data_file(name: &str) -> String {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR);
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join(name).to_string_lossy().to_string()
}

fn default_db_path() -> String {
    data_file("recipes.db")
}

fn default_prefs_path() -> String {
    data_file("prefs.db")
}

fn default_api_base_url() -> String {
    "https://recipes.androidsprint.ru/api/".to_string()
}

fn default_images_base_url() -> String {
    "https://recipes.androidsprint.ru/api/images/".to_string()
}

fn default_share_base_url() -> String {
    "https://recipes.androidsprint.ru".to_string()
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_request_timeout() -> u64 {
    30
}

fn default_resolve_concurrency() -> usize {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            prefs_path: default_prefs_path(),
            api_base_url: default_api_base_url(),
            images_base_url: default_images_base_url(),
            share_base_url: default_share_base_url(),
            cache: CacheMode::default(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            resolve_concurrency: default_resolve_concurrency(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    fn validate(&self) -> Result<()> {
        if self.resolve_concurrency == 0 {
            return Err(AppError::Config(
                "resolve_concurrency must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(AppError::Config(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
