use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const APP_NAME: &str = "clipstack";
const HISTORY_FILE: &str = "history.json";
const SOCKET_FILE: &str = "clipstack.sock";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_entries: usize,
    pub poll_interval_ms: u64,
    pub command_timeout_ms: u64,
    pub download_timeout_secs: u64,
    pub user_agent: String,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub socket_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(APP_NAME);

        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(APP_NAME)
            .join("images");

        let socket_path = dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(SOCKET_FILE);

        Self {
            max_entries: 100,
            poll_interval_ms: 300,
            command_timeout_ms: 2000,
            download_timeout_secs: 10,
            user_agent: format!(
                "{}/{} (clipboard history image cache)",
                APP_NAME,
                env!("CARGO_PKG_VERSION")
            ),
            data_dir,
            cache_dir,
            socket_path,
        }
    }
}

impl Config {
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_default()
            .join(APP_NAME)
            .join("config.toml")
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::path();

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let config: Self = toml::from_str(&content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))?;
            Ok(config)
        } else {
            let config = Self::default();
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&config_path, toml::to_string_pretty(&config)?)?;
            Ok(config)
        }
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join(HISTORY_FILE)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}
