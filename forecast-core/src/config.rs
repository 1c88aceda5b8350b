use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, time::Duration};

use crate::{
    endpoint::Endpoints,
    orchestrator::{DEFAULT_MAX_CONCURRENT_SITES, OrchestratorSettings, StalenessPolicy},
};

pub const DEFAULT_SITE_PATH: &str = "sites?lat={{LAT}}&long={{LONG}}";

/// Connection settings for the forecast service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Root URL every request is resolved against.
    pub base_url: Option<String>,

    /// Site lookup path relative to `base_url`, with `{{LAT}}` and `{{LONG}}` tokens.
    pub site_path: String,

    pub api_key: Option<String>,

    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            site_path: DEFAULT_SITE_PATH.to_string(),
            api_key: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub max_concurrent_sites: usize,
    pub stale_after_secs: u64,

    /// Optional cap on requests in flight across all site pipelines.
    pub max_in_flight_requests: Option<usize>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sites: DEFAULT_MAX_CONCURRENT_SITES,
            stale_after_secs: 180,
            max_in_flight_requests: None,
        }
    }
}

/// Top-level configuration stored on disk.
///
/// Example TOML:
/// [api]
/// base_url = "https://forecast.example.com/v1/"
///
/// [refresh]
/// max_concurrent_sites = 5
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub refresh: RefreshConfig,
}

impl Config {
    pub fn base_url(&self) -> Result<&str> {
        self.api.base_url.as_deref().ok_or_else(|| {
            anyhow!(
                "No service URL configured.\n\
                 Hint: run `forecast configure` first."
            )
        })
    }

    pub fn endpoints(&self) -> Result<Endpoints> {
        Endpoints::new(self.base_url()?, self.api.site_path.clone())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let window = i64::try_from(self.refresh.stale_after_secs).unwrap_or(i64::MAX);

        OrchestratorSettings {
            max_concurrent_sites: self.refresh.max_concurrent_sites,
            staleness: StalenessPolicy::new(
                chrono::Duration::try_seconds(window).unwrap_or(chrono::Duration::MAX),
            ),
        }
    }

    /// Sets the service URL and optionally the API key; an empty key clears it.
    pub fn set_service(&mut self, base_url: String, api_key: Option<String>) {
        self.api.base_url = Some(base_url);
        self.api.api_key = api_key.filter(|key| !key.trim().is_empty());
    }

    /// Load config from disk, or return an empty default if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        if !path.exists() {
            // First run: no config file, return empty.
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_file_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(&path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Path to the cached site collection.
    pub fn cache_file_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.cache_dir().join("sites.json"))
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("dev", "forecast", "forecast-cli")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))
    }
}
