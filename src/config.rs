use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use crate::errors::{AppError, Result};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub extractor: ExtractorConfig,
    pub fetch: FetchConfig,
    pub token_service_url: Option<String>,
    /// Helper binary used to write id3 tags, if any.
    pub tagger_bin: Option<String>,
    pub work_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Base URL of the primary extraction API (cobalt-compatible).
    pub api_url: String,
    pub api_key: Option<String>,
    /// Optional self-hosted tunnel host trusted as a stream target.
    pub tunnel_host: Option<String>,
    /// Permit plain-http targets. Only for private deployments.
    pub allow_insecure_http: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExtractorConfig {
    pub bin: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FetchConfig {
    pub max_redirects: usize,
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8090,
            },
            provider: ProviderConfig {
                api_url: "https://api.cobalt.tools".to_string(),
                api_key: None,
                tunnel_host: None,
                allow_insecure_http: false,
            },
            extractor: ExtractorConfig {
                bin: "yt-dlp".to_string(),
                timeout_secs: 600,
            },
            fetch: FetchConfig {
                max_redirects: 5,
                timeout_secs: 300,
            },
            token_service_url: None,
            tagger_bin: None,
            work_dir: std::env::temp_dir().join("tunegrab"),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(Self::get_config_path()?)
    }

    pub fn load_from(config_path: PathBuf) -> Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: AppConfig = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            let config = AppConfig::default();
            config.save(&config_path)?;
            Ok(config)
        }
    }

    pub fn save(&self, config_path: &std::path::Path) -> Result<()> {
        if let Some(config_dir) = config_path.parent() {
            if !config_dir.exists() {
                std::fs::create_dir_all(config_dir)?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AppError::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("tunegrab").join("config.json"))
    }

    /// Host of the primary API, used as an allow-list entry.
    pub fn provider_host(&self) -> Option<String> {
        url::Url::parse(&self.provider.api_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }
}
