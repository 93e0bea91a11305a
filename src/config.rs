use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub chunk_size: u64,
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_retry_backoff_ms() -> u64 {
    500
}

/// Capture profile reported to the server when a segment is created.
/// The encoder itself is an external collaborator; only its output file
/// is consumed.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    pub video_codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub filename: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub upload: UploadConfig,
    pub capture: CaptureConfig,
}

impl AppConfig {
    pub fn load_default() -> anyhow::Result<Self> {
        let default = include_str!("../config/default.toml");
        let cfg: AppConfig = toml::from_str(default)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let p = path.into();
        let s = fs::read_to_string(&p)?;
        let cfg: AppConfig = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.upload.chunk_size == 0 {
            anyhow::bail!("upload.chunk_size must be positive");
        }
        if self.api.base_url.is_empty() {
            anyhow::bail!("api.base_url must be set");
        }
        Ok(())
    }
}
