use crate::config::AppConfig;
use crate::downloader::{AudioSource, DownloadRequest, SourceEvent, SourceOutput};
use crate::errors::{AppError, Result};
use crate::fetch::allowlist::AllowedHostSet;
use crate::fetch::FetchClient;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Primary source: a cobalt-compatible extraction API. The API resolves
/// the video and hands back a stream URL, which we then pull through the
/// validating fetcher.
pub struct CobaltSource {
    client: reqwest::Client,
    fetcher: Arc<FetchClient>,
    config: Arc<AppConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum ApiResponse {
    Tunnel { url: String },
    Redirect { url: String },
    Error { error: ApiError },
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
}

impl CobaltSource {
    pub fn new(config: Arc<AppConfig>, fetcher: Arc<FetchClient>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            fetcher,
            config,
        })
    }

    async fn request_stream_url(&self, video_url: &str) -> Result<String> {
        let mut request = self
            .client
            .post(&self.config.provider.api_url)
            .header("Accept", "application/json")
            .json(&json!({
                "url": video_url,
                "downloadMode": "audio",
                "audioFormat": "mp3",
                "audioBitrate": "128",
            }));

        if let Some(key) = &self.config.provider.api_key {
            request = request.header("Authorization", format!("Api-Key {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Network(format!("extraction API unreachable: {}", e)))?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(AppError::RateLimited(
                    "extraction API rate limit hit".to_string(),
                ));
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(AppError::AuthRequired(
                    "extraction API rejected our credentials".to_string(),
                ));
            }
            status if !status.is_success() => {
                return Err(AppError::Unavailable(format!(
                    "extraction API returned {}",
                    status
                )));
            }
            _ => {}
        }

        let parsed: ApiResponse = response.json().await.map_err(|e| {
            AppError::MalformedResponse(format!("unreadable extraction API body: {}", e))
        })?;

        match parsed {
            ApiResponse::Tunnel { url } | ApiResponse::Redirect { url } => Ok(url),
            ApiResponse::Error { error } => Err(classify_error_code(&error.code)),
        }
    }
}

#[async_trait]
impl AudioSource for CobaltSource {
    fn name(&self) -> &'static str {
        "cobalt"
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        events: mpsc::UnboundedSender<SourceEvent>,
    ) -> Result<SourceOutput> {
        log::info!("🎵 [COBALT] resolving stream for {}", request.video_id);
        let stream_url = self.request_stream_url(&request.url).await?;

        let allowed = AllowedHostSet::for_request(&self.config);
        let bytes = self
            .fetcher
            .fetch_with_validation(&stream_url, &allowed, |_received, _total, percent| {
                let _ = events.send(SourceEvent::Progress {
                    percent,
                    speed: None,
                    eta: None,
                });
            })
            .await?;

        // A zero-byte body means the API silently failed on its side;
        // treat it like any other source failure so the fallback runs.
        if bytes.is_empty() {
            return Err(AppError::Unavailable(
                "extraction API delivered an empty payload".to_string(),
            ));
        }

        let dir = request.scratch_dir();
        crate::utils::ensure_dir_exists(&dir).await?;
        let file_path = dir.join("audio.mp3");
        tokio::fs::write(&file_path, &bytes).await?;

        log::info!(
            "✅ [COBALT] {} bytes written to {:?}",
            bytes.len(),
            file_path
        );
        Ok(SourceOutput {
            file_path,
            title: None,
        })
    }
}

/// Maps a cobalt-style error code onto our taxonomy. Codes are matched
/// by substring because deployments extend the dotted namespaces.
fn classify_error_code(code: &str) -> AppError {
    let lowered = code.to_lowercase();

    if lowered.contains("rate") {
        AppError::RateLimited(format!("extraction API: {}", code))
    } else if lowered.contains("auth") || lowered.contains("login") || lowered.contains("token") {
        AppError::AuthRequired(format!("extraction API: {}", code))
    } else if lowered.contains("bot") || lowered.contains("captcha") {
        AppError::Unavailable(format!("source wants a bot check: {}", code))
    } else if lowered.contains("invalid_body") || lowered.contains("invalid.body") {
        AppError::MalformedResponse(format!("extraction API: {}", code))
    } else {
        AppError::Unavailable(format!("extraction API: {}", code))
    }
}
