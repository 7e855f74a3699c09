use crate::errors::{AppError, Result};
use crate::metadata::EnrichedMetadata;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Everything a tagger needs to write id3 frames into a finished file.
pub struct TagRequest {
    pub title: String,
    pub artist: String,
    pub metadata: EnrichedMetadata,
    pub artwork: Option<Vec<u8>>,
}

#[async_trait]
pub trait Tagger: Send + Sync {
    async fn write_tags(&self, file_path: &Path, request: &TagRequest) -> Result<()>;
}

/// Tagger backed by an external helper process. The request is passed as
/// JSON on stdin and the helper answers with `{"success": bool, "error": ...}`
/// on stdout.
pub struct HelperTagger {
    helper_bin: String,
}

impl HelperTagger {
    pub fn new(helper_bin: String) -> Self {
        Self { helper_bin }
    }
}

#[async_trait]
impl Tagger for HelperTagger {
    async fn write_tags(&self, file_path: &Path, request: &TagRequest) -> Result<()> {
        let payload = json!({
            "action": "write_tags",
            "file_path": file_path,
            "tags": {
                "title": request.title,
                "artist": request.artist,
                "album": request.metadata.album,
                "year": request.metadata.year,
                "genre": request.metadata.genre,
                "track_number": request.metadata.track_number,
                "label": request.metadata.label,
            },
            "artwork_base64": request.artwork.as_ref().map(|a| BASE64.encode(a)),
        });

        let mut child = Command::new(&self.helper_bin)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                AppError::ProcessFailure(format!("could not start tagger '{}': {}", self.helper_bin, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.to_string().as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AppError::ProcessFailure(format!("tagger did not finish: {}", e)))?;

        let reply: serde_json::Value = serde_json::from_slice(&output.stdout).map_err(|_| {
            AppError::ProcessFailure("tagger produced no parseable reply".to_string())
        })?;

        if reply["success"].as_bool() == Some(true) {
            log::info!("🏷️ [TAG] tags written to {:?}", file_path);
            Ok(())
        } else {
            Err(AppError::ProcessFailure(format!(
                "tagger reported failure: {}",
                reply["error"].as_str().unwrap_or("unknown error")
            )))
        }
    }
}

/// Used when no helper binary is configured. Downloads still finish,
/// they just ship untagged.
pub struct NoopTagger;

#[async_trait]
impl Tagger for NoopTagger {
    async fn write_tags(&self, file_path: &Path, _request: &TagRequest) -> Result<()> {
        log::debug!("[TAG] no tagger configured, leaving {:?} untagged", file_path);
        Ok(())
    }
}
