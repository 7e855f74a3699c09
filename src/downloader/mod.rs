pub mod cobalt;
pub mod controller;
pub mod ytdlp;

pub use controller::DownloadController;

use crate::errors::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// One download job, namespaced under `work_dir/<request_id>/` so
/// concurrent requests never trample each other's files.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub video_id: String,
    pub url: String,
    pub request_id: String,
    pub work_dir: PathBuf,
}

impl DownloadRequest {
    pub fn scratch_dir(&self) -> PathBuf {
        self.work_dir.join(&self.request_id)
    }
}

#[derive(Debug)]
pub struct SourceOutput {
    pub file_path: PathBuf,
    /// Track title the source discovered along the way, if any.
    pub title: Option<String>,
}

/// Mid-flight notifications from a running source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Progress {
        percent: f32,
        speed: Option<String>,
        eta: Option<String>,
    },
    TitleDiscovered(String),
}

/// A way of turning a video URL into an audio file on disk. The
/// controller tries sources in order until one succeeds.
#[async_trait]
pub trait AudioSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn download(
        &self,
        request: &DownloadRequest,
        events: mpsc::UnboundedSender<SourceEvent>,
    ) -> Result<SourceOutput>;
}

/// Strips upload-page noise ("(Official Video)", "[HD]", ...) from a
/// raw video title before it is used for lookups or filenames.
pub fn clean_track_name(raw: &str) -> String {
    let noise = regex::Regex::new(
        r"(?i)[\(\[][^\)\]]*(official|video|audio|lyric|lyrics|visuali[sz]er|remaster(ed)?|hd|hq|4k|mv)[^\)\]]*[\)\]]",
    );
    let cleaned = match noise {
        Ok(re) => re.replace_all(raw, "").to_string(),
        Err(_) => raw.to_string(),
    };

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Best-effort split of a raw video title into (artist, title). Uploads
/// commonly use "Artist - Title"; anything without that shape keeps the
/// whole string as the title.
pub fn parse_track_info(raw: &str) -> (Option<String>, String) {
    let cleaned = clean_track_name(raw);

    if let Some((artist, title)) = cleaned.split_once(" - ") {
        let artist = artist.trim();
        let title = title.trim();
        if !artist.is_empty() && !title.is_empty() {
            return (Some(artist.to_string()), title.to_string());
        }
    }

    (None, cleaned)
}
