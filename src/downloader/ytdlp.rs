use crate::config::AppConfig;
use crate::downloader::{AudioSource, DownloadRequest, SourceEvent, SourceOutput};
use crate::errors::{AppError, Result};
use crate::token::TokenCache;
use async_trait::async_trait;
use regex::Regex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

const STDERR_TAIL_LINES: usize = 50;

/// Fallback source: shells out to a local yt-dlp binary. Slower than the
/// extraction API but works when the API is down or refuses the video.
pub struct YtDlpSource {
    config: Arc<AppConfig>,
    token_cache: Arc<TokenCache>,
}

impl YtDlpSource {
    pub fn new(config: Arc<AppConfig>, token_cache: Arc<TokenCache>) -> Self {
        Self {
            config,
            token_cache,
        }
    }
}

#[async_trait]
impl AudioSource for YtDlpSource {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        events: mpsc::UnboundedSender<SourceEvent>,
    ) -> Result<SourceOutput> {
        let dir = request.scratch_dir();
        crate::utils::ensure_dir_exists(&dir).await?;
        let template = dir.join("%(title)s.%(ext)s");

        let mut args: Vec<String> = vec![
            "--newline".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--extract-audio".to_string(),
            "--audio-format".to_string(),
            "mp3".to_string(),
            "--audio-quality".to_string(),
            "128K".to_string(),
            "--socket-timeout".to_string(),
            "30".to_string(),
            "-o".to_string(),
            template.to_string_lossy().to_string(),
        ];

        if let Some(token) = self.token_cache.get().await {
            log::info!("🔑 [YTDLP] attaching session token");
            args.push("--extractor-args".to_string());
            args.push(format!(
                "youtube:po_token=web.gvs+{};visitor_data={}",
                token.po_token, token.visitor_data
            ));
        } else {
            log::info!("[YTDLP] no session token available, running bare");
        }

        args.push(request.url.clone());

        log::info!("🎵 [YTDLP] extracting {}", request.video_id);
        let mut child = Command::new(&self.config.extractor.bin)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::ProcessFailure(format!(
                    "could not start '{}': {}",
                    self.config.extractor.bin, e
                ))
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let events_clone = events.clone();
        let stdout_task = tokio::spawn(async move {
            let mut last_title = None;
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(event) = parse_line(&line) {
                        if let SourceEvent::TitleDiscovered(title) = &event {
                            last_title = Some(title.clone());
                        }
                        let _ = events_clone.send(event);
                    }
                }
            }
            last_title
        });

        let stderr_task = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let timeout = Duration::from_secs(self.config.extractor.timeout_secs);
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(waited) => {
                waited.map_err(|e| AppError::ProcessFailure(format!("wait failed: {}", e)))?
            }
            Err(_) => {
                log::warn!(
                    "⏱️ [YTDLP] killed after {}s without finishing",
                    timeout.as_secs()
                );
                let _ = child.kill().await;
                return Err(AppError::Timeout(format!(
                    "extractor exceeded {}s",
                    timeout.as_secs()
                )));
            }
        };

        let title = stdout_task.await.unwrap_or(None);
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(AppError::ProcessFailure(format!(
                "extractor exited with {}: {}",
                status, stderr_tail
            )));
        }

        let file_path = find_output_file(&dir).await?;
        log::info!("✅ [YTDLP] produced {:?}", file_path);
        Ok(SourceOutput { file_path, title })
    }
}

/// Turns one stdout line into an event. yt-dlp's `--newline` mode prints
/// progress as `[download]  42.1% of 3.50MiB at 1.20MiB/s ETA 00:02` and
/// announces files with `Destination: <path>` lines.
fn parse_line(line: &str) -> Option<SourceEvent> {
    static PROGRESS: OnceLock<Regex> = OnceLock::new();
    static DESTINATION: OnceLock<Regex> = OnceLock::new();

    let progress = PROGRESS.get_or_init(|| {
        Regex::new(r"\[download\]\s+(\d+(?:\.\d+)?)%(?:.*?\bat\s+(\S+))?(?:.*?\bETA\s+(\S+))?")
            .unwrap()
    });
    let destination = DESTINATION.get_or_init(|| Regex::new(r"Destination:\s+(.+)$").unwrap());

    if let Some(caps) = progress.captures(line) {
        let percent = caps.get(1)?.as_str().parse::<f32>().ok()?;
        return Some(SourceEvent::Progress {
            percent,
            speed: caps.get(2).map(|m| m.as_str().to_string()),
            eta: caps.get(3).map(|m| m.as_str().to_string()),
        });
    }

    if let Some(caps) = destination.captures(line) {
        let stem = Path::new(caps.get(1)?.as_str().trim())
            .file_stem()
            .and_then(|s| s.to_str())?;
        if !stem.is_empty() && stem != "NA" {
            return Some(SourceEvent::TitleDiscovered(stem.to_string()));
        }
    }

    None
}

/// The output template leaves the exact filename up to the video title,
/// so the finished mp3 has to be discovered by scanning the scratch dir.
async fn find_output_file(dir: &Path) -> Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("mp3") {
            return Ok(path);
        }
    }
    Err(AppError::ProcessFailure(format!(
        "extractor exited cleanly but left no mp3 in {:?}",
        dir
    )))
}
