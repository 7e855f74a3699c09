use crate::downloader::{parse_track_info, AudioSource, DownloadRequest, SourceEvent, SourceOutput};
use crate::errors::Result;
use crate::metadata::tagging::{TagRequest, Tagger};
use crate::metadata::{Enricher, Enrichment};
use crate::server::events::{EventSink, ProgressEvent};
use crate::utils::{sanitize_filename, sanitize_track_filename};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::future::{Fuse, FusedFuture, FutureExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type TitleLookup = Fuse<JoinHandle<Option<String>>>;

/// Runs one download end to end: primary source, fallback on failure,
/// metadata enrichment racing alongside, tagging, and exactly one
/// terminal event on the sink.
pub struct DownloadController {
    primary: Arc<dyn AudioSource>,
    fallback: Arc<dyn AudioSource>,
    enricher: Arc<Enricher>,
    tagger: Arc<dyn Tagger>,
}

impl DownloadController {
    pub fn new(
        primary: Arc<dyn AudioSource>,
        fallback: Arc<dyn AudioSource>,
        enricher: Arc<Enricher>,
        tagger: Arc<dyn Tagger>,
    ) -> Self {
        Self {
            primary,
            fallback,
            enricher,
            tagger,
        }
    }

    pub async fn run(&self, request: DownloadRequest, sink: &EventSink) {
        let scratch = request.scratch_dir();

        if let Err(e) = self.run_inner(&request, sink).await {
            log::error!("❌ [DOWNLOAD] request {} failed: {}", request.request_id, e);
            sink.send(ProgressEvent::Error {
                error: e.user_message(),
            })
            .await;
        }

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("[DOWNLOAD] could not clean up {:?}: {}", scratch, e);
            }
        }
    }

    async fn run_inner(&self, request: &DownloadRequest, sink: &EventSink) -> Result<()> {
        sink.send(ProgressEvent::Status {
            message: "Fetching audio".to_string(),
        })
        .await;

        // The public-title lookup seeds enrichment but must never delay
        // the download itself, so it runs as its own task and the
        // download starts immediately. Its result is picked up inside
        // the attempt loop whenever it lands.
        let mut title_lookup: TitleLookup = {
            let enricher = self.enricher.clone();
            let url = request.url.clone();
            tokio::spawn(async move { enricher.video_title(&url).await }).fuse()
        };

        // Unkeyed run; it can still contribute thumbnail artwork.
        let initial = self.spawn_enrichment("", "", &request.video_id);

        let mut restarted: Option<JoinHandle<Enrichment>> = None;
        let mut oembed_title: Option<String> = None;
        let mut discovered_title: Option<String> = None;

        let (output, provider) = match self
            .attempt(
                self.primary.as_ref(),
                request,
                sink,
                &mut title_lookup,
                &mut oembed_title,
                &mut restarted,
                &mut discovered_title,
            )
            .await
        {
            Ok(output) => (output, self.primary.name()),
            Err(primary_err) => {
                log::warn!(
                    "⚠️ [DOWNLOAD] primary source '{}' failed ({}), falling back to '{}'",
                    self.primary.name(),
                    primary_err,
                    self.fallback.name()
                );
                sink.send(ProgressEvent::Status {
                    message: "Switching to fallback downloader".to_string(),
                })
                .await;

                let output = self
                    .attempt(
                        self.fallback.as_ref(),
                        request,
                        sink,
                        &mut title_lookup,
                        &mut oembed_title,
                        &mut restarted,
                        &mut discovered_title,
                    )
                    .await?;
                (output, self.fallback.name())
            }
        };

        // Best title wins: what the source itself announced, then what it
        // reported mid-flight, then the public page title. The page
        // lookup is only waited for when nothing better exists.
        let source_title = output.title.clone().or(discovered_title);
        if source_title.is_none() && !title_lookup.is_terminated() {
            oembed_title = (&mut title_lookup).await.unwrap_or(None);
        }
        let best_raw = source_title.or(oembed_title);
        let (artist, title) = match &best_raw {
            Some(raw) => parse_track_info(raw),
            None => (None, String::new()),
        };

        // A title that only arrived after the download still deserves a
        // keyed enrichment run.
        if restarted.is_none() {
            if let Some(artist) = &artist {
                restarted = Some(self.spawn_enrichment(artist, &title, &request.video_id));
            }
        }

        let enrichment = match restarted {
            Some(task) => {
                initial.abort();
                task.await.unwrap_or_default()
            }
            None => initial.await.unwrap_or_default(),
        };

        sink.send(ProgressEvent::Metadata {
            metadata: enrichment.metadata.clone(),
        })
        .await;

        let tag_request = TagRequest {
            title: title.clone(),
            artist: artist.clone().unwrap_or_default(),
            metadata: enrichment.metadata,
            artwork: enrichment.artwork,
        };
        if let Err(e) = self.tagger.write_tags(&output.file_path, &tag_request).await {
            // Tagging is cosmetic; the file still ships.
            log::warn!("⚠️ [TAG] shipping untagged file: {}", e);
        }

        let filename = derive_filename(artist.as_deref(), &title);
        let bytes = tokio::fs::read(&output.file_path).await?;

        log::info!(
            "✅ [DOWNLOAD] '{}' finished via {} ({} bytes)",
            filename,
            provider,
            bytes.len()
        );
        sink.send(ProgressEvent::Complete {
            filename,
            size: bytes.len() as u64,
            provider: provider.to_string(),
            payload: BASE64.encode(&bytes),
        })
        .await;

        Ok(())
    }

    /// Drives one source while forwarding its progress to the sink. The
    /// first title to arrive, from the source or from the page lookup,
    /// restarts enrichment once with real inputs.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        source: &dyn AudioSource,
        request: &DownloadRequest,
        sink: &EventSink,
        title_lookup: &mut TitleLookup,
        oembed_title: &mut Option<String>,
        restarted: &mut Option<JoinHandle<Enrichment>>,
        discovered_title: &mut Option<String>,
    ) -> Result<SourceOutput> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fut = source.download(request, tx);
        tokio::pin!(fut);

        loop {
            tokio::select! {
                result = &mut fut => return result,
                Some(event) = rx.recv() => match event {
                    SourceEvent::Progress { percent, speed, eta } => {
                        sink.send(ProgressEvent::Progress { percent, speed, eta }).await;
                    }
                    SourceEvent::TitleDiscovered(raw) => {
                        log::info!("🎤 [DOWNLOAD] source reported title '{}'", raw);
                        self.note_title(&raw, request, sink, restarted).await;
                        *discovered_title = Some(raw);
                    }
                },
                // Fused: never fires again once the lookup has landed.
                looked_up = &mut *title_lookup => {
                    if let Ok(Some(raw)) = looked_up {
                        log::info!("🎼 [DOWNLOAD] page title '{}'", raw);
                        self.note_title(&raw, request, sink, restarted).await;
                        *oembed_title = Some(raw);
                    }
                },
            }
        }
    }

    async fn note_title(
        &self,
        raw: &str,
        request: &DownloadRequest,
        sink: &EventSink,
        restarted: &mut Option<JoinHandle<Enrichment>>,
    ) {
        let (artist, title) = parse_track_info(raw);
        sink.send(ProgressEvent::Info {
            title: Some(title.clone()),
            artist: artist.clone(),
        })
        .await;

        if restarted.is_none() {
            if let Some(artist) = &artist {
                *restarted = Some(self.spawn_enrichment(artist, &title, &request.video_id));
            }
        }
    }

    fn spawn_enrichment(&self, artist: &str, title: &str, video_id: &str) -> JoinHandle<Enrichment> {
        let enricher = self.enricher.clone();
        let artist = artist.to_string();
        let title = title.to_string();
        let video_id = video_id.to_string();

        tokio::spawn(async move { enricher.enrich(&artist, &title, &video_id).await })
    }
}

fn derive_filename(artist: Option<&str>, title: &str) -> String {
    match artist {
        Some(artist) if !title.is_empty() => {
            format!("{}.mp3", sanitize_track_filename(artist, title))
        }
        _ if !title.is_empty() => format!("{}.mp3", sanitize_filename(title)),
        _ => "audio.mp3".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct StaticSource {
        name: &'static str,
        fail: bool,
        announce_title: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl StaticSource {
        fn ok(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: false,
                announce_title: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: true,
                announce_title: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn with_title(name: &'static str, title: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: false,
                announce_title: Some(title),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AudioSource for StaticSource {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn download(
            &self,
            request: &DownloadRequest,
            events: mpsc::UnboundedSender<SourceEvent>,
        ) -> Result<SourceOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AppError::Unavailable("source says no".to_string()));
            }

            if let Some(title) = self.announce_title {
                let _ = events.send(SourceEvent::TitleDiscovered(title.to_string()));
            }
            let _ = events.send(SourceEvent::Progress {
                percent: 100.0,
                speed: None,
                eta: None,
            });

            let dir = request.scratch_dir();
            crate::utils::ensure_dir_exists(&dir).await?;
            let file_path = dir.join("out.mp3");
            tokio::fs::write(&file_path, b"audio-bytes").await?;
            Ok(SourceOutput {
                file_path,
                title: self.announce_title.map(|t| t.to_string()),
            })
        }
    }

    struct RecordingTagger {
        fail: bool,
        tagged: std::sync::Mutex<Vec<PathBuf>>,
    }

    impl RecordingTagger {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                tagged: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Tagger for RecordingTagger {
        async fn write_tags(&self, file_path: &std::path::Path, _request: &TagRequest) -> Result<()> {
            self.tagged.lock().unwrap().push(file_path.to_path_buf());
            if self.fail {
                Err(AppError::ProcessFailure("tagger broke".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn controller(
        primary: Arc<StaticSource>,
        fallback: Arc<StaticSource>,
        tagger: Arc<RecordingTagger>,
    ) -> DownloadController {
        // Nothing listens on this port, so enrichment and the title
        // lookup degrade to empty quickly.
        DownloadController::new(
            primary,
            fallback,
            Arc::new(Enricher::with_bases("http://127.0.0.1:9".to_string())),
            tagger,
        )
    }

    fn request(work: &TempDir) -> DownloadRequest {
        DownloadRequest {
            video_id: "vid123".to_string(),
            url: "https://www.youtube.com/watch?v=vid123".to_string(),
            request_id: "req-1".to_string(),
            work_dir: work.path().to_path_buf(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn primary_success_never_touches_the_fallback() {
        let primary = StaticSource::ok("primary");
        let fallback = StaticSource::ok("fallback");
        let tagger = RecordingTagger::new(false);
        let controller = controller(primary.clone(), fallback.clone(), tagger);

        let work = TempDir::new().unwrap();
        let (sink, rx) = EventSink::channel(32);
        controller.run(request(&work), &sink).await;
        drop(sink);

        let events = collect(rx).await;
        let last = events.last().unwrap();
        match last {
            ProgressEvent::Complete {
                provider,
                payload,
                size,
                filename,
            } => {
                assert_eq!(provider, "primary");
                assert_eq!(*size, 11);
                assert_eq!(payload, &BASE64.encode(b"audio-bytes"));
                assert_eq!(filename, "audio.mp3");
            }
            other => panic!("expected complete, got {:?}", other),
        }
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn fallback_runs_when_primary_fails() {
        let primary = StaticSource::failing("primary");
        let fallback = StaticSource::with_title("fallback", "Daft Punk - One More Time");
        let tagger = RecordingTagger::new(false);
        let controller = controller(primary.clone(), fallback.clone(), tagger.clone());

        let work = TempDir::new().unwrap();
        let (sink, rx) = EventSink::channel(32);
        controller.run(request(&work), &sink).await;
        drop(sink);

        let events = collect(rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::Status { message } if message.contains("fallback"))));
        match events.last().unwrap() {
            ProgressEvent::Complete {
                provider, filename, ..
            } => {
                assert_eq!(provider, "fallback");
                assert_eq!(filename, "Daft Punk - One More Time.mp3");
            }
            other => panic!("expected complete, got {:?}", other),
        }
        assert_eq!(fallback.calls(), 1);
        assert_eq!(tagger.tagged.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn both_sources_failing_yields_exactly_one_error() {
        let primary = StaticSource::failing("primary");
        let fallback = StaticSource::failing("fallback");
        let tagger = RecordingTagger::new(false);
        let controller = controller(primary, fallback, tagger);

        let work = TempDir::new().unwrap();
        let (sink, rx) = EventSink::channel(32);
        controller.run(request(&work), &sink).await;
        drop(sink);

        let events = collect(rx).await;
        let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminals.len(), 1);
        match terminals[0] {
            ProgressEvent::Error { error } => {
                // The raw source error must not leak to the client.
                assert!(!error.contains("source says no"));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn tagging_failure_does_not_sink_the_download() {
        let primary = StaticSource::ok("primary");
        let fallback = StaticSource::ok("fallback");
        let tagger = RecordingTagger::new(true);
        let controller = controller(primary, fallback, tagger);

        let work = TempDir::new().unwrap();
        let (sink, rx) = EventSink::channel(32);
        controller.run(request(&work), &sink).await;
        drop(sink);

        let events = collect(rx).await;
        assert!(matches!(
            events.last().unwrap(),
            ProgressEvent::Complete { .. }
        ));
    }

    #[tokio::test]
    async fn metadata_event_precedes_complete() {
        let primary = StaticSource::ok("primary");
        let fallback = StaticSource::ok("fallback");
        let tagger = RecordingTagger::new(false);
        let controller = controller(primary, fallback, tagger);

        let work = TempDir::new().unwrap();
        let (sink, rx) = EventSink::channel(32);
        controller.run(request(&work), &sink).await;
        drop(sink);

        let events = collect(rx).await;
        let metadata_pos = events
            .iter()
            .position(|e| matches!(e, ProgressEvent::Metadata { .. }))
            .unwrap();
        let complete_pos = events
            .iter()
            .position(|e| matches!(e, ProgressEvent::Complete { .. }))
            .unwrap();
        assert!(metadata_pos < complete_pos);
    }

    #[tokio::test]
    async fn scratch_dir_is_cleaned_up() {
        let primary = StaticSource::ok("primary");
        let fallback = StaticSource::ok("fallback");
        let tagger = RecordingTagger::new(false);
        let controller = controller(primary, fallback, tagger);

        let work = TempDir::new().unwrap();
        let request = request(&work);
        let scratch = request.scratch_dir();
        let (sink, _rx) = EventSink::channel(32);
        controller.run(request, &sink).await;

        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn stalled_title_lookup_does_not_delay_the_download() {
        use axum::routing::get;
        use axum::Router;

        // The page-title endpoint hangs well past the enrichment client
        // timeout; every other path 404s instantly.
        let app = Router::new().route(
            "/oembed",
            get(|| async {
                tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                axum::http::StatusCode::NOT_FOUND
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let primary = StaticSource::with_title("primary", "Daft Punk - One More Time");
        let fallback = StaticSource::ok("fallback");
        let tagger = RecordingTagger::new(false);
        let controller = DownloadController::new(
            primary.clone(),
            fallback,
            Arc::new(Enricher::with_bases(format!("http://{}", addr))),
            tagger,
        );

        let work = TempDir::new().unwrap();
        let (sink, rx) = EventSink::channel(32);
        let started = std::time::Instant::now();
        controller.run(request(&work), &sink).await;
        let elapsed = started.elapsed();
        drop(sink);

        let events = collect(rx).await;
        assert!(matches!(
            events.last().unwrap(),
            ProgressEvent::Complete { .. }
        ));
        assert_eq!(primary.calls(), 1);
        // Nowhere near the lookup's stall: the download never waited
        // for the page title.
        assert!(elapsed < std::time::Duration::from_secs(2), "took {:?}", elapsed);
    }

    #[test]
    fn filename_prefers_artist_and_title() {
        assert_eq!(
            derive_filename(Some("AC/DC"), "Back in Black"),
            "AC_DC - Back in Black.mp3"
        );
        assert_eq!(derive_filename(None, "Some Mix"), "Some Mix.mp3");
        assert_eq!(derive_filename(None, ""), "audio.mp3");
    }
}
