pub mod musicbrainz;
pub mod tagging;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Descriptive metadata attached to a finished download. Produced once
/// per request by the enrichment merge; never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichedMetadata {
    pub album: Option<String>,
    pub year: Option<String>,
    pub genre: Option<String>,
    pub track_number: Option<String>,
    pub label: Option<String>,
}

#[derive(Debug, Default)]
pub struct Enrichment {
    pub metadata: EnrichedMetadata,
    pub artwork: Option<Vec<u8>>,
}

/// Runs the independent metadata lookups and merges their results.
/// Lookups that fail or time out contribute empty values; `enrich`
/// itself never errors.
pub struct Enricher {
    client: reqwest::Client,
    musicbrainz_base: String,
    coverart_base: String,
    thumbnail_base: String,
    oembed_base: String,
}

impl Enricher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("tunegrab/1.0 (https://github.com/tunegrab/tunegrab)")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            musicbrainz_base: "https://musicbrainz.org/ws/2".to_string(),
            coverart_base: "https://coverartarchive.org".to_string(),
            thumbnail_base: "https://i.ytimg.com".to_string(),
            oembed_base: "https://www.youtube.com/oembed".to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_bases(base: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .unwrap(),
            musicbrainz_base: format!("{}/ws/2", base),
            coverart_base: base.clone(),
            thumbnail_base: base.clone(),
            oembed_base: format!("{}/oembed", base),
        }
    }

    /// Best-effort lookup of the raw video title, used to seed the first
    /// enrichment attempt before either provider has said anything.
    pub async fn video_title(&self, video_url: &str) -> Option<String> {
        let url = format!(
            "{}?url={}&format=json",
            self.oembed_base,
            urlencoding::encode(video_url)
        );

        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v["title"].as_str().map(|s| s.to_string())),
            Ok(response) => {
                log::warn!("[ENRICH] oEmbed lookup returned {}", response.status());
                None
            }
            Err(e) => {
                log::warn!("[ENRICH] oEmbed lookup failed: {}", e);
                None
            }
        }
    }

    pub async fn enrich(&self, artist: &str, title: &str, video_id: &str) -> Enrichment {
        let mut result = Enrichment::default();

        if !artist.trim().is_empty() && !title.trim().is_empty() {
            if let Some(found) = musicbrainz::search_recording(
                &self.client,
                &self.musicbrainz_base,
                artist,
                title,
            )
            .await
            {
                result.metadata.album = found.release.as_ref().and_then(|r| r.title.clone());
                result.metadata.year = found
                    .release
                    .as_ref()
                    .and_then(|r| r.date.as_deref())
                    .and_then(musicbrainz::year_from_date);
                result.metadata.track_number =
                    found.release.as_ref().and_then(|r| r.track_number.clone());

                // Genre and label both hang off the resolved recording, so
                // they run concurrently with the cover-art fetch.
                let genre_fut = musicbrainz::lookup_genre(
                    &self.client,
                    &self.musicbrainz_base,
                    &found.recording_id,
                );
                let label_fut = musicbrainz::lookup_label(
                    &self.client,
                    &self.musicbrainz_base,
                    found.release.as_ref().map(|r| r.id.as_str()),
                );
                let art_fut = self.fetch_cover_art(found.release.as_ref().map(|r| r.id.as_str()));

                let (genre, label, artwork) = tokio::join!(genre_fut, label_fut, art_fut);
                result.metadata.genre = genre;
                result.metadata.label = label;
                result.artwork = artwork;
            }
        }

        if result.artwork.is_none() {
            result.artwork = self.fetch_thumbnail(video_id).await;
        }

        result
    }

    async fn fetch_cover_art(&self, release_id: Option<&str>) -> Option<Vec<u8>> {
        let release_id = release_id?;
        let url = format!("{}/release/{}/front", self.coverart_base, release_id);

        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let bytes = response.bytes().await.ok()?;
                if bytes.is_empty() {
                    None
                } else {
                    log::info!("[ENRICH] cover art: {} bytes", bytes.len());
                    Some(bytes.to_vec())
                }
            }
            Ok(response) => {
                log::info!("[ENRICH] no cover art ({})", response.status());
                None
            }
            Err(e) => {
                log::warn!("[ENRICH] cover art fetch failed: {}", e);
                None
            }
        }
    }

    async fn fetch_thumbnail(&self, video_id: &str) -> Option<Vec<u8>> {
        if video_id.is_empty() {
            return None;
        }
        let url = format!("{}/vi/{}/hqdefault.jpg", self.thumbnail_base, video_id);

        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let bytes = response.bytes().await.ok()?;
                (!bytes.is_empty()).then(|| bytes.to_vec())
            }
            _ => None,
        }
    }
}

impl Default for Enricher {
    fn default() -> Self {
        Self::new()
    }
}
