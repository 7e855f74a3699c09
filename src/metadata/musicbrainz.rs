//! MusicBrainz lookups. All functions degrade to `None` on any failure;
//! enrichment must never block or fail a download.

use serde_json::Value;

pub struct RecordingMatch {
    pub recording_id: String,
    pub release: Option<ReleaseInfo>,
}

pub struct ReleaseInfo {
    pub id: String,
    pub title: Option<String>,
    pub date: Option<String>,
    pub track_number: Option<String>,
}

/// Searches for a recording by artist and title and resolves the most
/// representative release for it.
pub async fn search_recording(
    client: &reqwest::Client,
    base: &str,
    artist: &str,
    title: &str,
) -> Option<RecordingMatch> {
    let query = format!("recording:\"{}\" AND artist:\"{}\"", title, artist);
    let url = format!(
        "{}/recording?query={}&fmt=json&limit=5",
        base,
        urlencoding::encode(&query)
    );

    let body = get_json(client, &url).await?;
    let recording = body["recordings"].as_array()?.first()?;
    let recording_id = recording["id"].as_str()?.to_string();

    let release = recording["releases"]
        .as_array()
        .and_then(|releases| select_release(releases))
        .map(|release| ReleaseInfo {
            id: release["id"].as_str().unwrap_or_default().to_string(),
            title: release["title"].as_str().map(|s| s.to_string()),
            date: release["date"].as_str().map(|s| s.to_string()),
            track_number: release_track_number(release),
        });

    log::info!(
        "[ENRICH] recording match for '{} - {}': {}",
        artist,
        title,
        recording_id
    );
    Some(RecordingMatch {
        recording_id,
        release,
    })
}

/// Picks the release to read album data from: the first one whose
/// release group is a proper album, otherwise the first listed.
pub fn select_release(releases: &[Value]) -> Option<&Value> {
    releases
        .iter()
        .find(|r| r["release-group"]["primary-type"].as_str() == Some("Album"))
        .or_else(|| releases.first())
}

/// Track position within the chosen release, when the search result
/// carries media details.
pub fn release_track_number(release: &Value) -> Option<String> {
    let media = release["media"].as_array()?.first()?;
    if let Some(number) = media["track"].as_array().and_then(|t| t.first()) {
        if let Some(s) = number["number"].as_str() {
            return Some(s.to_string());
        }
        if let Some(n) = number["number"].as_u64() {
            return Some(n.to_string());
        }
    }
    media["track-offset"].as_u64().map(|o| (o + 1).to_string())
}

pub fn year_from_date(date: &str) -> Option<String> {
    let year = date.split('-').next()?;
    (year.len() == 4 && year.chars().all(|c| c.is_ascii_digit())).then(|| year.to_string())
}

/// Fetches the recording's tag list and picks the most voted tag as the
/// genre. Ties keep the first tag in response order.
pub async fn lookup_genre(client: &reqwest::Client, base: &str, recording_id: &str) -> Option<String> {
    let url = format!("{}/recording/{}?inc=tags&fmt=json", base, recording_id);
    let body = get_json(client, &url).await?;
    pick_genre(body["tags"].as_array()?)
}

pub fn pick_genre(tags: &[Value]) -> Option<String> {
    let mut best: Option<(&str, u64)> = None;
    for tag in tags {
        let name = match tag["name"].as_str() {
            Some(n) => n,
            None => continue,
        };
        let count = tag["count"].as_u64().unwrap_or(0);
        match best {
            Some((_, best_count)) if count <= best_count => {}
            _ => best = Some((name, count)),
        }
    }
    best.map(|(name, _)| name.to_string())
}

/// Record label of the chosen release.
pub async fn lookup_label(
    client: &reqwest::Client,
    base: &str,
    release_id: Option<&str>,
) -> Option<String> {
    let release_id = release_id?;
    let url = format!("{}/release/{}?inc=labels&fmt=json", base, release_id);
    let body = get_json(client, &url).await?;
    body["label-info"]
        .as_array()?
        .first()?
        .pointer("/label/name")?
        .as_str()
        .map(|s| s.to_string())
}

async fn get_json(client: &reqwest::Client, url: &str) -> Option<Value> {
    match client.get(url).send().await {
        Ok(response) if response.status().is_success() => match response.json().await {
            Ok(body) => Some(body),
            Err(e) => {
                log::warn!("[ENRICH] bad response body from {}: {}", url, e);
                None
            }
        },
        Ok(response) => {
            log::warn!("[ENRICH] {} returned {}", url, response.status());
            None
        }
        Err(e) => {
            log::warn!("[ENRICH] request to {} failed: {}", url, e);
            None
        }
    }
}
