use crate::errors::Result;
use log::info;

/// Sanitizes a filename by removing invalid characters
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim_matches(|c: char| c == '.' || c.is_whitespace())
        .to_string()
}

/// Sanitizes a track filename in "Artist - Title" format
pub fn sanitize_track_filename(artist: &str, title: &str) -> String {
    let sanitized_artist = sanitize_filename(artist);
    let sanitized_title = sanitize_filename(title);
    format!("{} - {}", sanitized_artist, sanitized_title)
}

/// Creates a directory if it doesn't exist
pub async fn ensure_dir_exists(path: &std::path::Path) -> Result<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Generates a unique ID used to namespace a request's temp files
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
