use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authentication required: {0}")]
    AuthRequired(String),

    #[error("Content unavailable: {0}")]
    Unavailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid fetch target: {0}")]
    InvalidTarget(String),

    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(usize),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Extraction process failed: {0}")]
    ProcessFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Short, non-technical message for the terminal `error` event.
    /// Raw provider error text stays in the logs only.
    pub fn user_message(&self) -> String {
        let raw = self.to_string().to_lowercase();

        let table: &[(&[&str], &str)] = &[
            (
                &["sign in to confirm", "not a bot", "captcha", "bot check"],
                "The source site is asking for a bot check right now. Please try again in a few minutes.",
            ),
            (
                &["age-restricted", "age restricted", "confirm your age"],
                "This video is age-restricted and cannot be downloaded.",
            ),
            (
                &["copyright", "blocked in your country", "who has blocked it"],
                "This video is blocked for copyright reasons.",
            ),
            (
                &["private video", "video is private", "members-only"],
                "This video is private and cannot be downloaded.",
            ),
            (
                &["video unavailable", "removed by the uploader", "no longer available"],
                "This video is unavailable.",
            ),
        ];

        for (needles, message) in table {
            if needles.iter().any(|n| raw.contains(n)) {
                return (*message).to_string();
            }
        }

        match self {
            AppError::RateLimited(_) => {
                "The download service is busy right now. Please try again shortly.".to_string()
            }
            AppError::Timeout(_) => "The download took too long and was cancelled.".to_string(),
            _ => "Could not download audio for this video. Please try again later.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_detection_text_is_rewritten() {
        let err = AppError::ProcessFailure(
            "ERROR: [youtube] abc: Sign in to confirm you're not a bot.".to_string(),
        );
        assert!(err.user_message().contains("bot check"));
    }

    #[test]
    fn private_video_text_is_rewritten() {
        let err = AppError::ProcessFailure("ERROR: Private video. Sign in if...".to_string());
        assert!(err.user_message().contains("private"));
    }

    #[test]
    fn unknown_error_gets_generic_message() {
        let err = AppError::ProcessFailure("exit status 1: something exotic".to_string());
        let msg = err.user_message();
        assert!(!msg.contains("exotic"), "raw text must not leak: {}", msg);
        assert!(msg.contains("Could not download"));
    }

    #[test]
    fn rate_limit_gets_busy_message() {
        let msg = AppError::RateLimited("429".to_string()).user_message();
        assert!(msg.contains("busy"));
    }
}
