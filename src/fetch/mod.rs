pub mod allowlist;

use crate::config::FetchConfig;
use crate::errors::{AppError, Result};
use allowlist::AllowedHostSet;
use futures_util::StreamExt;
use reqwest::header::LOCATION;
use reqwest::{Client, ClientBuilder};
use std::time::Duration;
use url::Url;

/// Hardened download client. Redirects are followed manually so every
/// hop can be re-validated against the allow-list before any bytes
/// move; an attacker-controlled Location header must never reach the
/// network layer unchecked.
pub struct FetchClient {
    client: Client,
    max_redirects: usize,
    timeout: Duration,
}

impl FetchClient {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(15))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()?;

        Ok(Self {
            client,
            max_redirects: config.max_redirects,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Downloads `url` into memory, validating the initial target and
    /// every redirect hop against `allowed`. The timeout covers the
    /// whole operation, not a single hop.
    pub async fn fetch_with_validation<F>(
        &self,
        url: &str,
        allowed: &AllowedHostSet,
        on_progress: F,
    ) -> Result<Vec<u8>>
    where
        F: FnMut(u64, u64, f32),
    {
        tokio::time::timeout(self.timeout, self.fetch_inner(url, allowed, on_progress))
            .await
            .map_err(|_| {
                AppError::Timeout(format!(
                    "download did not finish within {}s",
                    self.timeout.as_secs()
                ))
            })?
    }

    async fn fetch_inner<F>(
        &self,
        url: &str,
        allowed: &AllowedHostSet,
        mut on_progress: F,
    ) -> Result<Vec<u8>>
    where
        F: FnMut(u64, u64, f32),
    {
        let mut current = Url::parse(url)
            .map_err(|e| AppError::InvalidTarget(format!("unparseable URL '{}': {}", url, e)))?;
        allowed.validate(&current)?;

        let mut redirects = 0usize;

        loop {
            log::info!("🌐 [FETCH] GET {}", current);
            let response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(|e| AppError::Network(e.to_string()))?;

            if response.status().is_redirection() {
                redirects += 1;
                if redirects > self.max_redirects {
                    return Err(AppError::TooManyRedirects(self.max_redirects));
                }

                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        AppError::MalformedResponse(format!(
                            "redirect from {} carried no location header",
                            current
                        ))
                    })?;

                let next = current.join(location).map_err(|e| {
                    AppError::MalformedResponse(format!("bad redirect target '{}': {}", location, e))
                })?;

                // The whole point: re-validate after every hop.
                allowed.validate(&next)?;
                log::info!("↪️ [FETCH] redirect {}/{} -> {}", redirects, self.max_redirects, next);
                current = next;
                continue;
            }

            if !response.status().is_success() {
                return Err(AppError::Network(format!(
                    "HTTP {} from {}",
                    response.status(),
                    current
                )));
            }

            let total_size = response.content_length().unwrap_or(0);
            let mut downloaded = 0u64;
            let mut data = Vec::new();
            let mut stream = response.bytes_stream();

            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| AppError::Network(e.to_string()))?;
                downloaded += chunk.len() as u64;
                data.extend_from_slice(&chunk);

                let percent = if total_size > 0 {
                    (downloaded as f32 / total_size as f32) * 100.0
                } else {
                    0.0
                };
                on_progress(downloaded, total_size, percent);
            }

            log::info!("✅ [FETCH] {} bytes from {}", data.len(), current);
            return Ok(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::Redirect;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn local_allowlist() -> AllowedHostSet {
        AllowedHostSet::from_hosts(vec!["127.0.0.1".to_string()], true)
    }

    fn client() -> FetchClient {
        FetchClient::new(&FetchConfig {
            max_redirects: 3,
            timeout_secs: 10,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn follows_allowed_redirect_and_reports_progress() {
        let app = Router::new()
            .route("/file", get(|| async { "some audio bytes" }))
            .route("/hop", get(|| async { Redirect::temporary("/file") }));
        let addr = serve(app).await;

        let mut last_percent = -1.0f32;
        let data = client()
            .fetch_with_validation(
                &format!("http://{}/hop", addr),
                &local_allowlist(),
                |_received, _total, percent| last_percent = percent,
            )
            .await
            .unwrap();

        assert_eq!(data, b"some audio bytes");
        assert!((last_percent - 100.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn redirect_to_foreign_host_is_rejected() {
        let app = Router::new().route(
            "/escape",
            get(|| async { Redirect::temporary("https://attacker.example.net/payload") }),
        );
        let addr = serve(app).await;

        let result = client()
            .fetch_with_validation(
                &format!("http://{}/escape", addr),
                &local_allowlist(),
                |_, _, _| {},
            )
            .await;

        assert!(matches!(result, Err(AppError::InvalidTarget(_))));
    }

    #[tokio::test]
    async fn redirect_loop_fails_closed() {
        let app = Router::new().route("/loop", get(|| async { Redirect::temporary("/loop") }));
        let addr = serve(app).await;

        let result = client()
            .fetch_with_validation(
                &format!("http://{}/loop", addr),
                &local_allowlist(),
                |_, _, _| {},
            )
            .await;

        assert!(matches!(result, Err(AppError::TooManyRedirects(3))));
    }

    #[tokio::test]
    async fn redirect_without_location_is_malformed() {
        let app = Router::new().route("/bare", get(|| async { StatusCode::FOUND }));
        let addr = serve(app).await;

        let result = client()
            .fetch_with_validation(
                &format!("http://{}/bare", addr),
                &local_allowlist(),
                |_, _, _| {},
            )
            .await;

        assert!(matches!(result, Err(AppError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn disallowed_initial_target_never_hits_the_network() {
        // Nothing is listening on this port; if validation did not fire
        // first we would see a Network error instead of InvalidTarget.
        let result = client()
            .fetch_with_validation(
                "http://169.254.169.254/latest/meta-data/",
                &AllowedHostSet::from_hosts(vec!["example.com".to_string()], true),
                |_, _, _| {},
            )
            .await;

        assert!(matches!(result, Err(AppError::InvalidTarget(_))));
    }
}
