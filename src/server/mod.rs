pub mod events;

use crate::config::AppConfig;
use crate::downloader::{DownloadController, DownloadRequest};
use crate::token::TokenCache;
use crate::utils::generate_request_id;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use events::EventSink;
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub controller: Arc<DownloadController>,
    pub token_cache: Arc<TokenCache>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/download", get(download))
        .route("/healthz", get(healthz))
        .route("/admin/token/reset", post(reset_token))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    id: String,
    url: String,
}

/// Starts a download and streams its progress as server-sent events.
/// The stream always ends with exactly one complete or error event.
async fn download(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if params.id.trim().is_empty() || params.url.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "both 'id' and 'url' are required".to_string(),
        ));
    }

    let request = DownloadRequest {
        video_id: params.id,
        url: params.url,
        request_id: generate_request_id(),
        work_dir: state.config.work_dir.clone(),
    };
    log::info!(
        "📥 [SERVER] download {} for video {}",
        request.request_id,
        request.video_id
    );

    let (sink, rx) = EventSink::channel(64);
    let controller = state.controller.clone();
    tokio::spawn(async move {
        controller.run(request, &sink).await;
    });

    let stream: ReceiverStream<_> = ReceiverStream::new(rx);
    let stream = stream.map(|event| {
        Ok::<_, Infallible>(
            Event::default()
                .json_data(&event)
                .unwrap_or_else(|_| Event::default().data("{}")),
        )
    });

    Ok(sse_response(stream))
}

fn sse_response<S>(stream: S) -> impl IntoResponse
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    (
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
}

async fn healthz() -> &'static str {
    "ok"
}

/// Drops the cached session token so the next download generates a
/// fresh one. Useful after rotating the token service.
async fn reset_token(State(state): State<AppState>) -> StatusCode {
    log::info!("🔄 [SERVER] token cache reset requested");
    state.token_cache.clear().await;
    StatusCode::NO_CONTENT
}
