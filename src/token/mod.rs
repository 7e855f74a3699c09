use crate::errors::Result;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Credential pair consumed by the fallback extractor to get past
/// bot-detection challenges on the source site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    #[serde(rename = "poToken")]
    pub po_token: String,
    #[serde(rename = "visitorData")]
    pub visitor_data: String,
}

#[async_trait]
pub trait TokenGenerator: Send + Sync {
    async fn generate(&self) -> Result<TokenPayload>;
}

/// Generator backed by an external token service (`GET <base>/token`).
pub struct HttpTokenGenerator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTokenGenerator {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl TokenGenerator for HttpTokenGenerator {
    async fn generate(&self) -> Result<TokenPayload> {
        let url = format!("{}/token", self.base_url.trim_end_matches('/'));
        let response = self.client.get(&url).send().await?;
        let token: TokenPayload = response.json().await?;
        Ok(token)
    }
}

struct CachedToken {
    value: TokenPayload,
    issued_at: Instant,
}

type InFlight = Shared<BoxFuture<'static, Option<TokenPayload>>>;

struct CacheState {
    cached: Option<CachedToken>,
    last_failure_at: Option<Instant>,
    in_flight: Option<InFlight>,
    /// Bumped by `clear`. A generation that started under an older
    /// epoch must not write its result back.
    epoch: u64,
}

/// Single-flight cache around token generation. Generation is expensive
/// and rate-limited, so concurrent callers share one in-flight attempt,
/// failures open a short backoff window, and a stale token keeps being
/// served until it is older than twice the TTL.
pub struct TokenCache {
    generator: Arc<dyn TokenGenerator>,
    state: Arc<Mutex<CacheState>>,
    ttl: Duration,
    backoff: Duration,
    generation_timeout: Duration,
}

const TOKEN_TTL: Duration = Duration::from_secs(50 * 60);
const FAILURE_BACKOFF: Duration = Duration::from_secs(30);
const GENERATION_TIMEOUT: Duration = Duration::from_secs(30);

impl TokenCache {
    pub fn new(generator: Arc<dyn TokenGenerator>) -> Self {
        Self::with_timings(generator, TOKEN_TTL, FAILURE_BACKOFF, GENERATION_TIMEOUT)
    }

    pub fn with_timings(
        generator: Arc<dyn TokenGenerator>,
        ttl: Duration,
        backoff: Duration,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            generator,
            state: Arc::new(Mutex::new(CacheState {
                cached: None,
                last_failure_at: None,
                in_flight: None,
                epoch: 0,
            })),
            ttl,
            backoff,
            generation_timeout,
        }
    }

    /// Returns a usable token, or None. Never errors: an absent token is
    /// an expected outcome the caller must be able to proceed without.
    pub async fn get(&self) -> Option<TokenPayload> {
        let in_flight = {
            let mut state = self.state.lock().await;
            let now = Instant::now();

            if let Some(cached) = &state.cached {
                if now.duration_since(cached.issued_at) < self.ttl {
                    return Some(cached.value.clone());
                }
            }

            if let Some(shared) = &state.in_flight {
                shared.clone()
            } else {
                if let Some(failed_at) = state.last_failure_at {
                    if now.duration_since(failed_at) < self.backoff {
                        log::info!("[TOKEN] inside backoff window, not regenerating");
                        return Self::usable_stale(&state, self.ttl, now);
                    }
                }

                let shared = self.spawn_generation(state.epoch);
                state.in_flight = Some(shared.clone());
                shared
            }
        };

        in_flight.await
    }

    /// Resets cache, backoff and in-flight state. Used by the
    /// administrative reset endpoint and by tests.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.cached = None;
        state.last_failure_at = None;
        state.in_flight = None;
        state.epoch = state.epoch.wrapping_add(1);
    }

    fn usable_stale(state: &CacheState, ttl: Duration, now: Instant) -> Option<TokenPayload> {
        // A token past 2xTTL is never served, not even as a fallback.
        state
            .cached
            .as_ref()
            .filter(|c| now.duration_since(c.issued_at) < ttl * 2)
            .map(|c| c.value.clone())
    }

    fn spawn_generation(&self, epoch: u64) -> InFlight {
        let generator = self.generator.clone();
        let state = self.state.clone();
        let timeout = self.generation_timeout;
        let ttl = self.ttl;

        async move {
            log::info!("[TOKEN] generating fresh token");
            let result = tokio::time::timeout(timeout, generator.generate()).await;

            let mut state = state.lock().await;
            if state.epoch != epoch {
                log::info!("[TOKEN] cache was reset mid-generation, discarding result");
                return None;
            }
            state.in_flight = None;
            let now = Instant::now();

            match result {
                Ok(Ok(token)) => {
                    log::info!("[TOKEN] token generated successfully");
                    state.cached = Some(CachedToken {
                        value: token.clone(),
                        issued_at: now,
                    });
                    state.last_failure_at = None;
                    Some(token)
                }
                Ok(Err(e)) => {
                    log::warn!("[TOKEN] generation failed: {}", e);
                    state.last_failure_at = Some(now);
                    Self::usable_stale(&state, ttl, now)
                }
                Err(_) => {
                    log::warn!("[TOKEN] generation timed out after {}s", timeout.as_secs());
                    state.last_failure_at = Some(now);
                    Self::usable_stale(&state, ttl, now)
                }
            }
        }
        .boxed()
        .shared()
    }
}
