//! REST client for the two Discord endpoints the bot uses: posting a
//! message and fetching a channel.
//!
//! Every call funnels through [`DiscordHttpClient::request`] so the auth
//! header, per-route rate-limit buckets, and 429 retries live in one place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::types::*;

const BASE_URL: &str = "https://discord.com/api/v10";
const USER_AGENT: &str = concat!(
    "DiscordBot (https://github.com/afk-voice/afk-voice, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);
const MAX_RETRIES: u32 = 5;
const MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("Discord API error {status} on {route}: {body}")]
    Api {
        status: u16,
        body: String,
        route: String,
    },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("serialisation error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("still rate-limited on {route} after retrying")]
    RateLimited { route: String },
}

impl HttpError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, HttpError::Api { status: 404, .. })
    }
}

// ---------------------------------------------------------------------------
// Rate-limit tracker (per-bucket)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Bucket {
    remaining: u32,
    resets_at: Instant,
}

#[derive(Debug, Default)]
struct RateLimiter {
    /// Route key → bucket id, learned from `x-ratelimit-bucket`.
    route_buckets: HashMap<String, String>,
    buckets: HashMap<String, Bucket>,
    /// While set, nothing may be sent until this instant.
    global_until: Option<Instant>,
}

impl RateLimiter {
    /// How long to wait before sending on `route`, if at all.
    fn delay_for(&self, route: &str, now: Instant) -> Option<Duration> {
        if let Some(until) = self.global_until.filter(|until| *until > now) {
            return Some(until - now);
        }

        let bucket = self
            .route_buckets
            .get(route)
            .and_then(|id| self.buckets.get(id))?;

        (bucket.remaining == 0 && bucket.resets_at > now).then(|| bucket.resets_at - now)
    }

    fn update(&mut self, route: &str, info: &RateLimitInfo, now: Instant) {
        let reset_after = info
            .reset_after
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());

        if info.is_global {
            if let Some(after) = reset_after {
                self.global_until = Some(now + after);
            }
        }

        if let Some(bucket) = &info.bucket {
            self.route_buckets.insert(route.to_string(), bucket.clone());
            self.buckets.insert(
                bucket.clone(),
                Bucket {
                    remaining: info.remaining.unwrap_or(1),
                    resets_at: now + reset_after.unwrap_or(Duration::from_secs(1)),
                },
            );
        }
    }
}

fn parse_rate_limit_headers(headers: &HeaderMap) -> RateLimitInfo {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    RateLimitInfo {
        remaining: header("x-ratelimit-remaining").and_then(|s| s.parse().ok()),
        reset_after: header("x-ratelimit-reset-after").and_then(|s| s.parse().ok()),
        bucket: header("x-ratelimit-bucket").map(str::to_string),
        is_global: header("x-ratelimit-global") == Some("true"),
    }
}

// ---------------------------------------------------------------------------
// DiscordHttpClient
// ---------------------------------------------------------------------------

/// Cheap to clone; the connection pool and limiter are shared.
#[derive(Clone)]
pub struct DiscordHttpClient {
    client: reqwest::Client,
    token: Arc<str>,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl DiscordHttpClient {
    pub fn new(token: impl Into<String>) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            token: Arc::from(token.into()),
            limiter: Arc::new(Mutex::new(RateLimiter::default())),
        })
    }

    /// Send a request to `{BASE_URL}/{path}` and return the raw body.
    ///
    /// `route` keys the rate-limit bucket, e.g.
    /// `POST /channels/{channel_id}/messages`.
    async fn request(
        &self,
        method: Method,
        path: &str,
        route: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Vec<u8>, HttpError> {
        let url = format!("{}/{}", BASE_URL, path.trim_start_matches('/'));

        for attempt in 0..=MAX_RETRIES {
            let wait = self.limiter.lock().await.delay_for(route, Instant::now());
            if let Some(delay) = wait {
                let delay = delay.min(MAX_WAIT);
                debug!(route, delay_ms = delay.as_millis() as u64, "rate-limit pre-emptive backoff");
                tokio::time::sleep(delay).await;
            }

            let mut req = self
                .client
                .request(method.clone(), &url)
                .header("authorization", format!("Bot {}", self.token));
            if let Some(json) = body {
                req = req.json(json);
            }

            let resp = req.send().await?;
            let status = resp.status();
            let info = parse_rate_limit_headers(resp.headers());
            self.limiter
                .lock()
                .await
                .update(route, &info, Instant::now());

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = info
                    .reset_after
                    .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                    .unwrap_or(Duration::from_secs(1));
                warn!(
                    route,
                    attempt,
                    retry_after_ms = retry_after.as_millis() as u64,
                    global = info.is_global,
                    "rate-limited by Discord, backing off"
                );
                if attempt < MAX_RETRIES {
                    tokio::time::sleep(retry_after.min(MAX_WAIT)).await;
                    continue;
                }
                break;
            }

            let bytes = resp.bytes().await?;
            if status.is_success() {
                return Ok(bytes.to_vec());
            }
            return Err(HttpError::Api {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
                route: route.to_string(),
            });
        }

        Err(HttpError::RateLimited {
            route: route.to_string(),
        })
    }

    async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        route: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, HttpError> {
        let bytes = self.request(method, path, route, body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Post a plain text message to a channel.
    pub async fn send_message(&self, channel_id: &str, content: &str) -> Result<Message, HttpError> {
        let body = serde_json::to_value(CreateMessage::new().content(content))?;
        self.request_json(
            Method::POST,
            &format!("channels/{channel_id}/messages"),
            &format!("POST /channels/{channel_id}/messages"),
            Some(&body),
        )
        .await
    }

    pub async fn get_channel(&self, channel_id: &str) -> Result<Channel, HttpError> {
        self.request_json(
            Method::GET,
            &format!("channels/{channel_id}"),
            &format!("GET /channels/{channel_id}"),
            None,
        )
        .await
    }
}

impl std::fmt::Debug for DiscordHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordHttpClient")
            .field("token", &"<redacted>")
            .finish()
    }
}
