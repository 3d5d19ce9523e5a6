//! An authenticated, rate-limited client for Reddit's public REST API.
//!
//! The client owns three cooperating pieces: a credential manager that
//! caches OAuth2 access tokens and refreshes them single-flight, a token
//! bucket limiter that also listens to Reddit's `X-Ratelimit-*` headers,
//! and a decoder that turns Reddit's polymorphic "Thing" envelopes into
//! typed posts, comments, subreddits, and accounts.
//!
//! One [`Reddit`] handle is safe to share across tasks; cloning is cheap.
//! Construction is eager: [`Reddit::connect`] performs the first token
//! exchange before returning.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use orangered_core::validate;

mod api;
mod auth;
mod http;
mod rate_limiter;
mod things;


pub use api::{
    CommentsBatch, CommentsRequest, CommentsResponse, ListingOptions, MoreChildrenRequest,
    MoreChildrenResponse, PostsResponse,
};
pub use rate_limiter::{RateLimitConfig, RateLimitStatus};
pub use things::{Account, Comment, Edited, Post, Subreddit, Thing};

// The error taxonomy lives in `orangered-core`; re-exported so callers can
// match on it without a second dependency.
pub use orangered_core::{
    ApiError, ApiErrorDetail, AuthError, Cancelled, ConfigError, Error, ErrorExt, ParseError,
    RequestError, StateError,
};

pub use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://oauth.reddit.com/";
const DEFAULT_AUTH_URL: &str = "https://www.reddit.com/";

/// Client configuration. `Default` targets production Reddit with the
/// documented rate limits; only the application credentials are mandatory.
#[derive(Debug, Clone)]
pub struct Config {
    /// OAuth client identifier. Required.
    pub client_id: String,
    /// OAuth client secret. Required.
    pub client_secret: String,
    /// Setting both username and password switches the client from the
    /// app-only grant to the resource-owner-password grant.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Sent byte-for-byte as the `User-Agent` header on every request.
    pub user_agent: String,
    /// API base, `https://oauth.reddit.com/` in production.
    pub base_url: Url,
    /// Auth base, `https://www.reddit.com/` in production.
    pub auth_url: Url,
    /// Per-request deadline. Zero selects the 30 s default; values under
    /// one second are rejected.
    pub http_timeout: Duration,
    pub requests_per_minute: u32,
    pub burst: u32,
    pub proactive_threshold: f64,
    /// Cap on response bytes captured into debug logs and error bodies.
    pub log_body_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        let limits = RateLimitConfig::default();
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            username: None,
            password: None,
            user_agent: concat!("orangered/", env!("CARGO_PKG_VERSION")).to_string(),
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base url is valid"),
            auth_url: Url::parse(DEFAULT_AUTH_URL).expect("default auth url is valid"),
            http_timeout: validate::DEFAULT_HTTP_TIMEOUT,
            requests_per_minute: limits.requests_per_minute,
            burst: limits.burst,
            proactive_threshold: limits.proactive_threshold,
            log_body_limit: 4096,
        }
    }
}

impl Config {
    fn validated(mut self) -> Result<Self, Error> {
        if self.client_id.is_empty() {
            return Err(ConfigError::MissingCredential { field: "client_id" }.into());
        }
        if self.client_secret.is_empty() {
            return Err(ConfigError::MissingCredential {
                field: "client_secret",
            }
            .into());
        }
        validate::user_agent(&self.user_agent)?;
        self.http_timeout = validate::normalize_timeout(self.http_timeout)?;
        ensure_trailing_slash(&mut self.base_url);
        ensure_trailing_slash(&mut self.auth_url);
        Ok(self)
    }
}

// `Url::join` drops the last path segment unless the base ends in a slash.
fn ensure_trailing_slash(url: &mut Url) {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
}

pub(crate) struct Inner {
    pub(crate) auth: auth::TokenManager,
    pub(crate) pipeline: http::Pipeline,
    pub(crate) limiter: Arc<rate_limiter::RateLimiter>,
}

/// Handle to the Reddit API. Cheap to clone; all clones share the token
/// cache, the rate limiter, and the HTTP connection pool.
#[derive(Clone)]
pub struct Reddit {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Reddit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reddit").finish_non_exhaustive()
    }
}

impl Reddit {
    /// Validate the configuration, build the shared HTTP client, and
    /// perform the first token exchange eagerly so that a misconfigured
    /// client fails here rather than on its first call.
    pub async fn connect(config: Config) -> Result<Self, Error> {
        let config = config.validated()?;

        let http = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.http_timeout)
            .build()
            .map_err(|source| RequestError {
                operation: "connect",
                url: config.base_url.to_string(),
                source: Box::new(source),
            })?;

        let limiter = Arc::new(rate_limiter::RateLimiter::new(&RateLimitConfig {
            requests_per_minute: config.requests_per_minute,
            burst: config.burst,
            proactive_threshold: config.proactive_threshold,
        }));
        let auth = auth::TokenManager::new(&config, http.clone())?;
        let pipeline = http::Pipeline::new(&config, http, Arc::clone(&limiter));

        let client = Self {
            inner: Arc::new(Inner {
                auth,
                pipeline,
                limiter,
            }),
        };
        client.inner.auth.bearer_token().await?;
        Ok(client)
    }

    /// Read-only view of the limiter: last observed server budget and
    /// whether pacing is currently reduced or paused.
    pub async fn rate_limit_status(&self) -> RateLimitStatus {
        self.inner.limiter.status().await
    }
}
