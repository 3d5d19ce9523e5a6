//! Error taxonomy shared by the whole workspace.
//!
//! Every failure the client can produce is one of six classes, so callers
//! can match on the class and apply a per-class policy (retry, refresh,
//! surface to the user). The library itself never retries; see [`ErrorExt`]
//! for the classification callers can build a retry layer on.

use std::time::Duration;

use thiserror::Error;

/// Top-level error for all client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Input or configuration rejected before any request was sent.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Token acquisition or refresh failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The client was used in a state it cannot serve.
    #[error(transparent)]
    State(#[from] StateError),

    /// Transport-level failure: the request never produced a usable response.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Reddit answered with a non-2xx status.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The response body did not decode into the expected shape.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Validation failures. Produced before any HTTP request is made.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing credential: {field}")]
    MissingCredential { field: &'static str },

    #[error("invalid subreddit name {name:?}: {reason}")]
    InvalidSubreddit { name: String, reason: &'static str },

    #[error("invalid fullname {value:?}: expected t[1-5]_ followed by 1-13 base36 characters")]
    InvalidFullname { value: String },

    #[error("invalid comment id {value:?}: expected 1-13 base36 characters")]
    InvalidCommentId { value: String },

    #[error("too many ids in one batch: {count} (maximum {max})")]
    TooManyIds { count: usize, max: usize },

    #[error("too many requests in one batch: {count} (maximum {max})")]
    TooManyRequests { count: usize, max: usize },

    #[error("`after` and `before` cursors are mutually exclusive")]
    ConflictingCursors,

    #[error("limit {limit} out of range (maximum {max})")]
    InvalidLimit { limit: u32, max: u32 },

    #[error("invalid user agent: {reason}")]
    InvalidUserAgent { reason: &'static str },

    #[error("invalid link id {value:?}")]
    InvalidLinkId { value: String },

    #[error("http timeout {configured:?} is below the minimum {minimum:?}")]
    TimeoutTooShort {
        configured: Duration,
        minimum: Duration,
    },

    #[error("invalid {field} endpoint: {value:?}")]
    InvalidEndpoint { field: &'static str, value: String },
}

/// Failures while exchanging credentials for an access token.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token endpoint answered with an OAuth error response.
    #[error("token endpoint rejected the request: {error}")]
    Rejected {
        error: String,
        description: Option<String>,
    },

    /// The exchange never completed at the transport level.
    #[error("token exchange failed")]
    Exchange {
        #[source]
        source: reqwest::Error,
    },

    /// The endpoint returned 2xx but the body was not a usable token.
    #[error("malformed token response: {detail}")]
    MalformedResponse { detail: String },

    #[error("unexpected token_type {token_type:?}, expected \"bearer\"")]
    UnexpectedTokenType { token_type: String },
}

/// Client misuse. Currently only produced when operating on a closed client.
#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("client is closed")]
    ClientClosed,
}

/// A request failed below the HTTP status layer: connection, timeout,
/// body read, or caller cancellation. Carries the operation and target so
/// the context survives wrapping.
#[derive(Debug, Error)]
#[error("{operation} request to {url} failed")]
pub struct RequestError {
    pub operation: &'static str,
    pub url: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

/// Marker cause used when a caller cancels an in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// One entry of Reddit's `{json: {errors: [[code, message, field?]]}}` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    pub field: Option<String>,
}

/// A non-2xx answer from Reddit, with whatever the body disclosed.
#[derive(Debug, Error)]
#[error("reddit returned {status} for {url}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
pub struct ApiError {
    pub status: u16,
    pub code: Option<String>,
    pub message: Option<String>,
    pub details: Vec<ApiErrorDetail>,
    pub url: String,
    /// Seconds until the rate-limit window resets, when the response said so.
    pub retry_after: Option<Duration>,
}

/// The response decoded as JSON but not as the shape the operation expects.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected thing kind {got:?}, expected {expected}")]
    UnexpectedKind { expected: &'static str, got: String },

    #[error("failed to decode {context}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed thing: {reason}")]
    MalformedThing { reason: String },
}

/// Retry classification. The client never retries on its own; callers that
/// want a retry/backoff layer can drive it off these two methods.
pub trait ErrorExt {
    /// Whether a later identical attempt could plausibly succeed.
    fn is_retryable(&self) -> bool;

    /// Server-suggested wait before the next attempt, when one is known.
    fn retry_after(&self) -> Option<Duration>;
}

impl ErrorExt for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Api(api) => api.status == 429 || api.status >= 500,
            Error::Request(req) => req
                .source
                .downcast_ref::<reqwest::Error>()
                .map(|e| e.is_timeout() || e.is_connect())
                .unwrap_or(false),
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Api(api) if api.status == 429 => api.retry_after,
            _ => None,
        }
    }
}
