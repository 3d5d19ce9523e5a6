//! The rate-limited request pipeline.
//!
//! Every API call funnels through [`Pipeline::execute`]: wait on the local
//! limiter, dispatch, feed the response's rate-limit headers back into the
//! limiter, then classify the outcome into the error taxonomy. Reddit's
//! responses come in three shapes, so three typed entry points sit on top
//! of the raw byte path.

use std::sync::Arc;
use std::time::Instant;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use orangered_core::{ApiError, ApiErrorDetail, Error, ParseError, RequestError};

use crate::rate_limiter::RateLimiter;
use crate::things::Thing;
use crate::Config;

#[derive(Debug)]
pub(crate) struct Pipeline {
    http: reqwest::Client,
    base_url: Url,
    limiter: Arc<RateLimiter>,
    log_body_limit: usize,
}

impl Pipeline {
    pub(crate) fn new(config: &Config, http: reqwest::Client, limiter: Arc<RateLimiter>) -> Self {
        Self {
            http,
            base_url: config.base_url.clone(),
            limiter,
            log_body_limit: config.log_body_limit,
        }
    }

    pub(crate) fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// GET an endpoint that answers with a single Thing.
    pub(crate) async fn get_thing(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, String)],
        bearer: &str,
    ) -> Result<Thing, Error> {
        let body = self
            .execute(operation, Method::GET, path, query, None, bearer)
            .await?;
        Ok(serde_json::from_slice(&body).map_err(|source| ParseError::Json {
            context: operation,
            source,
        })?)
    }

    /// GET an endpoint that answers with a JSON array of Things
    /// (`/comments/{id}` returns `[post_listing, comments_listing]`).
    pub(crate) async fn get_thing_array(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, String)],
        bearer: &str,
    ) -> Result<Vec<Thing>, Error> {
        let body = self
            .execute(operation, Method::GET, path, query, None, bearer)
            .await?;
        Ok(serde_json::from_slice(&body).map_err(|source| ParseError::Json {
            context: operation,
            source,
        })?)
    }

    /// POST `/api/morechildren`, which wraps its Things in
    /// `{"json": {"data": {"things": [...]}}}`.
    pub(crate) async fn post_more_children(
        &self,
        operation: &'static str,
        path: &str,
        form: &[(&str, String)],
        bearer: &str,
    ) -> Result<Vec<Thing>, Error> {
        #[derive(Deserialize, Default)]
        struct Envelope {
            #[serde(default)]
            json: EnvelopeJson,
        }
        #[derive(Deserialize, Default)]
        struct EnvelopeJson {
            #[serde(default)]
            data: EnvelopeData,
        }
        #[derive(Deserialize, Default)]
        struct EnvelopeData {
            #[serde(default)]
            things: Vec<Thing>,
        }

        let body = self
            .execute(operation, Method::POST, path, &[], Some(form), bearer)
            .await?;
        let envelope: Envelope =
            serde_json::from_slice(&body).map_err(|source| ParseError::Json {
                context: operation,
                source,
            })?;
        Ok(envelope.json.data.things)
    }

    async fn execute(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        form: Option<&[(&str, String)]>,
        bearer: &str,
    ) -> Result<Vec<u8>, Error> {
        let url = self.base_url.join(path).map_err(|source| RequestError {
            operation,
            url: format!("{}{}", self.base_url, path),
            source: Box::new(source),
        })?;

        self.limiter.wait().await;

        debug!(operation, %method, %url, "dispatching reddit api request");
        let started = Instant::now();

        let mut request = self.http.request(method, url.clone()).bearer_auth(bearer);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(form) = form {
            request = request.form(form);
        }

        let response = request.send().await.map_err(|source| RequestError {
            operation,
            url: url.to_string(),
            source: Box::new(source),
        })?;

        let status = response.status();
        self.limiter.observe(response.headers()).await;
        let retry_after = crate::rate_limiter::reset_interval(response.headers());
        if status == StatusCode::TOO_MANY_REQUESTS {
            self.limiter.note_too_many_requests().await;
        }

        let bytes = response.bytes().await.map_err(|source| RequestError {
            operation,
            url: url.to_string(),
            source: Box::new(source),
        })?;

        let status_snapshot = self.limiter.status().await;
        if status.is_success() {
            debug!(
                operation,
                status = status.as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                remaining = status_snapshot.remaining,
                reset_in_secs = status_snapshot.reset_in.map(|d| d.as_secs_f64()),
                "request completed"
            );
            debug!(
                operation,
                body = %String::from_utf8_lossy(&bytes[..bytes.len().min(self.log_body_limit)]),
                "response body"
            );
            Ok(bytes.to_vec())
        } else {
            warn!(
                operation,
                status = status.as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                %url,
                "request failed"
            );
            let capped = &bytes[..bytes.len().min(self.log_body_limit)];
            Err(decode_api_error(status, capped, &url, retry_after).into())
        }
    }
}

/// Pull whatever structure the error body discloses: Reddit uses both a
/// top-level `{message, error}` form and the nested
/// `{json: {errors: [[code, message, field?], ...]}}` form.
fn decode_api_error(
    status: StatusCode,
    body: &[u8],
    url: &Url,
    retry_after: Option<std::time::Duration>,
) -> ApiError {
    #[derive(Deserialize, Default)]
    struct TopLevel {
        message: Option<String>,
        error: Option<Value>,
    }
    #[derive(Deserialize, Default)]
    struct Envelope {
        json: Option<Nested>,
    }
    #[derive(Deserialize, Default)]
    struct Nested {
        #[serde(default)]
        errors: Vec<Vec<Value>>,
    }

    let mut code = None;
    let mut message = None;
    let mut details = Vec::new();

    if let Ok(top) = serde_json::from_slice::<TopLevel>(body) {
        message = top.message;
        code = top.error.map(|value| match value {
            Value::String(code) => code,
            other => other.to_string(),
        });
    }
    if let Ok(envelope) = serde_json::from_slice::<Envelope>(body) {
        if let Some(nested) = envelope.json {
            for entry in nested.errors {
                let mut fields = entry.into_iter();
                let as_text = |value: Value| match value {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                let code = fields.next().map(as_text).unwrap_or_default();
                let message = fields.next().map(as_text).unwrap_or_default();
                let field = fields.next().and_then(|value| match value {
                    Value::String(field) => Some(field),
                    Value::Null => None,
                    other => Some(other.to_string()),
                });
                details.push(ApiErrorDetail {
                    code,
                    message,
                    field,
                });
            }
        }
    }

    ApiError {
        status: status.as_u16(),
        code,
        message,
        details,
        url: url.to_string(),
        retry_after,
    }
}
