//! OAuth2 credential management.
//!
//! One `TokenManager` owns the current access token and its refresh path.
//! Reads are a cheap `RwLock` snapshot; the refresh path is single-flight:
//! callers that find the cache invalid queue on one mutex, re-check under
//! it, and only the first performs the HTTP exchange. Everyone else reuses
//! the token it produced, so a stampede of concurrent calls costs exactly
//! one upstream request.

use std::time::{Duration, Instant};

use oauth2::basic::{BasicClient, BasicErrorResponseType, BasicTokenType};
use oauth2::{
    AuthUrl, ClientId, ClientSecret, HttpRequest, HttpResponse, RequestTokenError,
    ResourceOwnerPassword, ResourceOwnerUsername, StandardErrorResponse, TokenResponse, TokenUrl,
};
use reqwest::header::USER_AGENT;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use orangered_core::{AuthError, ConfigError, Error};

use crate::Config;

/// Safety margin subtracted from the reported token lifetime.
const EXPIRY_SKEW: Duration = Duration::from_secs(30);

/// Reddit omits `expires_in` on some responses; this matches its documented
/// token lifetime.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

#[derive(Debug)]
enum Grant {
    ClientCredentials,
    Password { username: String, password: String },
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

pub(crate) struct TokenManager {
    oauth: BasicClient,
    http: reqwest::Client,
    user_agent: String,
    grant: Grant,
    current: RwLock<Option<CachedToken>>,
    refresh: Mutex<()>,
}

impl TokenManager {
    pub(crate) fn new(config: &Config, http: reqwest::Client) -> Result<Self, Error> {
        let endpoint = |path: &str| -> Result<String, Error> {
            Ok(config
                .auth_url
                .join(path)
                .map_err(|_| ConfigError::InvalidEndpoint {
                    field: "auth_url",
                    value: config.auth_url.to_string(),
                })?
                .to_string())
        };
        let auth_url = AuthUrl::new(endpoint("api/v1/authorize")?).map_err(|_| {
            ConfigError::InvalidEndpoint {
                field: "auth_url",
                value: config.auth_url.to_string(),
            }
        })?;
        let token_url = TokenUrl::new(endpoint("api/v1/access_token")?).map_err(|_| {
            ConfigError::InvalidEndpoint {
                field: "auth_url",
                value: config.auth_url.to_string(),
            }
        })?;

        let oauth = BasicClient::new(
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
            auth_url,
            Some(token_url),
        );

        let grant = match (&config.username, &config.password) {
            (Some(username), Some(password))
                if !username.is_empty() && !password.is_empty() =>
            {
                Grant::Password {
                    username: username.clone(),
                    password: password.clone(),
                }
            }
            _ => Grant::ClientCredentials,
        };

        Ok(Self {
            oauth,
            http,
            user_agent: config.user_agent.clone(),
            grant,
            current: RwLock::new(None),
            refresh: Mutex::new(()),
        })
    }

    /// Return a valid access token, refreshing it if needed. Concurrent
    /// callers share a single in-flight exchange.
    pub(crate) async fn bearer_token(&self) -> Result<String, Error> {
        if let Some(token) = self.cached().await {
            return Ok(token);
        }

        let _refresh = self.refresh.lock().await;
        // Double-checked: a racing caller may have refreshed while this one
        // waited on the lock.
        if let Some(token) = self.cached().await {
            return Ok(token);
        }

        debug!("access token missing or expiring, exchanging credentials");
        let fetched = self.exchange().await?;
        let access_token = fetched.access_token.clone();
        *self.current.write().await = Some(fetched);
        Ok(access_token)
    }

    async fn cached(&self) -> Option<String> {
        let guard = self.current.read().await;
        guard
            .as_ref()
            .filter(|token| token.is_valid(Instant::now()))
            .map(|token| token.access_token.clone())
    }

    async fn exchange(&self) -> Result<CachedToken, Error> {
        let http = self.http.clone();
        let user_agent = self.user_agent.clone();
        let http_client =
            move |request: HttpRequest| token_endpoint_request(http, user_agent, request);

        let result = match &self.grant {
            Grant::Password { username, password } => {
                let username = ResourceOwnerUsername::new(username.clone());
                let password = ResourceOwnerPassword::new(password.clone());
                self.oauth
                    .exchange_password(&username, &password)
                    .request_async(http_client)
                    .await
            }
            Grant::ClientCredentials => {
                self.oauth
                    .exchange_client_credentials()
                    .request_async(http_client)
                    .await
            }
        };
        let response = result.map_err(map_token_error)?;

        match response.token_type() {
            BasicTokenType::Bearer => {}
            BasicTokenType::Mac => {
                return Err(AuthError::UnexpectedTokenType {
                    token_type: "mac".to_string(),
                }
                .into())
            }
            BasicTokenType::Extension(other) => {
                return Err(AuthError::UnexpectedTokenType {
                    token_type: other.clone(),
                }
                .into())
            }
        }

        let lifetime = response.expires_in().unwrap_or(DEFAULT_TOKEN_LIFETIME);
        let expires_at = Instant::now() + lifetime.saturating_sub(EXPIRY_SKEW);
        debug!(lifetime_secs = lifetime.as_secs(), "acquired access token");
        Ok(CachedToken {
            access_token: response.access_token().secret().clone(),
            expires_at,
        })
    }
}

/// Drive the oauth2 exchange over our own `reqwest::Client` so the
/// configured user agent and timeout apply to token requests as well.
async fn token_endpoint_request(
    http: reqwest::Client,
    user_agent: String,
    request: HttpRequest,
) -> Result<HttpResponse, reqwest::Error> {
    let response = http
        .request(request.method, request.url.as_str())
        .headers(request.headers)
        .header(USER_AGENT, user_agent)
        .body(request.body)
        .send()
        .await?;

    let status_code = response.status();
    let headers = response.headers().to_owned();
    let body = response.bytes().await?.to_vec();
    Ok(HttpResponse {
        status_code,
        headers,
        body,
    })
}

fn map_token_error(
    error: RequestTokenError<reqwest::Error, StandardErrorResponse<BasicErrorResponseType>>,
) -> Error {
    match error {
        RequestTokenError::ServerResponse(response) => AuthError::Rejected {
            error: response.error().to_string(),
            description: response.error_description().cloned(),
        }
        .into(),
        RequestTokenError::Request(source) => AuthError::Exchange { source }.into(),
        RequestTokenError::Parse(source, _body) => AuthError::MalformedResponse {
            detail: source.to_string(),
        }
        .into(),
        RequestTokenError::Other(detail) => AuthError::MalformedResponse { detail }.into(),
    }
}
