use std::time::Duration;

use http::Method;
use serde::Deserialize;
use snafu::ResultExt;
use tokio::{sync::Mutex, time::Instant};

use super::Transport;
use crate::error::{ExchangeTokenSnafu, Result};

/// Tokens are refreshed this long before the server considers them expired.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Longer lifetimes announced by the server are cut to this.
const MAX_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// When a token living `expires_in` seconds from `now` has to be replaced.
fn refresh_at(now: Instant, expires_in: u64) -> Instant {
    let lifetime = Duration::from_secs(expires_in.min(MAX_LIFETIME.as_secs()))
        .saturating_sub(EXPIRY_MARGIN);
    now.checked_add(lifetime).unwrap_or(now)
}

/// Exchanges the long-lived metal API key for short-lived load balancer API tokens.
///
/// Tokens are cached until shortly before they expire. Concurrent callers wait on the same
/// exchange instead of each starting their own.
pub struct TokenSource {
    transport: Transport,
    api_key: String,
    cached: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSource")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl TokenSource {
    pub fn new(exchange_url: &str, api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            transport: Transport::new(exchange_url)?,
            api_key: api_key.into(),
            cached: Mutex::new(None),
        })
    }

    /// Returns a valid bearer token, exchanging the API key if needed.
    pub async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| Instant::now() < token.refresh_at) {
            return Ok(token.value.clone());
        }

        let response = self.exchange().await.context(ExchangeTokenSnafu)?;
        tracing::debug!(
            expires_in.seconds = response.expires_in,
            "exchanged API key for load balancer token"
        );

        let token = CachedToken {
            value: response.access_token,
            refresh_at: refresh_at(Instant::now(), response.expires_in),
        };
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    /// Drops the cached token, e.g. after the load balancer API rejected it.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn exchange(&self) -> Result<TokenResponse> {
        let url = self.transport.url("api-keys/exchange")?;
        self.transport
            .send_json::<(), _>(
                Method::POST,
                url,
                |request| request.bearer_auth(&self.api_key),
                None,
            )
            .await
    }
}
