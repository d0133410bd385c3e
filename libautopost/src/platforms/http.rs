//! Shared HTTP plumbing for the REST adapters
//!
//! Status codes map onto the shared taxonomy the same way for every platform:
//! 401 is an expired credential, 429 is throttling, 5xx and transport failures
//! are transient, and the remaining client errors are rejections.

use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use crate::config::PlatformConfig;
use crate::error::{AuthError, ConfigError, PlatformError, Result};
use crate::types::{now_ms, Credential, Platform};

use super::PlatformResult;

const MAX_DETAIL_CHARS: usize = 200;

/// Classifier for a non-success response: `(status, retry_after, body)`
pub(crate) type Classifier = fn(StatusCode, Option<Duration>, &str) -> PlatformError;

/// Base URLs an adapter talks to
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Endpoints {
    pub api_base: String,
    pub token_url: String,
}

impl Endpoints {
    /// Resolve endpoints from configuration
    ///
    /// When only `base_url` is overridden the token endpoint is assumed to
    /// live under it at `token_path`.
    pub(crate) fn resolve(
        config: &PlatformConfig,
        default_api_base: &str,
        default_token_url: &str,
        token_path: &str,
    ) -> Self {
        let api_base = config
            .base_url
            .as_deref()
            .unwrap_or(default_api_base)
            .trim_end_matches('/')
            .to_string();

        let token_url = match (&config.token_url, &config.base_url) {
            (Some(token_url), _) => token_url.clone(),
            (None, Some(_)) => format!("{}{}", api_base, token_path),
            (None, None) => default_token_url.to_string(),
        };

        Self { api_base, token_url }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }
}

pub(crate) fn build_client(config: &PlatformConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(concat!("autopost/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ConfigError::Invalid(format!("HTTP client: {}", e)))?;
    Ok(client)
}

/// Pass a success response through, classify anything else
pub(crate) async fn check_status(response: Response) -> PlatformResult<Response> {
    check_status_with(response, classify_status).await
}

pub(crate) async fn check_status_with(
    response: Response,
    classify: Classifier,
) -> PlatformResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.text().await.unwrap_or_default();

    Err(classify(status, retry_after, &body))
}

pub(crate) fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> PlatformError {
    let detail = describe(status, body);
    match status.as_u16() {
        401 => PlatformError::AuthExpired(detail),
        429 => PlatformError::RateLimited {
            message: detail,
            retry_after,
        },
        408 => PlatformError::Network(detail),
        s if s >= 500 => PlatformError::Network(detail),
        _ => PlatformError::Rejected(detail),
    }
}

/// Transport-level failure of a request
pub(crate) fn send_error(error: reqwest::Error) -> PlatformError {
    if error.is_decode() {
        // The platform answered; retrying could publish twice
        PlatformError::Rejected(format!("Unreadable platform response: {}", error))
    } else {
        PlatformError::Network(format!("Request failed: {}", error))
    }
}

pub(crate) fn describe(status: StatusCode, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return format!("HTTP {}", status.as_u16());
    }
    let truncated: String = body.chars().take(MAX_DETAIL_CHARS).collect();
    format!("HTTP {}: {}", status.as_u16(), truncated)
}

/// Parse a `Retry-After` value: delay in seconds or an HTTP date
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let millis = at.timestamp_millis() - now_ms();
    Some(Duration::from_millis(millis.max(0) as u64))
}

/// Send a probe request for `validate_credential`
pub(crate) async fn probe(request: RequestBuilder) -> PlatformResult<bool> {
    let response = request.send().await.map_err(send_error)?;
    match response.status() {
        s if s.is_success() => Ok(true),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(false),
        _ => check_status(response).await.map(|_| true),
    }
}

/// OAuth token endpoint response
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    /// Turn the response into a credential, keeping the previous refresh
    /// credential when the platform did not rotate it
    pub(crate) fn into_credential(self, previous_refresh: &SecretString) -> Credential {
        let refresh = self
            .refresh_token
            .unwrap_or_else(|| previous_refresh.expose_secret().to_string());
        Credential::new(
            self.access_token,
            Some(refresh),
            self.expires_in.map(|secs| now_ms() + secs * 1000),
        )
    }
}

/// Run a refresh request against a token endpoint
///
/// A refused grant means the user has to go through consent again; anything
/// else (unreachable endpoint, 5xx) may recover by itself.
pub(crate) async fn request_token(
    platform: Platform,
    request: RequestBuilder,
) -> std::result::Result<TokenResponse, AuthError> {
    let response = request.send().await.map_err(|e| {
        AuthError::RefreshUnavailable(format!("{} token endpoint unreachable: {}", platform, e))
    })?;

    let status = response.status();
    if status.is_success() {
        return response.json::<TokenResponse>().await.map_err(|e| {
            AuthError::RefreshUnavailable(format!("{} token response unreadable: {}", platform, e))
        });
    }

    let body = response.text().await.unwrap_or_default();
    match status.as_u16() {
        400 | 401 | 403 => Err(AuthError::NeedsReauthorization(format!(
            "{} refused the refresh credential ({})",
            platform,
            describe(status, &body)
        ))),
        _ => Err(AuthError::RefreshUnavailable(format!(
            "{} token endpoint failed ({})",
            platform,
            describe(status, &body)
        ))),
    }
}

/// Caption with media references appended as links, for text-first platforms
pub(crate) fn text_with_links(text: &str, media_urls: &[String]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if !text.trim().is_empty() {
        parts.push(text.trim_end());
    }
    parts.extend(media_urls.iter().map(String::as_str));
    parts.join("\n")
}
