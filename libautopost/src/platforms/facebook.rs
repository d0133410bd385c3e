//! Facebook Page adapter (Graph API)
//!
//! Page access tokens are long-lived and have no refresh grant; once the
//! platform stops accepting one the subscriber must reconnect the page.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use crate::config::PlatformConfig;
use crate::error::{AuthError, PlatformError, Result};
use crate::types::{Content, Credential, Platform};

use super::http::{self, Endpoints};
use super::{PlatformAdapter, PlatformResult};

pub const DEFAULT_API_BASE: &str = "https://graph.facebook.com";
pub(crate) const GRAPH_VERSION: &str = "v19.0";
const CHARACTER_LIMIT: usize = 63_206;

#[derive(Debug, Deserialize)]
pub(crate) struct GraphId {
    pub id: String,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
}

/// Classify a Graph API error
///
/// Graph reports most failures as HTTP 400 with a numeric code in the body,
/// so the code decides and the status is only the fallback.
pub(crate) fn classify_graph_error(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> PlatformError {
    let error = match serde_json::from_str::<GraphErrorBody>(body) {
        Ok(parsed) => parsed.error,
        Err(_) => return http::classify_status(status, retry_after, body),
    };

    let detail = format!("Graph error {}: {}", error.code, error.message);
    match error.code {
        // Invalid or expired access token
        190 | 102 => PlatformError::AuthExpired(detail),
        // Application, user and page level throttling
        4 | 17 | 32 | 613 => PlatformError::RateLimited {
            message: detail,
            retry_after,
        },
        // Unknown or temporary server-side errors
        1 | 2 => PlatformError::Network(detail),
        _ => match http::classify_status(status, retry_after, body) {
            PlatformError::Network(_) => PlatformError::Network(detail),
            PlatformError::AuthExpired(_) => PlatformError::AuthExpired(detail),
            _ => PlatformError::Rejected(detail),
        },
    }
}

pub struct FacebookAdapter {
    client: reqwest::Client,
    endpoints: Endpoints,
}

impl FacebookAdapter {
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        Ok(Self {
            client: http::build_client(config)?,
            endpoints: Endpoints::resolve(config, DEFAULT_API_BASE, DEFAULT_API_BASE, ""),
        })
    }
}

#[async_trait]
impl PlatformAdapter for FacebookAdapter {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    fn character_limit(&self) -> Option<usize> {
        Some(CHARACTER_LIMIT)
    }

    fn supports_refresh(&self) -> bool {
        false
    }

    async fn publish(&self, content: &Content, credential: &Credential) -> PlatformResult<String> {
        let mut body = serde_json::json!({ "message": content.text });
        if let Some(link) = content.media_urls.first() {
            body["link"] = serde_json::Value::String(link.clone());
        }

        let response = self
            .client
            .post(self.endpoints.url(&format!("/{}/me/feed", GRAPH_VERSION)))
            .bearer_auth(credential.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(http::send_error)?;

        let created: GraphId = http::check_status_with(response, classify_graph_error)
            .await?
            .json()
            .await
            .map_err(http::send_error)?;
        Ok(created.id)
    }

    async fn validate_credential(&self, credential: &Credential) -> PlatformResult<bool> {
        let response = self
            .client
            .get(self.endpoints.url(&format!("/{}/me", GRAPH_VERSION)))
            .bearer_auth(credential.access_token.expose_secret())
            .send()
            .await
            .map_err(http::send_error)?;

        match http::check_status_with(response, classify_graph_error).await {
            Ok(_) => Ok(true),
            Err(PlatformError::AuthExpired(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn refresh(&self, _refresh_token: &SecretString) -> std::result::Result<Credential, AuthError> {
        Err(AuthError::NeedsReauthorization(
            "Facebook page tokens cannot be refreshed; reconnect the page".to_string(),
        ))
    }
}
