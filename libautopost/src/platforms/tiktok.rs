//! TikTok adapter (Content Posting API, pull-from-URL video uploads)

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::config::PlatformConfig;
use crate::error::{AuthError, PlatformError, Result};
use crate::types::{Content, Credential, Platform};

use super::http::{self, Endpoints};
use super::{PlatformAdapter, PlatformResult};

pub const DEFAULT_API_BASE: &str = "https://open.tiktokapis.com";
const DEFAULT_TOKEN_URL: &str = "https://open.tiktokapis.com/v2/oauth/token/";
const TOKEN_PATH: &str = "/v2/oauth/token/";
const TITLE_LIMIT: usize = 2200;

/// TikTok wraps every response in `{ data, error: { code, message } }`
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    error: ApiError,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct PublishData {
    publish_id: String,
}

fn classify_error_code(code: &str, message: &str, retry_after: Option<Duration>) -> Option<PlatformError> {
    let detail = format!("TikTok error {}: {}", code, message);
    match code {
        "ok" | "" => None,
        "access_token_invalid" | "scope_not_authorized" | "token_not_authorized_for_specified_deployment" => {
            Some(PlatformError::AuthExpired(detail))
        }
        "rate_limit_exceeded" | "spam_risk_too_many_posts" | "spam_risk_too_many_pending_share" => {
            Some(PlatformError::RateLimited {
                message: detail,
                retry_after,
            })
        }
        "internal_error" => Some(PlatformError::Network(detail)),
        _ => Some(PlatformError::Rejected(detail)),
    }
}

fn classify_tiktok_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> PlatformError {
    match serde_json::from_str::<Envelope<serde_json::Value>>(body) {
        Ok(envelope) => classify_error_code(&envelope.error.code, &envelope.error.message, retry_after)
            .unwrap_or_else(|| http::classify_status(status, retry_after, body)),
        Err(_) => http::classify_status(status, retry_after, body),
    }
}

pub struct TikTokAdapter {
    client: reqwest::Client,
    endpoints: Endpoints,
    client_key: String,
    client_secret: SecretString,
}

impl TikTokAdapter {
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        Ok(Self {
            client: http::build_client(config)?,
            endpoints: Endpoints::resolve(config, DEFAULT_API_BASE, DEFAULT_TOKEN_URL, TOKEN_PATH),
            client_key: config.client_id.clone().unwrap_or_default(),
            client_secret: SecretString::from(config.client_secret.clone().unwrap_or_default()),
        })
    }
}

#[async_trait]
impl PlatformAdapter for TikTokAdapter {
    fn platform(&self) -> Platform {
        Platform::TikTok
    }

    fn character_limit(&self) -> Option<usize> {
        Some(TITLE_LIMIT)
    }

    fn validate_content(&self, content: &Content) -> PlatformResult<()> {
        if content.media_urls.is_empty() {
            return Err(PlatformError::Rejected("TikTok posts need a video".to_string()));
        }

        let count = content.text.chars().count();
        if count > TITLE_LIMIT {
            return Err(PlatformError::Rejected(format!(
                "Content exceeds {} character limit (got {} characters)",
                TITLE_LIMIT, count
            )));
        }
        Ok(())
    }

    async fn publish(&self, content: &Content, credential: &Credential) -> PlatformResult<String> {
        let video_url = content
            .media_urls
            .first()
            .ok_or_else(|| PlatformError::Rejected("TikTok posts need a video".to_string()))?;

        let response = self
            .client
            .post(self.endpoints.url("/v2/post/publish/video/init/"))
            .bearer_auth(credential.access_token.expose_secret())
            .json(&json!({
                "post_info": {
                    "title": content.text,
                    "privacy_level": "PUBLIC_TO_EVERYONE"
                },
                "source_info": {
                    "source": "PULL_FROM_URL",
                    "video_url": video_url
                }
            }))
            .send()
            .await
            .map_err(http::send_error)?;

        let envelope: Envelope<PublishData> = http::check_status_with(response, classify_tiktok_error)
            .await?
            .json()
            .await
            .map_err(http::send_error)?;

        if let Some(error) = classify_error_code(&envelope.error.code, &envelope.error.message, None) {
            return Err(error);
        }

        envelope
            .data
            .map(|d| d.publish_id)
            .ok_or_else(|| PlatformError::Rejected("TikTok response did not include a publish id".to_string()))
    }

    async fn validate_credential(&self, credential: &Credential) -> PlatformResult<bool> {
        let response = self
            .client
            .get(self.endpoints.url("/v2/user/info/"))
            .query(&[("fields", "open_id")])
            .bearer_auth(credential.access_token.expose_secret())
            .send()
            .await
            .map_err(http::send_error)?;

        match http::check_status_with(response, classify_tiktok_error).await {
            Ok(_) => Ok(true),
            Err(PlatformError::AuthExpired(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn refresh(&self, refresh_token: &SecretString) -> std::result::Result<Credential, AuthError> {
        let request = self.client.post(&self.endpoints.token_url).form(&[
            ("client_key", self.client_key.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret()),
        ]);

        let token = http::request_token(Platform::TikTok, request).await?;
        Ok(token.into_credential(refresh_token))
    }
}
