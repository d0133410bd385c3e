//! X (formerly Twitter) adapter, API v2 with OAuth 2.0 user tokens

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::config::PlatformConfig;
use crate::error::{AuthError, Result};
use crate::types::{Content, Credential, Platform};

use super::http::{self, Endpoints};
use super::{PlatformAdapter, PlatformResult};

pub const DEFAULT_API_BASE: &str = "https://api.x.com";
const DEFAULT_TOKEN_URL: &str = "https://api.x.com/2/oauth2/token";
const TOKEN_PATH: &str = "/2/oauth2/token";
const CHARACTER_LIMIT: usize = 280;

#[derive(Debug, Deserialize)]
struct CreateTweetResponse {
    data: TweetData,
}

#[derive(Debug, Deserialize)]
struct TweetData {
    id: String,
}

pub struct XAdapter {
    client: reqwest::Client,
    endpoints: Endpoints,
    client_id: String,
}

impl XAdapter {
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        Ok(Self {
            client: http::build_client(config)?,
            endpoints: Endpoints::resolve(config, DEFAULT_API_BASE, DEFAULT_TOKEN_URL, TOKEN_PATH),
            client_id: config.client_id.clone().unwrap_or_default(),
        })
    }
}

#[async_trait]
impl PlatformAdapter for XAdapter {
    fn platform(&self) -> Platform {
        Platform::X
    }

    fn character_limit(&self) -> Option<usize> {
        Some(CHARACTER_LIMIT)
    }

    fn validate_content(&self, content: &Content) -> PlatformResult<()> {
        // Media references are posted as links, so they count against the limit
        let text = http::text_with_links(&content.text, &content.media_urls);
        if text.trim().is_empty() {
            return Err(crate::error::PlatformError::Rejected(
                "Content cannot be empty".to_string(),
            ));
        }
        let count = text.chars().count();
        if count > CHARACTER_LIMIT {
            return Err(crate::error::PlatformError::Rejected(format!(
                "Content exceeds {} character limit (got {} characters)",
                CHARACTER_LIMIT, count
            )));
        }
        Ok(())
    }

    async fn publish(&self, content: &Content, credential: &Credential) -> PlatformResult<String> {
        let response = self
            .client
            .post(self.endpoints.url("/2/tweets"))
            .bearer_auth(credential.access_token.expose_secret())
            .json(&json!({ "text": http::text_with_links(&content.text, &content.media_urls) }))
            .send()
            .await
            .map_err(http::send_error)?;

        let response = http::check_status(response).await?;
        let created: CreateTweetResponse = response.json().await.map_err(http::send_error)?;
        Ok(created.data.id)
    }

    async fn validate_credential(&self, credential: &Credential) -> PlatformResult<bool> {
        http::probe(
            self.client
                .get(self.endpoints.url("/2/users/me"))
                .bearer_auth(credential.access_token.expose_secret()),
        )
        .await
    }

    async fn refresh(&self, refresh_token: &SecretString) -> std::result::Result<Credential, AuthError> {
        let request = self.client.post(&self.endpoints.token_url).form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret()),
            ("client_id", self.client_id.as_str()),
        ]);

        let token = http::request_token(Platform::X, request).await?;
        Ok(token.into_credential(refresh_token))
    }
}
