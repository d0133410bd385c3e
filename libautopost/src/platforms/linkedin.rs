//! LinkedIn adapter (versioned REST Posts API)
//!
//! Posting needs the member URN of the author, which is looked up from the
//! OpenID `userinfo` endpoint with the same credential.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::config::PlatformConfig;
use crate::error::{AuthError, PlatformError, Result};
use crate::types::{Content, Credential, Platform};

use super::http::{self, Endpoints};
use super::{PlatformAdapter, PlatformResult};

pub const DEFAULT_API_BASE: &str = "https://api.linkedin.com";
const DEFAULT_TOKEN_URL: &str = "https://www.linkedin.com/oauth/v2/accessToken";
const TOKEN_PATH: &str = "/oauth/v2/accessToken";
const API_VERSION: &str = "202405";
const CHARACTER_LIMIT: usize = 3000;

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
}

pub struct LinkedInAdapter {
    client: reqwest::Client,
    endpoints: Endpoints,
    client_id: String,
    client_secret: SecretString,
}

impl LinkedInAdapter {
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        Ok(Self {
            client: http::build_client(config)?,
            endpoints: Endpoints::resolve(config, DEFAULT_API_BASE, DEFAULT_TOKEN_URL, TOKEN_PATH),
            client_id: config.client_id.clone().unwrap_or_default(),
            client_secret: SecretString::from(config.client_secret.clone().unwrap_or_default()),
        })
    }

    async fn author_urn(&self, credential: &Credential) -> PlatformResult<String> {
        let response = self
            .client
            .get(self.endpoints.url("/v2/userinfo"))
            .bearer_auth(credential.access_token.expose_secret())
            .send()
            .await
            .map_err(http::send_error)?;

        let info: UserInfo = http::check_status(response)
            .await?
            .json()
            .await
            .map_err(http::send_error)?;
        Ok(format!("urn:li:person:{}", info.sub))
    }
}

#[async_trait]
impl PlatformAdapter for LinkedInAdapter {
    fn platform(&self) -> Platform {
        Platform::LinkedIn
    }

    fn character_limit(&self) -> Option<usize> {
        Some(CHARACTER_LIMIT)
    }

    async fn publish(&self, content: &Content, credential: &Credential) -> PlatformResult<String> {
        let author = self.author_urn(credential).await?;

        let response = self
            .client
            .post(self.endpoints.url("/rest/posts"))
            .bearer_auth(credential.access_token.expose_secret())
            .header("LinkedIn-Version", API_VERSION)
            .header("X-Restli-Protocol-Version", "2.0.0")
            .json(&json!({
                "author": author,
                "commentary": http::text_with_links(&content.text, &content.media_urls),
                "visibility": "PUBLIC",
                "distribution": {
                    "feedDistribution": "MAIN_FEED",
                    "targetEntities": [],
                    "thirdPartyDistributionChannels": []
                },
                "lifecycleState": "PUBLISHED",
                "isReshareDisabledByAuthor": false
            }))
            .send()
            .await
            .map_err(http::send_error)?;

        let response = http::check_status(response).await?;

        // The new post's URN comes back in a header, not the body
        response
            .headers()
            .get("x-restli-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| {
                PlatformError::Rejected("LinkedIn response did not include a post id".to_string())
            })
    }

    async fn validate_credential(&self, credential: &Credential) -> PlatformResult<bool> {
        http::probe(
            self.client
                .get(self.endpoints.url("/v2/userinfo"))
                .bearer_auth(credential.access_token.expose_secret()),
        )
        .await
    }

    async fn refresh(&self, refresh_token: &SecretString) -> std::result::Result<Credential, AuthError> {
        let request = self.client.post(&self.endpoints.token_url).form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
        ]);

        let token = http::request_token(Platform::LinkedIn, request).await?;
        Ok(token.into_credential(refresh_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> LinkedInAdapter {
        LinkedInAdapter::new(&PlatformConfig {
            enabled: true,
            base_url: Some(server.uri()),
            client_id: Some("li-client".to_string()),
            client_secret: Some("li-secret".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    async fn mount_userinfo(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/v2/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sub": "abc123" })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_publish_reads_post_urn_header() {
        let server = MockServer::start().await;
        mount_userinfo(&server).await;
        Mock::given(method("POST"))
            .and(path("/rest/posts"))
            .and(header("linkedin-version", API_VERSION))
            .and(body_partial_json(json!({
                "author": "urn:li:person:abc123",
                "commentary": "Hiring!"
            })))
            .respond_with(
                ResponseTemplate::new(201).insert_header("x-restli-id", "urn:li:share:7000"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let id = adapter(&server)
            .publish(&Content::text("Hiring!"), &Credential::new("tok", None, None))
            .await
            .unwrap();
        assert_eq!(id, "urn:li:share:7000");
    }

    #[tokio::test]
    async fn test_publish_server_error_is_transient() {
        let server = MockServer::start().await;
        mount_userinfo(&server).await;
        Mock::given(method("POST"))
            .and(path("/rest/posts"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .publish(&Content::text("Hiring!"), &Credential::new("tok", None, None))
            .await
            .unwrap_err();
        match err {
            PlatformError::Network(msg) => assert!(msg.contains("upstream unavailable")),
            other => panic!("Expected Network, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_unprocessable_is_rejected() {
        let server = MockServer::start().await;
        mount_userinfo(&server).await;
        Mock::given(method("POST"))
            .and(path("/rest/posts"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .publish(&Content::text("Hiring!"), &Credential::new("tok", None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_refresh_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/v2/accessToken"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .refresh(&SecretString::from("r".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RefreshUnavailable(_)));
    }
}
