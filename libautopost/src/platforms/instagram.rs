//! Instagram adapter (Instagram API with Instagram Login)
//!
//! Publishing is two calls: create a media container from a hosted asset,
//! then publish the container. Long-lived tokens are refreshed with
//! themselves, so the refresh credential rotates with every refresh.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use crate::config::PlatformConfig;
use crate::error::{AuthError, PlatformError, Result};
use crate::types::{Content, Credential, Platform};

use super::facebook::{classify_graph_error, GraphId, GRAPH_VERSION};
use super::http::{self, Endpoints};
use super::{PlatformAdapter, PlatformResult};

pub const DEFAULT_API_BASE: &str = "https://graph.instagram.com";
const TOKEN_PATH: &str = "/refresh_access_token";
const CAPTION_LIMIT: usize = 2200;

fn is_video(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    path.ends_with(".mp4") || path.ends_with(".mov")
}

pub struct InstagramAdapter {
    client: reqwest::Client,
    endpoints: Endpoints,
}

impl InstagramAdapter {
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        let default_token_url = format!("{}{}", DEFAULT_API_BASE, TOKEN_PATH);
        Ok(Self {
            client: http::build_client(config)?,
            endpoints: Endpoints::resolve(config, DEFAULT_API_BASE, &default_token_url, TOKEN_PATH),
        })
    }

    async fn graph_post(
        &self,
        path: &str,
        credential: &Credential,
        body: serde_json::Value,
    ) -> PlatformResult<String> {
        let response = self
            .client
            .post(self.endpoints.url(&format!("/{}{}", GRAPH_VERSION, path)))
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
}

#[async_trait]
impl PlatformAdapter for InstagramAdapter {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    fn character_limit(&self) -> Option<usize> {
        Some(CAPTION_LIMIT)
    }

    fn validate_content(&self, content: &Content) -> PlatformResult<()> {
        if content.media_urls.is_empty() {
            return Err(PlatformError::Rejected(
                "Instagram posts need an image or video".to_string(),
            ));
        }

        let count = content.text.chars().count();
        if count > CAPTION_LIMIT {
            return Err(PlatformError::Rejected(format!(
                "Content exceeds {} character limit (got {} characters)",
                CAPTION_LIMIT, count
            )));
        }
        Ok(())
    }

    async fn publish(&self, content: &Content, credential: &Credential) -> PlatformResult<String> {
        let media_url = content.media_urls.first().ok_or_else(|| {
            PlatformError::Rejected("Instagram posts need an image or video".to_string())
        })?;

        let container = if is_video(media_url) {
            json!({ "media_type": "REELS", "video_url": media_url, "caption": content.text })
        } else {
            json!({ "image_url": media_url, "caption": content.text })
        };

        let creation_id = self.graph_post("/me/media", credential, container).await?;
        self.graph_post(
            "/me/media_publish",
            credential,
            json!({ "creation_id": creation_id }),
        )
        .await
    }

    async fn validate_credential(&self, credential: &Credential) -> PlatformResult<bool> {
        let response = self
            .client
            .get(self.endpoints.url(&format!("/{}/me", GRAPH_VERSION)))
            .query(&[("fields", "id")])
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

    async fn refresh(&self, refresh_token: &SecretString) -> std::result::Result<Credential, AuthError> {
        let request = self.client.get(&self.endpoints.token_url).query(&[
            ("grant_type", "ig_refresh_token"),
            ("access_token", refresh_token.expose_secret()),
        ]);

        let token = http::request_token(Platform::Instagram, request).await?;
        let rotated = SecretString::from(token.access_token.clone());
        Ok(token.into_credential(&rotated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> InstagramAdapter {
        InstagramAdapter::new(&PlatformConfig {
            enabled: true,
            base_url: Some(server.uri()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_requires_media() {
        let adapter = InstagramAdapter::new(&PlatformConfig::default()).unwrap();
        assert!(adapter.validate_content(&Content::text("caption only")).is_err());
        assert!(adapter
            .validate_content(&Content::text("caption").with_media("https://cdn.example.com/a.jpg"))
            .is_ok());
    }

    #[test]
    fn test_video_detection() {
        assert!(is_video("https://cdn.example.com/clip.MP4?sig=abc"));
        assert!(is_video("https://cdn.example.com/clip.mov"));
        assert!(!is_video("https://cdn.example.com/photo.jpg"));
    }

    #[tokio::test]
    async fn test_publish_creates_then_publishes_container() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v19.0/me/media"))
            .and(body_partial_json(json!({
                "image_url": "https://cdn.example.com/a.jpg",
                "caption": "New menu"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "container-1" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v19.0/me/media_publish"))
            .and(body_partial_json(json!({ "creation_id": "container-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "media-99" })))
            .expect(1)
            .mount(&server)
            .await;

        let content = Content::text("New menu").with_media("https://cdn.example.com/a.jpg");
        let id = adapter(&server)
            .publish(&content, &Credential::new("ig-token", None, None))
            .await
            .unwrap();
        assert_eq!(id, "media-99");
    }

    #[tokio::test]
    async fn test_refresh_rotates_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/refresh_access_token"))
            .and(query_param("grant_type", "ig_refresh_token"))
            .and(query_param("access_token", "ig-old"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ig-new",
                "token_type": "bearer",
                "expires_in": 5183944
            })))
            .mount(&server)
            .await;

        let refreshed = adapter(&server)
            .refresh(&SecretString::from("ig-old".to_string()))
            .await
            .unwrap();
        assert_eq!(refreshed.access_token.expose_secret(), "ig-new");
        assert_eq!(refreshed.refresh_token.as_ref().unwrap().expose_secret(), "ig-new");
    }

    #[tokio::test]
    async fn test_throttled_container_creation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v19.0/me/media"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "message": "Application request limit reached", "code": 4 }
            })))
            .mount(&server)
            .await;

        let content = Content::text("x").with_media("https://cdn.example.com/a.jpg");
        let err = adapter(&server)
            .publish(&content, &Credential::new("ig-token", None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::RateLimited { .. }));
    }
}
