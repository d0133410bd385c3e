//! Platform abstraction and implementations
//!
//! Every platform implements [`PlatformAdapter`]. The publishing queue and the
//! token refresh manager only ever talk to this trait; errors come back already
//! classified as [`PlatformError`] / [`AuthError`] so retry policy never needs
//! to know which platform it is dealing with.
//!
//! # Examples
//!
//! ```no_run
//! use libautopost::platforms::{mock::MockAdapter, PlatformAdapter};
//! use libautopost::types::{Content, Credential, Platform};
//!
//! # async fn example() {
//! let adapter = MockAdapter::success(Platform::X);
//! let credential = Credential::new("access", None, None);
//!
//! if adapter.validate_content(&Content::text("Hello")).is_ok() {
//!     let id = adapter.publish(&Content::text("Hello"), &credential).await;
//!     println!("Published: {:?}", id);
//! }
//! # }
//! ```

use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::error::{AuthError, PlatformError, Result};
use crate::types::{Content, Credential, Platform};

pub mod facebook;
pub(crate) mod http;
pub mod instagram;
pub mod linkedin;
pub mod tiktok;
pub mod x;

// Mock adapter is available for all builds (not just tests) to support integration tests
pub mod mock;

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Uniform capability interface of a social platform
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Which platform this adapter publishes to
    fn platform(&self) -> Platform;

    /// Lowercase identifier used in logs and storage
    fn name(&self) -> &str {
        self.platform().as_str()
    }

    /// Maximum caption length in characters, if the platform has one
    fn character_limit(&self) -> Option<usize>;

    /// Whether the platform issues refresh credentials at all
    fn supports_refresh(&self) -> bool {
        true
    }

    /// Check content against platform rules before any network call
    ///
    /// Violations are reported as `PlatformError::Rejected` so they fail the
    /// post without consuming retries.
    fn validate_content(&self, content: &Content) -> PlatformResult<()> {
        if content.text.trim().is_empty() && content.media_urls.is_empty() {
            return Err(PlatformError::Rejected("Content cannot be empty".to_string()));
        }

        if let Some(limit) = self.character_limit() {
            let count = content.text.chars().count();
            if count > limit {
                return Err(PlatformError::Rejected(format!(
                    "Content exceeds {} character limit (got {} characters)",
                    limit, count
                )));
            }
        }

        Ok(())
    }

    /// Publish content and return the platform-assigned post id
    async fn publish(&self, content: &Content, credential: &Credential) -> PlatformResult<String>;

    /// Ask the platform whether the access credential is still accepted
    ///
    /// `Ok(false)` means the platform rejected it; errors mean the question
    /// could not be answered.
    async fn validate_credential(&self, credential: &Credential) -> PlatformResult<bool>;

    /// Exchange a refresh credential for a new access credential
    async fn refresh(&self, refresh_token: &SecretString) -> std::result::Result<Credential, AuthError>;
}

/// Adapters by platform
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the adapters enabled in configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();

        for platform in Platform::ALL {
            let platform_config = match config.platform(platform) {
                Some(c) if c.enabled => c,
                _ => continue,
            };

            let adapter: Arc<dyn PlatformAdapter> = match platform {
                Platform::X => Arc::new(x::XAdapter::new(platform_config)?),
                Platform::LinkedIn => Arc::new(linkedin::LinkedInAdapter::new(platform_config)?),
                Platform::Facebook => Arc::new(facebook::FacebookAdapter::new(platform_config)?),
                Platform::Instagram => Arc::new(instagram::InstagramAdapter::new(platform_config)?),
                Platform::TikTok => Arc::new(tiktok::TikTokAdapter::new(platform_config)?),
            };

            info!(platform = %platform, "Platform adapter enabled");
            registry.register(adapter);
        }

        Ok(registry)
    }

    /// Add or replace the adapter for its platform
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn PlatformAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<_> = self.adapters.keys().copied().collect();
        platforms.sort_by_key(|p| p.as_str());
        platforms
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockAdapter;
    use super::*;

    struct LimitedAdapter;

    #[async_trait]
    impl PlatformAdapter for LimitedAdapter {
        fn platform(&self) -> Platform {
            Platform::X
        }

        fn character_limit(&self) -> Option<usize> {
            Some(5)
        }

        async fn publish(&self, _: &Content, _: &Credential) -> PlatformResult<String> {
            Ok("id".to_string())
        }

        async fn validate_credential(&self, _: &Credential) -> PlatformResult<bool> {
            Ok(true)
        }

        async fn refresh(&self, _: &SecretString) -> std::result::Result<Credential, AuthError> {
            Err(AuthError::NeedsReauthorization("no refresh".to_string()))
        }
    }

    #[test]
    fn test_default_validation_counts_characters() {
        let adapter = LimitedAdapter;

        assert!(adapter.validate_content(&Content::text("héllo")).is_ok());

        let result = adapter.validate_content(&Content::text("héllo!"));
        match result {
            Err(PlatformError::Rejected(msg)) => assert!(msg.contains("5 character limit")),
            other => panic!("Expected Rejected, got {:?}", other),
        }
    }

    #[test]
    fn test_default_validation_rejects_empty() {
        let adapter = LimitedAdapter;
        assert!(adapter.validate_content(&Content::text("  ")).is_err());
        assert!(adapter
            .validate_content(&Content::text("").with_media("https://cdn.example.com/a.png"))
            .is_ok());
    }

    #[test]
    fn test_default_name_is_platform_name() {
        assert_eq!(LimitedAdapter.name(), "x");
        assert!(LimitedAdapter.supports_refresh());
    }

    #[test]
    fn test_registry_register_and_get() {
        let registry = AdapterRegistry::new()
            .with(Arc::new(MockAdapter::success(Platform::TikTok)))
            .with(Arc::new(MockAdapter::success(Platform::LinkedIn)));

        assert!(registry.get(Platform::TikTok).is_some());
        assert!(registry.get(Platform::X).is_none());
        assert_eq!(registry.platforms(), vec![Platform::LinkedIn, Platform::TikTok]);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_registry_from_config_only_enabled() {
        let toml_str = r#"
[database]
path = "/tmp/autopost-test.db"

[platforms.x]
enabled = true
client_id = "client"

[platforms.facebook]
enabled = false
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let registry = AdapterRegistry::from_config(&config).unwrap();

        assert_eq!(registry.platforms(), vec![Platform::X]);
        assert_eq!(registry.get(Platform::X).unwrap().character_limit(), Some(280));
    }
}
