//! Mock adapter implementation for testing
//!
//! A scriptable stand-in for a real platform. Publish outcomes can be queued
//! up front (fail twice, then succeed), refreshes can succeed, fail or be
//! slow, and every call is counted so tests can assert on exactly what the
//! queue and the token manager did. Clones share their counters and script.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{AuthError, PlatformError};
use crate::platforms::{PlatformAdapter, PlatformResult};
use crate::types::{now_ms, Content, Credential, Platform};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One recorded publish call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishCall {
    pub text: String,
    /// Access token the call was made with
    pub access_token: String,
}

/// Configuration for mock adapter behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub platform: Platform,

    /// Delay before completing publish (simulates network latency)
    pub delay: Duration,

    /// Delay before completing refresh
    pub refresh_delay: Duration,

    pub character_limit: Option<usize>,

    pub supports_refresh: bool,

    /// Error returned by every refresh, if set
    pub refresh_error: Option<AuthError>,

    /// Outcome of publish calls once the script is exhausted
    pub fallback: Option<PlatformError>,

    /// Access tokens the platform rejects with `AuthExpired`
    pub rejected_tokens: Arc<Mutex<Vec<String>>>,

    /// Outcomes consumed in order by publish calls
    pub script: Arc<Mutex<VecDeque<PlatformResult<()>>>>,

    pub publish_calls: Arc<Mutex<Vec<PublishCall>>>,

    pub refresh_call_count: Arc<Mutex<usize>>,

    pub validate_call_count: Arc<Mutex<usize>>,
}

impl MockConfig {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            delay: Duration::from_millis(0),
            refresh_delay: Duration::from_millis(0),
            character_limit: None,
            supports_refresh: true,
            refresh_error: None,
            fallback: None,
            rejected_tokens: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            publish_calls: Arc::new(Mutex::new(Vec::new())),
            refresh_call_count: Arc::new(Mutex::new(0)),
            validate_call_count: Arc::new(Mutex::new(0)),
        }
    }
}

/// Mock platform adapter for testing
#[derive(Debug, Clone)]
pub struct MockAdapter {
    config: MockConfig,
}

impl MockAdapter {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// An adapter that always publishes successfully
    pub fn success(platform: Platform) -> Self {
        Self::new(MockConfig::new(platform))
    }

    /// An adapter whose every publish fails with `error`
    pub fn failing(platform: Platform, error: PlatformError) -> Self {
        Self::new(MockConfig {
            fallback: Some(error),
            ..MockConfig::new(platform)
        })
    }

    /// An adapter that plays `outcomes` in order, then succeeds
    pub fn scripted(platform: Platform, outcomes: Vec<PlatformResult<()>>) -> Self {
        let config = MockConfig::new(platform);
        lock(&config.script).extend(outcomes);
        Self::new(config)
    }

    pub fn with_delay(platform: Platform, delay: Duration) -> Self {
        Self::new(MockConfig {
            delay,
            ..MockConfig::new(platform)
        })
    }

    /// An adapter for a platform that has no refresh grant
    pub fn without_refresh(platform: Platform) -> Self {
        Self::new(MockConfig {
            supports_refresh: false,
            ..MockConfig::new(platform)
        })
    }

    /// An adapter whose refresh calls fail with `error`
    pub fn refresh_failure(platform: Platform, error: AuthError) -> Self {
        Self::new(MockConfig {
            refresh_error: Some(error),
            ..MockConfig::new(platform)
        })
    }

    /// Make refresh calls take `delay`
    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.config.refresh_delay = delay;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.config.character_limit = Some(limit);
        self
    }

    /// Queue another publish outcome
    pub fn push_outcome(&self, outcome: PlatformResult<()>) {
        lock(&self.config.script).push_back(outcome);
    }

    /// Have the platform answer `AuthExpired` to this access token
    pub fn reject_token(&self, access_token: &str) {
        lock(&self.config.rejected_tokens).push(access_token.to_string());
    }

    pub fn publish_call_count(&self) -> usize {
        lock(&self.config.publish_calls).len()
    }

    pub fn publish_calls(&self) -> Vec<PublishCall> {
        lock(&self.config.publish_calls).clone()
    }

    pub fn refresh_call_count(&self) -> usize {
        *lock(&self.config.refresh_call_count)
    }

    pub fn validate_call_count(&self) -> usize {
        *lock(&self.config.validate_call_count)
    }

    fn is_rejected(&self, access_token: &str) -> bool {
        lock(&self.config.rejected_tokens)
            .iter()
            .any(|t| t == access_token)
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        self.config.platform
    }

    fn character_limit(&self) -> Option<usize> {
        self.config.character_limit
    }

    fn supports_refresh(&self) -> bool {
        self.config.supports_refresh
    }

    async fn publish(&self, content: &Content, credential: &Credential) -> PlatformResult<String> {
        let access_token = credential.access_token.expose_secret().to_string();
        let call_number = {
            let mut calls = lock(&self.config.publish_calls);
            calls.push(PublishCall {
                text: content.text.clone(),
                access_token: access_token.clone(),
            });
            calls.len()
        };

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        if self.is_rejected(&access_token) {
            return Err(PlatformError::AuthExpired("Mock token expired".to_string()));
        }

        let scripted = lock(&self.config.script).pop_front();
        match scripted {
            Some(Err(e)) => return Err(e),
            Some(Ok(())) => {}
            None => {
                if let Some(e) = &self.config.fallback {
                    return Err(e.clone());
                }
            }
        }

        Ok(format!("{}:mock-{}", self.config.platform, call_number))
    }

    async fn validate_credential(&self, credential: &Credential) -> PlatformResult<bool> {
        *lock(&self.config.validate_call_count) += 1;
        Ok(!self.is_rejected(credential.access_token.expose_secret()))
    }

    async fn refresh(&self, refresh_token: &SecretString) -> Result<Credential, AuthError> {
        let call_number = {
            let mut count = lock(&self.config.refresh_call_count);
            *count += 1;
            *count
        };

        if !self.config.refresh_delay.is_zero() {
            sleep(self.config.refresh_delay).await;
        }

        if !self.config.supports_refresh {
            return Err(AuthError::NeedsReauthorization(format!(
                "{} has no refresh grant",
                self.config.platform
            )));
        }

        if let Some(e) = &self.config.refresh_error {
            return Err(e.clone());
        }

        Ok(Credential::new(
            format!("{}-refreshed-{}", self.config.platform, call_number),
            Some(refresh_token.expose_secret().to_string()),
            Some(now_ms() + 3_600_000),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(token: &str) -> Credential {
        Credential::new(token, Some("refresh".to_string()), None)
    }

    #[tokio::test]
    async fn test_mock_success() {
        let adapter = MockAdapter::success(Platform::X);

        assert_eq!(adapter.name(), "x");
        assert_eq!(adapter.character_limit(), None);

        let post_id = adapter.publish(&Content::text("Test content"), &credential("t")).await.unwrap();
        assert_eq!(post_id, "x:mock-1");
        assert_eq!(adapter.publish_call_count(), 1);

        let calls = adapter.publish_calls();
        assert_eq!(calls[0].text, "Test content");
        assert_eq!(calls[0].access_token, "t");
    }

    #[tokio::test]
    async fn test_mock_script_then_success() {
        let adapter = MockAdapter::scripted(
            Platform::LinkedIn,
            vec![
                Err(PlatformError::Network("reset".to_string())),
                Err(PlatformError::Rejected("bad media".to_string())),
            ],
        );

        let content = Content::text("x");
        assert!(matches!(
            adapter.publish(&content, &credential("t")).await,
            Err(PlatformError::Network(_))
        ));
        assert!(matches!(
            adapter.publish(&content, &credential("t")).await,
            Err(PlatformError::Rejected(_))
        ));
        assert!(adapter.publish(&content, &credential("t")).await.is_ok());
        assert_eq!(adapter.publish_call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_failing_always_fails() {
        let adapter = MockAdapter::failing(Platform::X, PlatformError::Network("down".to_string()));
        for _ in 0..3 {
            assert!(adapter.publish(&Content::text("x"), &credential("t")).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_mock_rejected_token() {
        let adapter = MockAdapter::success(Platform::X);
        adapter.reject_token("old");

        assert!(matches!(
            adapter.publish(&Content::text("x"), &credential("old")).await,
            Err(PlatformError::AuthExpired(_))
        ));
        assert!(!adapter.validate_credential(&credential("old")).await.unwrap());
        assert!(adapter.validate_credential(&credential("new")).await.unwrap());
        assert_eq!(adapter.validate_call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_refresh() {
        let adapter = MockAdapter::success(Platform::TikTok);
        let refreshed = adapter
            .refresh(&SecretString::from("r1".to_string()))
            .await
            .unwrap();

        assert_eq!(refreshed.access_token.expose_secret(), "tiktok-refreshed-1");
        assert_eq!(refreshed.refresh_token.unwrap().expose_secret(), "r1");
        assert_eq!(adapter.refresh_call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_without_refresh() {
        let adapter = MockAdapter::without_refresh(Platform::Facebook);
        assert!(!adapter.supports_refresh());
        assert!(matches!(
            adapter.refresh(&SecretString::from("r".to_string())).await,
            Err(AuthError::NeedsReauthorization(_))
        ));
    }

    #[tokio::test]
    async fn test_clones_share_counters() {
        let adapter = MockAdapter::success(Platform::X);
        let clone = adapter.clone();

        clone.publish(&Content::text("x"), &credential("t")).await.unwrap();
        assert_eq!(adapter.publish_call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_with_delay() {
        let adapter = MockAdapter::with_delay(Platform::X, Duration::from_millis(50));

        let start = std::time::Instant::now();
        adapter.publish(&Content::text("Test"), &credential("t")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_mock_with_character_limit() {
        let adapter = MockAdapter::success(Platform::X).with_limit(10);

        assert!(adapter.validate_content(&Content::text("Short")).is_ok());
        let result = adapter.validate_content(&Content::text("This is way too long"));
        assert!(result.unwrap_err().to_string().contains("character limit"));
    }
}
