//! Platform connection credentials and their refresh
//!
//! [`TokenRefreshManager`] is the only writer of `platform_connections` after
//! onboarding. It hands out credentials that are valid for at least the
//! refresh window, refreshes them when they are about to expire or after a
//! platform rejected them, and serialises refreshes per connection so that
//! concurrent workers never spend the same refresh credential twice.

use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{AuthError, AutopostError, PlatformError, Result};
use crate::platforms::{AdapterRegistry, PlatformAdapter};
use crate::types::{now_ms, ConnectionKey, Credential, PlatformConnection};

/// Why a refresh is happening
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshCause {
    /// The credential is inside the refresh window but may still work
    NearExpiry,
    /// The platform answered `AuthExpired` to this credential
    Rejected,
}

#[derive(Clone)]
pub struct TokenRefreshManager {
    db: Database,
    adapters: AdapterRegistry,
    refresh_window_ms: i64,
    locks: Arc<StdMutex<HashMap<ConnectionKey, Arc<Mutex<()>>>>>,
}

impl TokenRefreshManager {
    pub fn new(db: Database, adapters: AdapterRegistry, refresh_window: Duration) -> Self {
        Self {
            db,
            adapters,
            refresh_window_ms: refresh_window.as_millis() as i64,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Store the credential produced by an OAuth flow and mark the connection valid
    pub async fn upsert_connection(&self, key: &ConnectionKey, credential: &Credential) -> Result<()> {
        self.db.upsert_connection(key, credential).await?;
        info!(connection = %key, "Platform connection stored");
        Ok(())
    }

    /// A credential that is valid for at least the refresh window
    pub async fn get_valid_credential(&self, key: &ConnectionKey) -> Result<Credential> {
        let connection = self.load(key).await?;

        if !connection.credential.expires_within(now_ms(), self.refresh_window_ms) {
            return Ok(connection.credential);
        }

        debug!(connection = %key, "Credential inside refresh window");
        self.refresh(key, &connection.credential, RefreshCause::NearExpiry)
            .await
    }

    /// Replace a credential the platform just rejected
    ///
    /// If another worker already replaced it, that credential is returned
    /// without a second refresh request.
    pub async fn refresh_after_rejection(
        &self,
        key: &ConnectionKey,
        rejected: &Credential,
    ) -> Result<Credential> {
        self.refresh(key, rejected, RefreshCause::Rejected).await
    }

    /// Check the stored credential against the platform
    ///
    /// Returns `Ok(false)` when the connection needs re-authorization; it is
    /// marked invalid in that case.
    pub async fn verify_connection(&self, key: &ConnectionKey) -> Result<bool> {
        let adapter = self.adapter(key)?;

        let credential = match self.get_valid_credential(key).await {
            Ok(credential) => credential,
            Err(AutopostError::Auth(AuthError::NeedsReauthorization(_))) => return Ok(false),
            Err(e) => return Err(e),
        };

        if adapter.validate_credential(&credential).await? {
            return Ok(true);
        }

        let refreshed = match self.refresh_after_rejection(key, &credential).await {
            Ok(refreshed) => refreshed,
            Err(AutopostError::Auth(AuthError::NeedsReauthorization(_))) => return Ok(false),
            Err(e) => return Err(e),
        };

        if adapter.validate_credential(&refreshed).await? {
            Ok(true)
        } else {
            self.invalidate(key, "refreshed credential was rejected").await?;
            Ok(false)
        }
    }

    async fn refresh(
        &self,
        key: &ConnectionKey,
        stale: &Credential,
        cause: RefreshCause,
    ) -> Result<Credential> {
        let adapter = self.adapter(key)?;
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        // Whoever held the lock before us may already have replaced the credential
        let current = self.load(key).await?.credential;
        if !current.same_access_token(stale) {
            debug!(connection = %key, "Credential already replaced; reusing it");
            return Ok(current);
        }

        let refresh_token = match &current.refresh_token {
            Some(token) if adapter.supports_refresh() => {
                SecretString::from(token.expose_secret().to_string())
            }
            _ => {
                let reason = format!("{} connection cannot be refreshed", key.platform);
                return Err(self.invalidate(key, &reason).await?.into());
            }
        };

        match adapter.refresh(&refresh_token).await {
            Ok(credential) => {
                self.db.upsert_connection(key, &credential).await?;
                info!(connection = %key, ?cause, "Credential refreshed");
                Ok(credential)
            }
            Err(AuthError::NeedsReauthorization(reason)) => {
                Err(self.invalidate(key, &reason).await?.into())
            }
            Err(AuthError::RefreshUnavailable(reason)) => {
                if cause == RefreshCause::NearExpiry && !current.is_expired(now_ms()) {
                    warn!(
                        connection = %key,
                        error = %reason,
                        "Refresh failed; using the current credential until it expires"
                    );
                    Ok(current)
                } else {
                    warn!(connection = %key, error = %reason, "Refresh failed");
                    Err(AuthError::RefreshUnavailable(reason).into())
                }
            }
        }
    }

    async fn load(&self, key: &ConnectionKey) -> Result<PlatformConnection> {
        let connection = self.db.get_connection(key).await?.ok_or_else(|| {
            AuthError::NeedsReauthorization(format!("No {} connection for {}", key.platform, key.subscriber_id))
        })?;

        if !connection.valid {
            return Err(AuthError::NeedsReauthorization(format!(
                "{} connection needs re-authorization",
                key
            ))
            .into());
        }

        Ok(connection)
    }

    async fn invalidate(&self, key: &ConnectionKey, reason: &str) -> Result<AuthError> {
        self.db.invalidate_connection(key).await?;
        warn!(connection = %key, reason, "Connection marked for re-authorization");
        Ok(AuthError::NeedsReauthorization(reason.to_string()))
    }

    fn adapter(&self, key: &ConnectionKey) -> Result<Arc<dyn PlatformAdapter>> {
        self.adapters.get(key.platform).ok_or_else(|| {
            PlatformError::Rejected(format!("No adapter registered for {}", key.platform)).into()
        })
    }

    /// The refresh lock for `key`
    ///
    /// Locks nobody holds or waits on are dropped here, so the map only
    /// carries connections with a refresh in progress.
    fn lock_for(&self, key: &ConnectionKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(key.clone()).or_default().clone()
    }
}
