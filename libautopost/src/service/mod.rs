//! Service layer for Autopost
//!
//! `AutopostService` wires the core components together over one database
//! and one event bus, and is what the binaries and embedding applications
//! talk to. Each component stays reachable on its own for callers that need
//! more than the facade offers.
//!
//! # Example
//!
//! ```no_run
//! use libautopost::service::AutopostService;
//! use libautopost::types::{Content, NewPost, Platform};
//!
//! # async fn example() -> libautopost::Result<()> {
//! let service = AutopostService::new().await?;
//! let mut events = service.subscribe();
//!
//! let draft = service
//!     .lifecycle()
//!     .create_draft(NewPost::new("sub-1", Platform::LinkedIn, Content::text("Launch day"), 0))
//!     .await?;
//! service.approve(&draft.id).await?;
//!
//! service.enforce().await?;
//! service.drain().await?;
//! # Ok(())
//! # }
//! ```

pub mod events;

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use self::events::{Event, EventBus, EventReceiver};
use crate::config::Config;
use crate::db::Database;
use crate::enforcer::{AutoPostingEnforcer, EnforcementReport, RenewalReport};
use crate::error::Result;
use crate::ledger::QuotaLedger;
use crate::lifecycle::PostLifecycle;
use crate::platforms::AdapterRegistry;
use crate::queue::{DrainReport, PublishingQueue};
use crate::throttle::PlatformThrottle;
use crate::tokens::TokenRefreshManager;
use crate::types::{CycleRenewed, PlanTier, Post, QuotaStatus, Subscriber};

const EVENT_CAPACITY: usize = 256;

/// Main service facade
///
/// Cloning is cheap; clones share the database pool, the queue and the bus.
#[derive(Clone)]
pub struct AutopostService {
    db: Database,
    config: Arc<Config>,
    lifecycle: PostLifecycle,
    ledger: QuotaLedger,
    tokens: TokenRefreshManager,
    queue: PublishingQueue,
    enforcer: AutoPostingEnforcer,
    events: EventBus,
}

impl AutopostService {
    /// Load configuration from the default location and open its database
    pub async fn new() -> Result<Self> {
        Self::from_config(Config::load()?).await
    }

    /// Open the configured database and build the enabled adapters
    pub async fn from_config(config: Config) -> Result<Self> {
        let db = Database::with_max_connections(&config.db_path(), config.database.max_connections).await?;
        let adapters = AdapterRegistry::from_config(&config)?;
        Ok(Self::with_parts(db, config, adapters))
    }

    /// Fresh in-memory database, for tests and dry runs
    pub async fn in_memory(config: Config, adapters: AdapterRegistry) -> Result<Self> {
        let db = Database::in_memory().await?;
        Ok(Self::with_parts(db, config, adapters))
    }

    pub fn with_parts(db: Database, config: Config, adapters: AdapterRegistry) -> Self {
        let events = EventBus::new(EVENT_CAPACITY);
        let lifecycle = PostLifecycle::new(db.clone());
        let ledger = QuotaLedger::new(db.clone());
        let tokens = TokenRefreshManager::new(db.clone(), adapters.clone(), config.tokens.refresh_window());

        let queue = PublishingQueue::new(
            lifecycle.clone(),
            tokens.clone(),
            adapters,
            PlatformThrottle::from_config(&config),
            events.clone(),
            config.queue.clone(),
        );
        let enforcer = AutoPostingEnforcer::new(db.clone(), events.clone(), config.enforcer.clone())
            .with_queue(queue.clone());

        Self {
            db,
            config: Arc::new(config),
            lifecycle,
            ledger,
            tokens,
            queue,
            enforcer,
            events,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lifecycle(&self) -> &PostLifecycle {
        &self.lifecycle
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn tokens(&self) -> &TokenRefreshManager {
        &self.tokens
    }

    pub fn queue(&self) -> &PublishingQueue {
        &self.queue
    }

    pub fn enforcer(&self) -> &AutoPostingEnforcer {
        &self.enforcer
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Register a subscriber with the allocation of their plan
    pub async fn add_subscriber(&self, id: &str, plan: PlanTier, cycle_start: i64) -> Result<Subscriber> {
        let subscriber = Subscriber {
            id: id.to_string(),
            plan,
            cycle_id: 1,
            cycle_start,
        };
        self.db.create_subscriber(&subscriber, plan.quota()).await?;
        info!(subscriber_id = %id, plan = %plan, "Subscriber added");
        Ok(subscriber)
    }

    pub async fn get_quota_status(&self, subscriber_id: &str) -> Result<QuotaStatus> {
        self.ledger.status(subscriber_id).await
    }

    /// Approve a draft and ask the enforcer to look at it right away
    pub async fn approve(&self, post_id: &str) -> Result<Post> {
        let post = self.lifecycle.approve(post_id).await?;
        self.enforcer.trigger();
        Ok(post)
    }

    /// Withdraw an approved or queued post
    pub async fn cancel(&self, post_id: &str, reason: &str) -> Result<Post> {
        let post = self.lifecycle.cancel(post_id, reason).await?;
        self.events.emit(Event::PostCancelled {
            post_id: post.id.clone(),
            platform: post.platform,
            reason: reason.to_string(),
        });
        Ok(post)
    }

    pub async fn renew(&self, renewal: &CycleRenewed) -> Result<Option<RenewalReport>> {
        self.enforcer.handle_cycle_renewed(renewal).await
    }

    /// One enforcement pass
    pub async fn enforce(&self) -> Result<EnforcementReport> {
        self.enforcer.enforce().await
    }

    /// Publish everything currently due
    pub async fn drain(&self) -> Result<DrainReport> {
        self.queue.drain().await
    }

    /// Run the queue and the enforcer until `shutdown` turns true
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        futures::try_join!(self.queue.run(shutdown.clone()), self.enforcer.run(shutdown))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AutopostError, LifecycleError, QuotaError};
    use crate::platforms::mock::MockAdapter;
    use crate::types::{now_ms, ConnectionKey, Content, Credential, NewPost, Platform, PostState};
    use std::sync::Arc;

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.queue.min_retry_delay_ms = 0;
        config.queue.base_delay_ms = 0;
        config.queue.max_delay_ms = 0;
        config
    }

    async fn service_with(adapter: MockAdapter) -> AutopostService {
        let adapters = AdapterRegistry::new().with(Arc::new(adapter));
        let service = AutopostService::in_memory(fast_config(), adapters).await.unwrap();
        service
            .add_subscriber("sub-1", PlanTier::Starter, now_ms() - 1000)
            .await
            .unwrap();
        service
            .tokens()
            .upsert_connection(
                &ConnectionKey::new("sub-1", Platform::X),
                &Credential::new("a1", Some("r1".to_string()), None),
            )
            .await
            .unwrap();
        service
    }

    async fn draft(service: &AutopostService) -> Post {
        service
            .lifecycle()
            .create_draft(NewPost::new("sub-1", Platform::X, Content::text("hello"), now_ms() - 1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_approve_enforce_drain_publishes() {
        let service = service_with(MockAdapter::success(Platform::X)).await;
        let mut events = service.subscribe();

        let post = draft(&service).await;
        service.approve(&post.id).await.unwrap();

        let status = service.get_quota_status("sub-1").await.unwrap();
        assert_eq!(status.reserved, 1);
        assert_eq!(status.committed, 0);

        assert_eq!(service.enforce().await.unwrap().admitted, 1);
        assert_eq!(service.drain().await.unwrap().published, 1);

        let status = service.get_quota_status("sub-1").await.unwrap();
        assert_eq!(status.reserved, 0);
        assert_eq!(status.committed, 1);
        assert_eq!(status.remaining, 29);

        let published = service.lifecycle().get(&post.id).await.unwrap();
        assert_eq!(published.state, PostState::Published);
        assert!(matches!(events.recv().await.unwrap(), Event::PostPublished { .. }));
    }

    #[tokio::test]
    async fn test_cancel_releases_and_emits() {
        let service = service_with(MockAdapter::success(Platform::X)).await;
        let mut events = service.subscribe();

        let post = draft(&service).await;
        service.approve(&post.id).await.unwrap();
        service.cancel(&post.id, "changed my mind").await.unwrap();

        let status = service.get_quota_status("sub-1").await.unwrap();
        assert_eq!(status.reserved, 0);
        assert_eq!(status.released, 1);

        match events.recv().await.unwrap() {
            Event::PostCancelled { post_id, reason, .. } => {
                assert_eq!(post_id, post.id);
                assert_eq!(reason, "changed my mind");
            }
            other => panic!("Expected PostCancelled, got {:?}", other),
        }

        // Nothing left to publish
        assert_eq!(service.enforce().await.unwrap().admitted, 0);
        assert_eq!(service.drain().await.unwrap().settled(), 0);
    }

    #[tokio::test]
    async fn test_approve_twice_is_refused() {
        let service = service_with(MockAdapter::success(Platform::X)).await;
        let post = draft(&service).await;

        service.approve(&post.id).await.unwrap();
        let err = service.approve(&post.id).await.unwrap_err();
        assert!(matches!(
            err,
            AutopostError::Lifecycle(LifecycleError::InvalidTransition { .. })
        ));
        assert_eq!(service.get_quota_status("sub-1").await.unwrap().reserved, 1);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_leaves_draft() {
        let service = service_with(MockAdapter::success(Platform::X)).await;
        for _ in 0..PlanTier::Starter.quota() {
            let post = draft(&service).await;
            service.approve(&post.id).await.unwrap();
        }

        let extra = draft(&service).await;
        let err = service.approve(&extra.id).await.unwrap_err();
        assert!(matches!(err, AutopostError::Quota(QuotaError::Exceeded { .. })));
        assert_eq!(service.lifecycle().get(&extra.id).await.unwrap().state, PostState::Draft);
    }

    #[tokio::test]
    async fn test_run_publishes_approved_post_and_stops() {
        let service = service_with(MockAdapter::success(Platform::X)).await;
        let mut events = service.subscribe();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = service.clone();
        let running = tokio::spawn(async move { runner.run(shutdown_rx).await });

        let post = draft(&service).await;
        service.approve(&post.id).await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, Event::PostPublished { post_id, .. } if post_id == post.id));

        shutdown_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
    }
}
