//! Publishing queue
//!
//! A fixed pool of workers drains `Queued` posts in admission order. Each
//! attempt claims one post under a lease, obtains a credential from the
//! [`TokenRefreshManager`], calls the platform adapter behind the per-platform
//! throttle and a timeout shorter than the lease, and then settles the post:
//! published (quota committed), back to the queue with a backoff delay, or
//! failed (quota released).
//!
//! Retry policy is written against [`ErrorClass`] only. `AuthExpired` gets
//! one refresh-and-retry inside the attempt; if the refresh fails or the
//! refreshed credential is rejected too, the post fails as `AuthPermanent`.
//!
//! An attempt never runs past its lease: the whole attempt, throttle wait
//! included, is cut off shortly before the lease expires so that no other
//! worker can recover the post while a platform call is still in flight.

use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{AuthError, AutopostError, PlatformError, Result};
use crate::lifecycle::PostLifecycle;
use crate::platforms::{AdapterRegistry, PlatformAdapter, PlatformResult};
use crate::service::events::{Event, EventBus};
use crate::throttle::PlatformThrottle;
use crate::tokens::TokenRefreshManager;
use crate::types::{now_ms, ConnectionKey, Credential, Post};

/// Largest share of the nominal delay that jitter may take off
const JITTER_FRACTION: f64 = 0.2;

/// Upper bound on the part of a lease reserved for settling the post
const MAX_SETTLE_MARGIN: Duration = Duration::from_secs(5);

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue with this delay
    Retry(Duration),
    /// Attempts exhausted
    GiveUp,
}

/// Exponential backoff with downward jitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Floor between two attempts of the same post
    pub min_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            min_delay: Duration::from_millis(config.min_retry_delay_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// `min(base * 2^(attempt - 1), max)` for the attempt that just failed
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Decide after attempt number `attempt` (counting from 1) failed
    ///
    /// A server `Retry-After` hint can only lengthen the delay.
    pub fn decide(&self, attempt: u32, retry_after: Option<Duration>) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        let nominal = self.nominal_delay(attempt);
        let jitter = nominal.mul_f64(rand::thread_rng().gen_range(0.0..=JITTER_FRACTION));
        let mut delay = nominal.saturating_sub(jitter).max(self.min_delay);

        if let Some(hint) = retry_after {
            delay = delay.max(hint);
        }

        RetryDecision::Retry(delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// How one claimed post was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Published,
    Retrying,
    Failed,
    /// The attempt's result could not be recorded; lease recovery will requeue the post
    Unsettled,
}

/// Totals of a [`PublishingQueue::drain`] run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub published: usize,
    pub retried: usize,
    pub failed: usize,
    pub unsettled: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Published => self.published += 1,
            Outcome::Retrying => self.retried += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Unsettled => self.unsettled += 1,
        }
    }

    fn merge(&mut self, other: DrainReport) {
        self.published += other.published;
        self.retried += other.retried;
        self.failed += other.failed;
        self.unsettled += other.unsettled;
    }

    /// Posts that left the queue for good
    pub fn settled(&self) -> usize {
        self.published + self.failed
    }
}

#[derive(Clone)]
pub struct PublishingQueue {
    inner: Arc<Inner>,
}

struct Inner {
    lifecycle: PostLifecycle,
    tokens: TokenRefreshManager,
    adapters: AdapterRegistry,
    throttle: PlatformThrottle,
    events: EventBus,
    config: QueueConfig,
    backoff: BackoffPolicy,
    wakeup: Notify,
    instance: String,
}

impl PublishingQueue {
    pub fn new(
        lifecycle: PostLifecycle,
        tokens: TokenRefreshManager,
        adapters: AdapterRegistry,
        throttle: PlatformThrottle,
        events: EventBus,
        config: QueueConfig,
    ) -> Self {
        let backoff = BackoffPolicy::from_config(&config);
        let instance = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

        Self {
            inner: Arc::new(Inner {
                lifecycle,
                tokens,
                adapters,
                throttle,
                events,
                config,
                backoff,
                wakeup: Notify::new(),
                instance,
            }),
        }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.inner.backoff
    }

    /// Wake idle workers, e.g. after posts were admitted
    pub fn notify(&self) {
        self.inner.wakeup.notify_waiters();
    }

    /// Claim and process one due post
    ///
    /// `Ok(None)` means nothing was claimable. Errors are claim failures
    /// only; problems with the post itself end up in its state.
    pub async fn process_next(&self, worker_id: &str) -> Result<Option<Outcome>> {
        let claimed = self
            .inner
            .lifecycle
            .claim(worker_id, self.inner.config.lease(), now_ms())
            .await?;

        match claimed {
            Some(post) => Ok(Some(self.process(worker_id, post).await)),
            None => Ok(None),
        }
    }

    /// Process until no post is claimable, using the configured number of workers
    ///
    /// Posts waiting out a backoff delay are not claimable and stay queued.
    pub async fn drain(&self) -> Result<DrainReport> {
        self.inner
            .lifecycle
            .recover_expired_leases(now_ms())
            .await?;

        let mut workers = JoinSet::new();
        for n in 0..self.inner.config.workers {
            let queue = self.clone();
            let worker_id = self.worker_id(n);
            workers.spawn(async move {
                let mut report = DrainReport::default();
                loop {
                    match queue.process_next(&worker_id).await {
                        Ok(Some(outcome)) => report.record(outcome),
                        Ok(None) => break,
                        Err(e) => {
                            error!(worker = %worker_id, error = %e, "Could not claim a post");
                            break;
                        }
                    }
                }
                report
            });
        }

        let mut total = DrainReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => total.merge(report),
                Err(e) => error!(error = %e, "Queue worker panicked"),
            }
        }

        debug!(?total, "Queue drained");
        Ok(total)
    }

    /// Run the worker pool until `shutdown` turns true
    ///
    /// Workers finish the post they are working on before stopping.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            workers = self.inner.config.workers,
            instance = %self.inner.instance,
            "Publishing queue started"
        );

        let mut workers = JoinSet::new();
        for n in 0..self.inner.config.workers {
            let queue = self.clone();
            let worker_id = self.worker_id(n);
            let shutdown = shutdown.clone();
            workers.spawn(async move { queue.worker_loop(worker_id, shutdown).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Queue worker panicked");
            }
        }

        info!("Publishing queue stopped");
        Ok(())
    }

    async fn worker_loop(&self, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.process_next(&worker_id).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(worker = %worker_id, error = %e, "Could not claim a post");
                    true
                }
            };
            if !idle {
                continue;
            }

            match self.inner.lifecycle.recover_expired_leases(now_ms()).await {
                Ok(0) => {}
                Ok(_) => continue,
                Err(e) => warn!(worker = %worker_id, error = %e, "Lease recovery failed"),
            }

            tokio::select! {
                _ = self.inner.wakeup.notified() => {}
                _ = tokio::time::sleep(self.inner.config.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(worker = %worker_id, "Worker stopped");
    }

    fn worker_id(&self, n: usize) -> String {
        format!("worker-{}-{}", self.inner.instance, n)
    }

    async fn process(&self, worker_id: &str, post: Post) -> Outcome {
        let settled = match self.attempt(worker_id, &post).await {
            Ok(platform_post_id) => self.settle_published(worker_id, &post, &platform_post_id).await,
            Err(e) => self.settle_failure(worker_id, &post, e).await,
        };

        settled.unwrap_or_else(|e| {
            error!(
                post_id = %post.id,
                worker = %worker_id,
                error = %e,
                "Could not record publish outcome"
            );
            Outcome::Unsettled
        })
    }

    /// One attempt, never outliving the lease it runs under
    ///
    /// The refresh-and-retry after an `AuthExpired` runs under a freshly
    /// extended lease. If the lease cannot be extended the post belongs to
    /// someone else and nothing more is sent.
    async fn attempt(&self, worker_id: &str, post: &Post) -> Result<String> {
        let adapter = self.inner.adapters.get(post.platform).ok_or_else(|| {
            PlatformError::Rejected(format!("No adapter registered for {}", post.platform))
        })?;
        adapter.validate_content(&post.content)?;

        let key = ConnectionKey::new(post.subscriber_id.clone(), post.platform);
        let lease_expires_at = post
            .lease_expires_at
            .unwrap_or_else(|| now_ms() + self.inner.config.lease().as_millis() as i64);

        let (credential, first) = self
            .within_lease(lease_expires_at, self.first_call(adapter.as_ref(), post, &key))
            .await?;

        let reason = match first {
            Err(PlatformError::AuthExpired(reason)) => reason,
            other => return Ok(other?),
        };
        debug!(post_id = %post.id, reason = %reason, "Credential rejected; refreshing once");

        let lease_expires_at = self
            .inner
            .lifecycle
            .extend_lease(&post.id, worker_id, self.inner.config.lease(), now_ms())
            .await?;

        self.within_lease(
            lease_expires_at,
            self.refresh_and_retry(adapter.as_ref(), post, &key, &credential),
        )
        .await
    }

    async fn first_call(
        &self,
        adapter: &dyn PlatformAdapter,
        post: &Post,
        key: &ConnectionKey,
    ) -> Result<(Credential, PlatformResult<String>)> {
        let credential = self.inner.tokens.get_valid_credential(key).await?;
        let result = self.publish_once(adapter, post, &credential).await;
        Ok((credential, result))
    }

    async fn refresh_and_retry(
        &self,
        adapter: &dyn PlatformAdapter,
        post: &Post,
        key: &ConnectionKey,
        rejected: &Credential,
    ) -> Result<String> {
        // Any failure to replace a rejected credential ends the post
        let refreshed = match self.inner.tokens.refresh_after_rejection(key, rejected).await {
            Ok(credential) => credential,
            Err(AutopostError::Auth(e)) => {
                return Err(AuthError::NeedsReauthorization(format!(
                    "credential rejected and refresh failed: {}",
                    e
                ))
                .into())
            }
            Err(e) => return Err(e),
        };

        match self.publish_once(adapter, post, &refreshed).await {
            Err(PlatformError::AuthExpired(reason)) => {
                Err(AuthError::NeedsReauthorization(reason).into())
            }
            other => Ok(other?),
        }
    }

    /// Run `work` until `lease_expires_at` minus the settle margin
    ///
    /// Running out of lease is a transient failure: the post is settled for a
    /// retry while this worker still owns it.
    async fn within_lease<T>(
        &self,
        lease_expires_at: i64,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let margin = self.settle_margin().as_millis() as i64;
        let budget_ms = (lease_expires_at - margin - now_ms()).max(0);

        match tokio::time::timeout(Duration::from_millis(budget_ms as u64), work).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Network(format!(
                "attempt did not finish within its lease ({}ms left)",
                budget_ms
            ))
            .into()),
        }
    }

    /// Time kept free at the end of a lease to record the outcome
    fn settle_margin(&self) -> Duration {
        (self.inner.config.lease() / 10).min(MAX_SETTLE_MARGIN)
    }

    async fn publish_once(
        &self,
        adapter: &dyn PlatformAdapter,
        post: &Post,
        credential: &Credential,
    ) -> PlatformResult<String> {
        self.inner.throttle.acquire(post.platform).await;

        let timeout = self.inner.config.publish_timeout();
        match tokio::time::timeout(timeout, adapter.publish(&post.content, credential)).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Network(format!(
                "{} did not answer within {}s",
                adapter.name(),
                timeout.as_secs()
            ))),
        }
    }

    async fn settle_published(
        &self,
        worker_id: &str,
        post: &Post,
        platform_post_id: &str,
    ) -> Result<Outcome> {
        let published = self
            .inner
            .lifecycle
            .mark_published(&post.id, worker_id, platform_post_id, now_ms())
            .await?;

        self.inner.events.emit(Event::PostPublished {
            post_id: published.id,
            platform: published.platform,
            platform_post_id: platform_post_id.to_string(),
        });
        Ok(Outcome::Published)
    }

    async fn settle_failure(
        &self,
        worker_id: &str,
        post: &Post,
        error: AutopostError,
    ) -> Result<Outcome> {
        // Unclassified errors are ours, not the platform's: leave the post to lease recovery
        let class = match error.class() {
            Some(class) => class,
            None => return Err(error),
        };

        let attempt = post.attempts + 1;
        let retry_after = match &error {
            AutopostError::Platform(e) => e.retry_after(),
            _ => None,
        };
        let decision = if class.is_retryable() {
            self.inner.backoff.decide(attempt, retry_after)
        } else {
            RetryDecision::GiveUp
        };

        let now = now_ms();
        match decision {
            RetryDecision::Retry(delay) => {
                self.inner
                    .lifecycle
                    .mark_retry(&post.id, worker_id, now + delay.as_millis() as i64, now)
                    .await?;

                info!(
                    post_id = %post.id,
                    platform = %post.platform,
                    class = %class,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Publish attempt failed; retrying"
                );
                Ok(Outcome::Retrying)
            }
            RetryDecision::GiveUp => {
                let reason = if class.is_retryable() {
                    format!("Gave up after {} attempts: {}", attempt, error)
                } else {
                    error.to_string()
                };

                let failed = self
                    .inner
                    .lifecycle
                    .mark_failed(&post.id, worker_id, class, &reason, now)
                    .await?;

                self.inner.events.emit(Event::PostFailed {
                    post_id: failed.id,
                    platform: failed.platform,
                    class,
                    reason,
                });
                Ok(Outcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::ErrorClass;
    use crate::ledger::QuotaLedger;
    use crate::platforms::mock::MockAdapter;
    use crate::types::{Content, NewPost, PlanTier, Platform, PostState, Subscriber, CYCLE_LENGTH_MS};

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(2),
            max: Duration::from_secs(300),
            min_delay: Duration::from_secs(2),
            max_attempts: 5,
        }
    }

    #[test]
    fn test_nominal_delays_double_then_cap() {
        let policy = BackoffPolicy {
            max_attempts: 20,
            ..policy()
        };

        assert_eq!(policy.nominal_delay(1), Duration::from_secs(2));
        assert_eq!(policy.nominal_delay(2), Duration::from_secs(4));
        assert_eq!(policy.nominal_delay(3), Duration::from_secs(8));
        assert_eq!(policy.nominal_delay(8), Duration::from_secs(256));
        assert_eq!(policy.nominal_delay(9), Duration::from_secs(300));
        assert_eq!(policy.nominal_delay(64), Duration::from_secs(300));

        let delays: Vec<_> = (1..30).map(|a| policy.nominal_delay(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= policy.max));
    }

    #[test]
    fn test_jitter_only_shortens_and_respects_floor() {
        let policy = policy();
        for attempt in 1..5 {
            for _ in 0..50 {
                let nominal = policy.nominal_delay(attempt);
                match policy.decide(attempt, None) {
                    RetryDecision::Retry(delay) => {
                        assert!(delay <= nominal);
                        assert!(delay >= nominal.mul_f64(1.0 - JITTER_FRACTION) - Duration::from_millis(1));
                        assert!(delay >= policy.min_delay);
                    }
                    RetryDecision::GiveUp => panic!("attempt {} should retry", attempt),
                }
            }
        }
    }

    #[test]
    fn test_gives_up_at_max_attempts() {
        let policy = policy();
        assert!(matches!(policy.decide(4, None), RetryDecision::Retry(_)));
        assert_eq!(policy.decide(5, None), RetryDecision::GiveUp);
        assert_eq!(policy.decide(6, None), RetryDecision::GiveUp);
    }

    #[test]
    fn test_retry_after_hint_raises_delay() {
        let policy = policy();
        let hint = Duration::from_secs(90);
        assert_eq!(policy.decide(1, Some(hint)), RetryDecision::Retry(hint));

        // A hint shorter than the backoff does not shorten it
        match policy.decide(4, Some(Duration::from_millis(1))) {
            RetryDecision::Retry(delay) => assert!(delay >= Duration::from_secs(12)),
            RetryDecision::GiveUp => panic!("should retry"),
        }
    }

    #[test]
    fn test_default_policy_matches_config_defaults() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base, Duration::from_secs(2));
        assert_eq!(policy.max, Duration::from_secs(300));
        assert_eq!(policy.min_delay, Duration::from_secs(2));
        assert_eq!(policy.max_attempts, 5);
    }

    // ------------------------------------------------------------------
    // Queue behaviour against the mock adapter
    // ------------------------------------------------------------------

    struct Harness {
        db: Database,
        lifecycle: PostLifecycle,
        queue: PublishingQueue,
        events: EventBus,
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            workers: 2,
            min_retry_delay_ms: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
            poll_interval_ms: 20,
            ..Default::default()
        }
    }

    async fn harness(adapter: MockAdapter, config: QueueConfig) -> Harness {
        harness_from(adapter, config, now_ms() - 1_000).await
    }

    async fn harness_from(adapter: MockAdapter, config: QueueConfig, cycle_start: i64) -> Harness {
        let db = Database::in_memory().await.unwrap();
        db.create_subscriber(
            &Subscriber {
                id: "sub-1".to_string(),
                plan: PlanTier::Starter,
                cycle_id: 1,
                cycle_start,
            },
            PlanTier::Starter.quota(),
        )
        .await
        .unwrap();
        db.upsert_connection(
            &ConnectionKey::new("sub-1", adapter.platform()),
            &Credential::new("a1", Some("r1".to_string()), None),
        )
        .await
        .unwrap();

        let lifecycle = PostLifecycle::new(db.clone());
        let adapters = AdapterRegistry::new().with(Arc::new(adapter));
        let tokens = TokenRefreshManager::new(db.clone(), adapters.clone(), Duration::from_secs(300));
        let events = EventBus::new(64);
        let queue = PublishingQueue::new(
            lifecycle.clone(),
            tokens,
            adapters,
            PlatformThrottle::uniform(1_000),
            events.clone(),
            config,
        );

        Harness {
            db,
            lifecycle,
            queue,
            events,
        }
    }

    async fn queued_post(lifecycle: &PostLifecycle, platform: Platform, text: &str) -> Post {
        let draft = lifecycle
            .create_draft(NewPost::new("sub-1", platform, Content::text(text), now_ms()))
            .await
            .unwrap();
        lifecycle.approve(&draft.id).await.unwrap();
        lifecycle.enqueue(&draft.id, now_ms()).await.unwrap()
    }

    #[tokio::test]
    async fn test_publishes_and_commits_once() {
        let adapter = MockAdapter::success(Platform::X);
        let h = harness(adapter.clone(), fast_config()).await;
        let mut events = h.events.subscribe();
        let post = queued_post(&h.lifecycle, Platform::X, "hello").await;

        let report = h.queue.drain().await.unwrap();
        assert_eq!(report.published, 1);

        let post = h.lifecycle.get(&post.id).await.unwrap();
        assert_eq!(post.state, PostState::Published);
        assert_eq!(post.platform_post_id.as_deref(), Some("x:mock-1"));
        assert_eq!(post.attempts, 1);

        let status = QuotaLedger::new(h.db.clone()).status("sub-1").await.unwrap();
        assert_eq!(status.committed, 1);
        assert_eq!(status.reserved, 0);

        assert!(matches!(events.recv().await.unwrap(), Event::PostPublished { .. }));
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_publish() {
        let adapter = MockAdapter::scripted(
            Platform::X,
            vec![
                Err(PlatformError::Network("reset".to_string())),
                Err(PlatformError::RateLimited {
                    message: "slow down".to_string(),
                    retry_after: None,
                }),
            ],
        );
        let h = harness(adapter.clone(), fast_config()).await;
        let post = queued_post(&h.lifecycle, Platform::X, "third time lucky").await;

        let report = h.queue.drain().await.unwrap();
        assert_eq!(report.retried, 2);
        assert_eq!(report.published, 1);

        let post = h.lifecycle.get(&post.id).await.unwrap();
        assert_eq!(post.state, PostState::Published);
        assert_eq!(post.attempts, 3);
        assert_eq!(adapter.publish_call_count(), 3);

        let status = QuotaLedger::new(h.db.clone()).status("sub-1").await.unwrap();
        assert_eq!(status.committed, 1);
        assert_eq!(status.released, 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let adapter = MockAdapter::failing(Platform::X, PlatformError::Network("down".to_string()));
        let h = harness(adapter.clone(), fast_config()).await;
        let post = queued_post(&h.lifecycle, Platform::X, "never").await;

        h.queue.drain().await.unwrap();

        let post = h.lifecycle.get(&post.id).await.unwrap();
        assert_eq!(post.state, PostState::Failed);
        assert_eq!(post.attempts, 5);
        assert_eq!(post.failure_class, Some(ErrorClass::TransientNetwork));
        assert!(post.failure_reason.unwrap().contains("Gave up after 5 attempts"));
        assert_eq!(adapter.publish_call_count(), 5);

        let status = QuotaLedger::new(h.db.clone()).status("sub-1").await.unwrap();
        assert_eq!(status.committed, 0);
        assert_eq!(status.reserved, 0);
        assert_eq!(status.released, 1);
    }

    #[tokio::test]
    async fn test_rejection_fails_without_retry() {
        let adapter = MockAdapter::failing(Platform::X, PlatformError::Rejected("duplicate".to_string()));
        let h = harness(adapter.clone(), fast_config()).await;
        let mut events = h.events.subscribe();
        let post = queued_post(&h.lifecycle, Platform::X, "dup").await;

        h.queue.drain().await.unwrap();

        let post = h.lifecycle.get(&post.id).await.unwrap();
        assert_eq!(post.state, PostState::Failed);
        assert_eq!(post.attempts, 1);
        assert_eq!(post.failure_class, Some(ErrorClass::PlatformRejected));
        assert_eq!(adapter.publish_call_count(), 1);

        match events.recv().await.unwrap() {
            Event::PostFailed { class, reason, .. } => {
                assert_eq!(class, ErrorClass::PlatformRejected);
                assert!(reason.contains("duplicate"));
            }
            other => panic!("Expected PostFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_expired_refreshes_once_and_retries() {
        let adapter = MockAdapter::success(Platform::X);
        adapter.reject_token("a1");
        let h = harness(adapter.clone(), fast_config()).await;
        let post = queued_post(&h.lifecycle, Platform::X, "fresh token").await;

        h.queue.drain().await.unwrap();

        let post = h.lifecycle.get(&post.id).await.unwrap();
        assert_eq!(post.state, PostState::Published);
        assert_eq!(post.attempts, 1);
        assert_eq!(adapter.refresh_call_count(), 1);

        let calls = adapter.publish_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].access_token, "a1");
        assert_eq!(calls[1].access_token, "x-refreshed-1");
    }

    #[tokio::test]
    async fn test_auth_expired_without_refresh_is_permanent() {
        let adapter = MockAdapter::without_refresh(Platform::X);
        adapter.reject_token("a1");
        let h = harness(adapter.clone(), fast_config()).await;
        let post = queued_post(&h.lifecycle, Platform::X, "stale").await;

        h.queue.drain().await.unwrap();

        let post = h.lifecycle.get(&post.id).await.unwrap();
        assert_eq!(post.state, PostState::Failed);
        assert_eq!(post.failure_class, Some(ErrorClass::AuthPermanent));
        assert_eq!(adapter.publish_call_count(), 1);

        let connection = h
            .db
            .get_connection(&ConnectionKey::new("sub-1", Platform::X))
            .await
            .unwrap()
            .unwrap();
        assert!(!connection.valid);
    }

    #[tokio::test]
    async fn test_failed_refresh_after_rejection_is_permanent() {
        let adapter = MockAdapter::refresh_failure(
            Platform::X,
            AuthError::RefreshUnavailable("token endpoint down".to_string()),
        );
        adapter.reject_token("a1");
        let h = harness(adapter.clone(), fast_config()).await;
        let post = queued_post(&h.lifecycle, Platform::X, "rejected").await;

        let report = h.queue.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 0);

        let post = h.lifecycle.get(&post.id).await.unwrap();
        assert_eq!(post.state, PostState::Failed);
        assert_eq!(post.failure_class, Some(ErrorClass::AuthPermanent));
        assert_eq!(post.attempts, 1);
        assert!(post.failure_reason.unwrap().contains("token endpoint down"));
        assert_eq!(adapter.publish_call_count(), 1);
        assert_eq!(adapter.refresh_call_count(), 1);

        let status = QuotaLedger::new(h.db.clone()).status("sub-1").await.unwrap();
        assert_eq!(status.reserved, 0);
        assert_eq!(status.released, 1);
    }

    #[tokio::test]
    async fn test_refresh_and_retry_runs_under_extended_lease() {
        // Rejected call, refresh and second call together take longer than one lease
        let adapter = MockAdapter::with_delay(Platform::X, Duration::from_millis(900))
            .with_refresh_delay(Duration::from_millis(500));
        adapter.reject_token("a1");
        let config = QueueConfig {
            lease_secs: 2,
            publish_timeout_secs: 1,
            ..fast_config()
        };
        let h = harness(adapter.clone(), config).await;
        let mut events = h.events.subscribe();
        let post = queued_post(&h.lifecycle, Platform::X, "slow platform").await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = h.queue.clone();
        let running = tokio::spawn(async move { queue.run(shutdown_rx).await });

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("post was not published")
            .unwrap();
        assert!(matches!(event, Event::PostPublished { ref post_id, .. } if *post_id == post.id));

        // Past the original lease: the other worker must not have picked the post up again
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        shutdown_tx.send(true).unwrap();
        running.await.unwrap().unwrap();

        let tokens: Vec<_> = adapter.publish_calls().into_iter().map(|c| c.access_token).collect();
        assert_eq!(tokens, vec!["a1".to_string(), "x-refreshed-1".to_string()]);
        assert_eq!(adapter.refresh_call_count(), 1);

        let post = h.lifecycle.get(&post.id).await.unwrap();
        assert_eq!(post.state, PostState::Published);
        assert_eq!(post.attempts, 1);

        let status = QuotaLedger::new(h.db.clone()).status("sub-1").await.unwrap();
        assert_eq!(status.committed, 1);
    }

    #[tokio::test]
    async fn test_attempt_is_cut_off_before_lease_expires() {
        let adapter = MockAdapter::with_delay(Platform::X, Duration::from_secs(3));
        let config = QueueConfig {
            lease_secs: 1,
            publish_timeout_secs: 5,
            max_attempts: 1,
            ..fast_config()
        };
        let h = harness(adapter.clone(), config).await;
        let post = queued_post(&h.lifecycle, Platform::X, "outlives lease").await;

        let report = h.queue.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.unsettled, 0);

        let post = h.lifecycle.get(&post.id).await.unwrap();
        assert_eq!(post.state, PostState::Failed);
        assert_eq!(post.failure_class, Some(ErrorClass::TransientNetwork));
        assert!(post.failure_reason.unwrap().contains("within its lease"));
        assert_eq!(adapter.publish_call_count(), 1);
    }

    #[tokio::test]
    async fn test_queued_post_of_ended_cycle_is_not_published() {
        let adapter = MockAdapter::success(Platform::X);
        let cycle_start = now_ms() - CYCLE_LENGTH_MS - 60_000;
        let h = harness_from(adapter.clone(), fast_config(), cycle_start).await;

        // Approved and queued while the cycle was still running
        let inside = cycle_start + 1_000;
        let draft = h
            .lifecycle
            .create_draft(NewPost::new("sub-1", Platform::X, Content::text("too late"), inside))
            .await
            .unwrap();
        h.lifecycle.approve_at(&draft.id, inside).await.unwrap();
        h.lifecycle.enqueue(&draft.id, inside).await.unwrap();

        let report = h.queue.drain().await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert_eq!(adapter.publish_call_count(), 0);

        let post = h.lifecycle.get(&draft.id).await.unwrap();
        assert_eq!(post.state, PostState::Queued);
        let status = QuotaLedger::new(h.db.clone()).status("sub-1").await.unwrap();
        assert_eq!(status.committed, 0);
    }

    #[tokio::test]
    async fn test_content_violation_fails_before_network() {
        let adapter = MockAdapter::success(Platform::X).with_limit(5);
        let h = harness(adapter.clone(), fast_config()).await;
        let post = queued_post(&h.lifecycle, Platform::X, "far too long").await;

        h.queue.drain().await.unwrap();

        let post = h.lifecycle.get(&post.id).await.unwrap();
        assert_eq!(post.state, PostState::Failed);
        assert_eq!(post.failure_class, Some(ErrorClass::PlatformRejected));
        assert_eq!(adapter.publish_call_count(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_platform_fails_post() {
        let h = harness(MockAdapter::success(Platform::X), fast_config()).await;
        let post = queued_post(&h.lifecycle, Platform::TikTok, "no adapter").await;

        h.queue.drain().await.unwrap();

        let post = h.lifecycle.get(&post.id).await.unwrap();
        assert_eq!(post.state, PostState::Failed);
        assert_eq!(post.failure_class, Some(ErrorClass::PlatformRejected));
    }

    #[tokio::test]
    async fn test_publish_timeout_is_transient() {
        let adapter = MockAdapter::with_delay(Platform::X, Duration::from_secs(5));
        let config = QueueConfig {
            publish_timeout_secs: 1,
            max_attempts: 1,
            ..fast_config()
        };
        let h = harness(adapter, config).await;
        let post = queued_post(&h.lifecycle, Platform::X, "slow").await;

        h.queue.drain().await.unwrap();

        let post = h.lifecycle.get(&post.id).await.unwrap();
        assert_eq!(post.state, PostState::Failed);
        assert_eq!(post.failure_class, Some(ErrorClass::TransientNetwork));
        assert!(post.failure_reason.unwrap().contains("did not answer"));
    }

    #[tokio::test]
    async fn test_each_post_published_exactly_once_under_concurrency() {
        let adapter = MockAdapter::with_delay(Platform::X, Duration::from_millis(20));
        let config = QueueConfig {
            workers: 3,
            ..fast_config()
        };
        let h = harness(adapter.clone(), config).await;
        for i in 0..9 {
            queued_post(&h.lifecycle, Platform::X, &format!("post {}", i)).await;
        }

        let report = h.queue.drain().await.unwrap();
        assert_eq!(report.published, 9);
        assert_eq!(adapter.publish_call_count(), 9);

        let mut texts: Vec<_> = adapter.publish_calls().into_iter().map(|c| c.text).collect();
        texts.sort();
        texts.dedup();
        assert_eq!(texts.len(), 9);

        let status = QuotaLedger::new(h.db.clone()).status("sub-1").await.unwrap();
        assert_eq!(status.committed, 9);
        assert_eq!(status.reserved, 0);
    }

    #[tokio::test]
    async fn test_run_wakes_on_notify_and_stops_on_shutdown() {
        let adapter = MockAdapter::success(Platform::X);
        let config = QueueConfig {
            poll_interval_ms: 60_000,
            ..fast_config()
        };
        let h = harness(adapter, config).await;
        let mut events = h.events.subscribe();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = h.queue.clone();
        let running = tokio::spawn(async move { queue.run(shutdown_rx).await });

        // Let the workers go idle before admitting work
        tokio::time::sleep(Duration::from_millis(100)).await;
        let post = queued_post(&h.lifecycle, Platform::X, "wake up").await;
        h.queue.notify();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("queue did not publish after notify")
            .unwrap();
        assert!(matches!(event, Event::PostPublished { ref post_id, .. } if *post_id == post.id));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("queue did not stop")
            .unwrap()
            .unwrap();
    }
}
