//! Auto-posting enforcer
//!
//! Periodic (and on-demand) driver that moves approved posts into the
//! publishing queue while their quota cycle is active, drops them when the
//! cycle ends without a renewal, and warns subscribers whose cycle is about
//! to end with reserved posts still unpublished.
//!
//! Admission never reserves quota. Every post it admits already holds a
//! reservation from approval; the ledger is only consulted to check that the
//! reserved count still matches the posts holding reservations.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::config::EnforcerConfig;
use crate::db::Database;
use crate::error::{AutopostError, DbError, Result};
use crate::ledger::{self, QuotaLedger};
use crate::lifecycle::{self, PostLifecycle};
use crate::queue::PublishingQueue;
use crate::service::events::{Event, EventBus};
use crate::types::{now_ms, CycleRenewed, Post, PostState, Subscriber};

const CYCLE_ENDED_REASON: &str = "Quota cycle ended before the post was published";

/// What one enforcement pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnforcementReport {
    pub subscribers: usize,
    pub admitted: usize,
    pub cancelled: usize,
    pub warnings: usize,
    /// Subscribers whose reserved count disagreed with their posts
    pub mismatches: usize,
}

/// Result of applying a renewal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenewalReport {
    pub subscriber_id: String,
    pub previous_cycle_id: i64,
    pub cycle_id: i64,
    pub cancelled: usize,
    /// Reservations released that had no cancellable post attached
    pub released_stale: u64,
}

#[derive(Clone)]
pub struct AutoPostingEnforcer {
    db: Database,
    lifecycle: PostLifecycle,
    ledger: QuotaLedger,
    events: EventBus,
    config: EnforcerConfig,
    queue: Option<PublishingQueue>,
    trigger: Arc<Notify>,
}

impl AutoPostingEnforcer {
    pub fn new(db: Database, events: EventBus, config: EnforcerConfig) -> Self {
        Self {
            lifecycle: PostLifecycle::new(db.clone()),
            ledger: QuotaLedger::new(db.clone()),
            db,
            events,
            config,
            queue: None,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Wake this queue's idle workers whenever posts are admitted
    pub fn with_queue(mut self, queue: PublishingQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Request an enforcement pass outside the schedule
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// One pass over every subscriber
    pub async fn enforce(&self) -> Result<EnforcementReport> {
        self.enforce_at(now_ms()).await
    }

    pub async fn enforce_at(&self, now: i64) -> Result<EnforcementReport> {
        let mut report = EnforcementReport::default();

        for subscriber in self.db.list_subscribers().await? {
            report.subscribers += 1;
            if let Err(e) = self.enforce_subscriber(&subscriber, now, &mut report).await {
                error!(subscriber_id = %subscriber.id, error = %e, "Enforcement failed for subscriber");
            }
        }

        if report.admitted > 0 {
            if let Some(queue) = &self.queue {
                queue.notify();
            }
        }

        if report.admitted + report.cancelled + report.warnings + report.mismatches > 0 {
            info!(
                subscribers = report.subscribers,
                admitted = report.admitted,
                cancelled = report.cancelled,
                warnings = report.warnings,
                mismatches = report.mismatches,
                "Enforcement pass complete"
            );
        }
        Ok(report)
    }

    async fn enforce_subscriber(
        &self,
        subscriber: &Subscriber,
        now: i64,
        report: &mut EnforcementReport,
    ) -> Result<()> {
        let cycle_end = subscriber.cycle_end();

        // Cycle ran out and no renewal arrived: nothing of it may still publish
        if now >= cycle_end {
            let cancelled = self
                .lifecycle
                .cancel_cycle_leftovers(&subscriber.id, subscriber.cycle_id + 1, CYCLE_ENDED_REASON, now)
                .await?;
            report.cancelled += cancelled.len();
            self.emit_cancelled(&cancelled, CYCLE_ENDED_REASON);
            return Ok(());
        }

        // Retried after a renewal: still queued on a cycle that no longer admits anything
        let stale = self
            .lifecycle
            .cancel_cycle_leftovers(&subscriber.id, subscriber.cycle_id, CYCLE_ENDED_REASON, now)
            .await?;
        report.cancelled += stale.len();
        self.emit_cancelled(&stale, CYCLE_ENDED_REASON);

        let entry = match self.ledger.entry(&subscriber.id, subscriber.cycle_id).await? {
            Some(entry) => entry,
            None => {
                return Err(DbError::Corrupt(format!(
                    "no ledger row for subscriber {} cycle {}",
                    subscriber.id, subscriber.cycle_id
                ))
                .into())
            }
        };

        let approved = self.count(subscriber, PostState::Approved).await?;
        let in_flight = self.count(subscriber, PostState::Queued).await?
            + self.count(subscriber, PostState::Publishing).await?;

        if entry.reserved != approved + in_flight {
            report.mismatches += 1;
            warn!(
                subscriber_id = %subscriber.id,
                cycle_id = subscriber.cycle_id,
                reserved = entry.reserved,
                holding_posts = approved + in_flight,
                "Reserved quota does not match posts holding reservations"
            );
        }

        let in_warning_window = now >= cycle_end - self.config.warning_window_ms();
        let due_before = if in_warning_window && self.config.publish_before_cycle_end {
            i64::MAX
        } else {
            now
        };

        // Never admit more than the reserved capacity that is not in flight yet
        let capacity = (entry.reserved - in_flight).max(0) as usize;
        let limit = capacity.min(self.config.batch_size);
        if limit > 0 {
            let due = self
                .lifecycle
                .due_for_admission(&subscriber.id, subscriber.cycle_id, due_before, limit)
                .await?;
            report.admitted += self.admit(&due, now).await?;
        }

        if in_warning_window && entry.reserved > 0 {
            let first_warning = self
                .db
                .record_cycle_warning(&subscriber.id, subscriber.cycle_id, entry.reserved, now)
                .await?;
            if first_warning {
                report.warnings += 1;
                info!(
                    subscriber_id = %subscriber.id,
                    cycle_id = subscriber.cycle_id,
                    unpublished = entry.reserved,
                    "Quota cycle ending with unpublished posts"
                );
                self.events.emit(Event::QuotaCycleEnding {
                    subscriber_id: subscriber.id.clone(),
                    cycle_id: subscriber.cycle_id,
                    unpublished_count: entry.reserved,
                    cycle_end,
                });
            }
        }

        Ok(())
    }

    async fn admit(&self, posts: &[Post], now: i64) -> Result<usize> {
        let mut admitted = 0;
        for post in posts {
            let mut conn = self.db.pool().acquire().await.map_err(DbError::SqlxError)?;
            if lifecycle::enqueue_in(&mut conn, &post.id, now).await? {
                debug!(post_id = %post.id, platform = %post.platform, "Admitted post to queue");
                admitted += 1;
            } else {
                // Cancelled or admitted by someone else since it was listed
                debug!(post_id = %post.id, "Post no longer approved; skipped");
            }
        }
        Ok(admitted)
    }

    async fn count(&self, subscriber: &Subscriber, state: PostState) -> Result<i64> {
        self.db
            .count_posts_in_state(&subscriber.id, subscriber.cycle_id, state)
            .await
    }

    /// Apply a billing renewal: open the next cycle and drop what the old one left
    ///
    /// One transaction covers the cycle switch, the cancellations and the
    /// releases. Returns `None` for a stale or duplicate renewal.
    pub async fn handle_cycle_renewed(&self, renewal: &CycleRenewed) -> Result<Option<RenewalReport>> {
        if renewal.new_allocation < 0 {
            return Err(AutopostError::InvalidInput(format!(
                "Allocation must not be negative (got {})",
                renewal.new_allocation
            )));
        }

        let now = now_ms();
        let mut tx = self.db.begin().await?;

        let (previous_cycle_id, cycle_id) = match ledger::advance_cycle_in(
            &mut tx,
            &renewal.subscriber_id,
            renewal.new_cycle_start,
            renewal.new_allocation,
        )
        .await?
        {
            Some(cycles) => cycles,
            None => {
                info!(
                    subscriber_id = %renewal.subscriber_id,
                    new_cycle_start = renewal.new_cycle_start,
                    "Ignoring stale cycle renewal"
                );
                return Ok(None);
            }
        };

        let cancelled = lifecycle::cancel_cycle_leftovers_in(
            &mut tx,
            &renewal.subscriber_id,
            cycle_id,
            CYCLE_ENDED_REASON,
            now,
        )
        .await?;
        let released_stale = ledger::release_stale_in(&mut tx, &renewal.subscriber_id, cycle_id, now).await?;

        tx.commit().await.map_err(DbError::SqlxError)?;

        self.emit_cancelled(&cancelled, CYCLE_ENDED_REASON);
        info!(
            subscriber_id = %renewal.subscriber_id,
            previous_cycle_id,
            cycle_id,
            allocation = renewal.new_allocation,
            cancelled = cancelled.len(),
            "Quota cycle renewed"
        );

        Ok(Some(RenewalReport {
            subscriber_id: renewal.subscriber_id.clone(),
            previous_cycle_id,
            cycle_id,
            cancelled: cancelled.len(),
            released_stale,
        }))
    }

    /// Enforce on the configured interval and on every trigger until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(interval_secs = self.config.interval_secs, "Enforcer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.enforce().await {
                error!(error = %e, "Enforcement pass failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {}
                _ = self.trigger.notified() => debug!("Enforcement triggered"),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Enforcer stopped");
        Ok(())
    }

    fn emit_cancelled(&self, posts: &[Post], reason: &str) {
        for post in posts {
            self.events.emit(Event::PostCancelled {
                post_id: post.id.clone(),
                platform: post.platform,
                reason: reason.to_string(),
            });
        }
    }
}
