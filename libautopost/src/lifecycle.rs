//! Post lifecycle state machine
//!
//! Every transition is a single guarded `UPDATE ... WHERE state = <from>`, so
//! the row itself decides races: a cancelled post cannot be claimed, a claimed
//! post cannot be cancelled, and two workers cannot both claim one post.
//! Transitions that touch quota run the ledger operation in the same
//! transaction as the state write.

use sqlx::sqlite::SqliteConnection;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::db::{get_post_in, post_from_row, PostFilter, POST_COLUMNS};
use crate::error::{AutopostError, DbError, ErrorClass, LifecycleError, Result};
use crate::ledger;
use crate::types::{now_ms, NewPost, Post, PostState, ReservationToken, CYCLE_LENGTH_MS};
use crate::Database;

#[derive(Clone)]
pub struct PostLifecycle {
    db: Database,
}

impl PostLifecycle {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Store a new post in `Draft`
    pub async fn create_draft(&self, new_post: NewPost) -> Result<Post> {
        if new_post.content.text.trim().is_empty() && new_post.content.media_urls.is_empty() {
            return Err(AutopostError::InvalidInput(
                "Post needs text or at least one media reference".to_string(),
            ));
        }

        if self.db.get_subscriber(&new_post.subscriber_id).await?.is_none() {
            return Err(AutopostError::NotFound(format!(
                "subscriber {}",
                new_post.subscriber_id
            )));
        }

        let now = now_ms();
        let post = Post {
            id: uuid::Uuid::new_v4().to_string(),
            subscriber_id: new_post.subscriber_id,
            platform: new_post.platform,
            content: new_post.content,
            target_at: new_post.target_at,
            state: PostState::Draft,
            platform_post_id: None,
            failure_class: None,
            failure_reason: None,
            attempts: 0,
            reservation_token: None,
            cycle_id: None,
            queued_at: None,
            next_attempt_at: None,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        };

        self.db.insert_post(&post).await?;
        debug!(post_id = %post.id, platform = %post.platform, "Created draft");
        Ok(post)
    }

    pub async fn get(&self, post_id: &str) -> Result<Post> {
        self.db
            .get_post(post_id)
            .await?
            .ok_or_else(|| AutopostError::NotFound(format!("post {}", post_id)))
    }

    pub async fn list(&self, filter: &PostFilter) -> Result<Vec<Post>> {
        self.db.list_posts(filter).await
    }

    /// `Draft -> Approved`, reserving one unit of quota
    ///
    /// When the ledger refuses, the whole transaction rolls back and the post
    /// stays in `Draft`.
    pub async fn approve(&self, post_id: &str) -> Result<Post> {
        self.approve_at(post_id, now_ms()).await
    }

    pub async fn approve_at(&self, post_id: &str, now: i64) -> Result<Post> {
        let mut tx = self.db.begin().await?;

        let subscriber_id: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE posts SET state = 'approved', updated_at = ?
            WHERE id = ? AND state = 'draft'
            RETURNING subscriber_id
            "#,
        )
        .bind(now)
        .bind(post_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let subscriber_id = match subscriber_id {
            Some(id) => id,
            None => return Err(refusal(&mut tx, post_id, PostState::Approved, None).await),
        };

        let reservation = ledger::reserve_in(&mut tx, &subscriber_id, now).await?;

        sqlx::query(
            r#"
            UPDATE posts SET reservation_token = ?, cycle_id = ? WHERE id = ?
            "#,
        )
        .bind(reservation.token.as_str())
        .bind(reservation.cycle_id)
        .bind(post_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let post = load(&mut tx, post_id).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;

        info!(post_id = %post_id, subscriber_id = %subscriber_id, "Post approved");
        Ok(post)
    }

    /// `Approved -> Queued`
    pub async fn enqueue(&self, post_id: &str, now: i64) -> Result<Post> {
        let mut tx = self.db.begin().await?;
        if !enqueue_in(&mut tx, post_id, now).await? {
            return Err(refusal(&mut tx, post_id, PostState::Queued, None).await);
        }
        let post = load(&mut tx, post_id).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(post)
    }

    /// `Queued -> Publishing` for the oldest due post
    ///
    /// Check and claim are one statement: only a row still `queued` can be
    /// taken, and exactly one caller observes the update. Posts whose quota
    /// cycle has ended or been replaced are never claimed; the enforcer
    /// cancels them.
    pub async fn claim(&self, worker_id: &str, lease: Duration, now: i64) -> Result<Option<Post>> {
        let query_str = format!(
            r#"
            UPDATE posts
            SET state = 'publishing', lease_owner = ?, lease_expires_at = ?, updated_at = ?
            WHERE id = (
                SELECT p.id FROM posts p
                WHERE p.state = 'queued' AND COALESCE(p.next_attempt_at, 0) <= ?
                  AND EXISTS (
                      SELECT 1 FROM subscribers s
                      WHERE s.id = p.subscriber_id AND s.cycle_id = p.cycle_id
                        AND ? < s.cycle_start + ?
                  )
                ORDER BY p.queue_seq ASC, p.id ASC
                LIMIT 1
            )
            AND state = 'queued'
            RETURNING {}
            "#,
            POST_COLUMNS
        );

        let row = sqlx::query(&query_str)
            .bind(worker_id)
            .bind(now + lease.as_millis() as i64)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(CYCLE_LENGTH_MS)
            .fetch_optional(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        let post = row.as_ref().map(post_from_row).transpose()?;
        if let Some(post) = &post {
            debug!(post_id = %post.id, worker = %worker_id, attempt = post.attempts + 1, "Claimed post");
        }
        Ok(post)
    }

    /// Push the lease of a post this worker still holds to `now + lease`
    ///
    /// Returns the new expiry. Fails with `LeaseLost` when the lease already
    /// ran out or belongs to someone else.
    pub async fn extend_lease(
        &self,
        post_id: &str,
        worker_id: &str,
        lease: Duration,
        now: i64,
    ) -> Result<i64> {
        let mut tx = self.db.begin().await?;

        let expires_at: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE posts SET lease_expires_at = ?, updated_at = ?
            WHERE id = ? AND state = 'publishing' AND lease_owner = ? AND lease_expires_at > ?
            RETURNING lease_expires_at
            "#,
        )
        .bind(now + lease.as_millis() as i64)
        .bind(now)
        .bind(post_id)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        match expires_at {
            Some(expires_at) => {
                tx.commit().await.map_err(DbError::SqlxError)?;
                debug!(post_id = %post_id, worker = %worker_id, expires_at, "Lease extended");
                Ok(expires_at)
            }
            None => Err(refusal(&mut tx, post_id, PostState::Publishing, Some(worker_id)).await),
        }
    }

    /// Put `Publishing` posts whose lease ran out back in the queue
    ///
    /// Recovery does not count as an attempt: the crashed worker's outcome is
    /// unknown.
    pub async fn recover_expired_leases(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET state = 'queued', lease_owner = NULL, lease_expires_at = NULL,
                next_attempt_at = ?, updated_at = ?
            WHERE state = 'publishing' AND lease_expires_at <= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(recovered, "Recovered posts from expired leases");
        }
        Ok(recovered)
    }

    /// `Publishing -> Published`, committing the reservation in the same transaction
    pub async fn mark_published(
        &self,
        post_id: &str,
        worker_id: &str,
        platform_post_id: &str,
        now: i64,
    ) -> Result<Post> {
        let mut tx = self.db.begin().await?;

        let token: Option<Option<String>> = sqlx::query_scalar(
            r#"
            UPDATE posts
            SET state = 'published', platform_post_id = ?, attempts = attempts + 1,
                lease_owner = NULL, lease_expires_at = NULL, next_attempt_at = NULL,
                updated_at = ?
            WHERE id = ? AND state = 'publishing' AND lease_owner = ?
            RETURNING reservation_token
            "#,
        )
        .bind(platform_post_id)
        .bind(now)
        .bind(post_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let token = match token {
            Some(token) => token,
            None => {
                let e = refusal(&mut tx, post_id, PostState::Published, Some(worker_id)).await;
                error!(
                    post_id = %post_id,
                    platform_post_id = %platform_post_id,
                    error = %e,
                    "Published on platform but could not record it"
                );
                return Err(e);
            }
        };

        match token {
            Some(token) => {
                ledger::commit_in(&mut tx, &ReservationToken(token), now).await?;
            }
            None => warn!(post_id = %post_id, "Published post had no reservation to commit"),
        }

        let post = load(&mut tx, post_id).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;

        info!(
            post_id = %post_id,
            platform = %post.platform,
            platform_post_id = %platform_post_id,
            "Post published"
        );
        Ok(post)
    }

    /// Retry edge: back to `Queued` with a later next-attempt time; quota untouched
    pub async fn mark_retry(
        &self,
        post_id: &str,
        worker_id: &str,
        next_attempt_at: i64,
        now: i64,
    ) -> Result<Post> {
        let mut tx = self.db.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE posts
            SET state = 'queued', attempts = attempts + 1, next_attempt_at = ?,
                lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE id = ? AND state = 'publishing' AND lease_owner = ?
            "#,
        )
        .bind(next_attempt_at)
        .bind(now)
        .bind(post_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(refusal(&mut tx, post_id, PostState::Queued, Some(worker_id)).await);
        }

        let post = load(&mut tx, post_id).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(post)
    }

    /// `Publishing -> Failed`, releasing the reservation in the same transaction
    pub async fn mark_failed(
        &self,
        post_id: &str,
        worker_id: &str,
        class: ErrorClass,
        reason: &str,
        now: i64,
    ) -> Result<Post> {
        let mut tx = self.db.begin().await?;

        let token: Option<Option<String>> = sqlx::query_scalar(
            r#"
            UPDATE posts
            SET state = 'failed', attempts = attempts + 1, failure_class = ?, failure_reason = ?,
                lease_owner = NULL, lease_expires_at = NULL, next_attempt_at = NULL,
                updated_at = ?
            WHERE id = ? AND state = 'publishing' AND lease_owner = ?
            RETURNING reservation_token
            "#,
        )
        .bind(class.as_str())
        .bind(reason)
        .bind(now)
        .bind(post_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let token = match token {
            Some(token) => token,
            None => return Err(refusal(&mut tx, post_id, PostState::Failed, Some(worker_id)).await),
        };

        if let Some(token) = token {
            ledger::release_in(&mut tx, &ReservationToken(token), now).await?;
        }

        let post = load(&mut tx, post_id).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;

        warn!(
            post_id = %post_id,
            platform = %post.platform,
            class = %class,
            reason = %reason,
            attempts = post.attempts,
            "Post failed"
        );
        Ok(post)
    }

    /// `Approved/Queued -> Cancelled`, releasing the reservation
    pub async fn cancel(&self, post_id: &str, reason: &str) -> Result<Post> {
        let now = now_ms();
        let mut tx = self.db.begin().await?;

        let token: Option<Option<String>> = sqlx::query_scalar(
            r#"
            UPDATE posts
            SET state = 'cancelled', failure_reason = ?, next_attempt_at = NULL, updated_at = ?
            WHERE id = ? AND state IN ('approved', 'queued')
            RETURNING reservation_token
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(post_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let token = match token {
            Some(token) => token,
            None => {
                return Err(refusal(&mut tx, post_id, PostState::Cancelled, None).await);
            }
        };

        if let Some(token) = token {
            ledger::release_in(&mut tx, &ReservationToken(token), now).await?;
        }

        let post = load(&mut tx, post_id).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;

        info!(post_id = %post_id, reason = %reason, "Post cancelled");
        Ok(post)
    }

    /// `Approved` posts of a cycle whose target time is at or before `due_before`
    pub async fn due_for_admission(
        &self,
        subscriber_id: &str,
        cycle_id: i64,
        due_before: i64,
        limit: usize,
    ) -> Result<Vec<Post>> {
        let query_str = format!(
            r#"
            SELECT {} FROM posts
            WHERE subscriber_id = ? AND cycle_id = ? AND state = 'approved' AND target_at <= ?
            ORDER BY target_at ASC, id ASC
            LIMIT ?
            "#,
            POST_COLUMNS
        );

        let rows = sqlx::query(&query_str)
            .bind(subscriber_id)
            .bind(cycle_id)
            .bind(due_before)
            .bind(limit as i64)
            .fetch_all(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(post_from_row).collect()
    }

    /// Cancel every `Approved`/`Queued` post reserved in a cycle before `cycle_id`
    pub async fn cancel_cycle_leftovers(
        &self,
        subscriber_id: &str,
        cycle_id: i64,
        reason: &str,
        now: i64,
    ) -> Result<Vec<Post>> {
        let mut tx = self.db.begin().await?;
        let cancelled = cancel_cycle_leftovers_in(&mut tx, subscriber_id, cycle_id, reason, now).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(cancelled)
    }
}

/// Guarded `Approved -> Queued`; returns `false` if the post was not approved
pub(crate) async fn enqueue_in(conn: &mut SqliteConnection, post_id: &str, now: i64) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE posts
        SET state = 'queued', queued_at = ?, next_attempt_at = ?, updated_at = ?,
            queue_seq = (SELECT COALESCE(MAX(queue_seq), 0) + 1 FROM posts)
        WHERE id = ? AND state = 'approved'
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(post_id)
    .execute(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    Ok(result.rows_affected() == 1)
}

pub(crate) async fn cancel_cycle_leftovers_in(
    conn: &mut SqliteConnection,
    subscriber_id: &str,
    cycle_id: i64,
    reason: &str,
    now: i64,
) -> Result<Vec<Post>> {
    let query_str = format!(
        r#"
        UPDATE posts
        SET state = 'cancelled', failure_reason = ?, next_attempt_at = NULL, updated_at = ?
        WHERE subscriber_id = ? AND cycle_id < ? AND state IN ('approved', 'queued')
        RETURNING {}
        "#,
        POST_COLUMNS
    );

    let rows = sqlx::query(&query_str)
        .bind(reason)
        .bind(now)
        .bind(subscriber_id)
        .bind(cycle_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(DbError::SqlxError)?;

    let cancelled = rows.iter().map(post_from_row).collect::<Result<Vec<_>>>()?;

    for post in &cancelled {
        if let Some(token) = &post.reservation_token {
            ledger::release_in(conn, token, now).await?;
        }
    }

    if !cancelled.is_empty() {
        info!(
            subscriber_id = %subscriber_id,
            cancelled = cancelled.len(),
            reason = %reason,
            "Cancelled posts left over from an expired cycle"
        );
    }
    Ok(cancelled)
}

async fn load(conn: &mut SqliteConnection, post_id: &str) -> Result<Post> {
    get_post_in(conn, post_id)
        .await?
        .ok_or_else(|| AutopostError::NotFound(format!("post {}", post_id)))
}

/// Explain why a guarded transition matched no row
async fn refusal(
    conn: &mut SqliteConnection,
    post_id: &str,
    to: PostState,
    worker_id: Option<&str>,
) -> AutopostError {
    let post = match get_post_in(conn, post_id).await {
        Ok(Some(post)) => post,
        Ok(None) => return AutopostError::NotFound(format!("post {}", post_id)),
        Err(e) => return e,
    };

    match worker_id {
        Some(owner) => LifecycleError::LeaseLost {
            post_id: post_id.to_string(),
            owner: owner.to_string(),
        }
        .into(),
        None => LifecycleError::InvalidTransition {
            post_id: post_id.to_string(),
            from: post.state,
            to,
        }
        .into(),
    }
}
