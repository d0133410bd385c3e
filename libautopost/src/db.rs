//! Database operations for Autopost
//!
//! SQLite is the transactional store behind the ledger, the post state
//! machine and the connection registry. Every multi-statement write
//! transaction in this crate starts with a guarded `UPDATE` or `INSERT` so the
//! write lock is taken before anything is read.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};
use std::path::Path;
use std::time::Duration;

use crate::error::{DbError, Result};
use crate::types::{
    ConnectionKey, Content, Credential, Platform, PlatformConnection, Post, PostState,
    ReservationToken, Subscriber,
};

pub(crate) const POST_COLUMNS: &str = "id, subscriber_id, platform, content, target_at, state, \
     platform_post_id, failure_class, failure_reason, attempts, reservation_token, cycle_id, \
     queued_at, next_attempt_at, lease_owner, lease_expires_at, created_at, updated_at";

/// Filter for listing posts
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    pub subscriber_id: Option<String>,
    pub state: Option<PostState>,
    pub limit: Option<usize>,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) a database file and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        Self::with_max_connections(db_path, 4).await
    }

    /// Open a database file with an explicit pool size
    pub async fn with_max_connections(db_path: &str, max_connections: u32) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    /// Private in-memory database, mainly for tests
    ///
    /// Every SQLite in-memory connection is its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a write transaction
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await.map_err(DbError::SqlxError)?)
    }

    // ========================================================================
    // Subscribers
    // ========================================================================

    /// Onboard a subscriber with the ledger row for their first cycle
    pub async fn create_subscriber(&self, subscriber: &Subscriber, allocation: i64) -> Result<()> {
        let mut tx = self.begin().await?;
        let now = crate::types::now_ms();

        sqlx::query(
            r#"
            INSERT INTO subscribers (id, plan, cycle_id, cycle_start, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&subscriber.id)
        .bind(subscriber.plan.as_str())
        .bind(subscriber.cycle_id)
        .bind(subscriber.cycle_start)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            INSERT INTO quota_ledger (subscriber_id, cycle_id, allocated)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&subscriber.id)
        .bind(subscriber.cycle_id)
        .bind(allocation)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn get_subscriber(&self, subscriber_id: &str) -> Result<Option<Subscriber>> {
        let mut conn = self.pool.acquire().await.map_err(DbError::SqlxError)?;
        get_subscriber_in(&mut conn, subscriber_id).await
    }

    pub async fn list_subscribers(&self) -> Result<Vec<Subscriber>> {
        let rows = sqlx::query(
            r#"
            SELECT id, plan, cycle_id, cycle_start FROM subscribers ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(subscriber_from_row).collect()
    }

    // ========================================================================
    // Posts
    // ========================================================================

    pub async fn insert_post(&self, post: &Post) -> Result<()> {
        let content = serde_json::to_string(&post.content)
            .map_err(|e| DbError::Corrupt(format!("unserializable content: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO posts (id, subscriber_id, platform, content, target_at, state,
                               attempts, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.subscriber_id)
        .bind(post.platform.as_str())
        .bind(content)
        .bind(post.target_at)
        .bind(post.state.as_str())
        .bind(post.attempts as i64)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Get a post by ID
    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let mut conn = self.pool.acquire().await.map_err(DbError::SqlxError)?;
        get_post_in(&mut conn, post_id).await
    }

    /// List posts, newest target time last
    pub async fn list_posts(&self, filter: &PostFilter) -> Result<Vec<Post>> {
        let mut where_clauses = vec!["1=1"];
        if filter.subscriber_id.is_some() {
            where_clauses.push("subscriber_id = ?");
        }
        if filter.state.is_some() {
            where_clauses.push("state = ?");
        }

        let query_str = format!(
            "SELECT {} FROM posts WHERE {} ORDER BY target_at ASC, id ASC LIMIT ?",
            POST_COLUMNS,
            where_clauses.join(" AND ")
        );

        let mut query = sqlx::query(&query_str);
        if let Some(subscriber_id) = &filter.subscriber_id {
            query = query.bind(subscriber_id);
        }
        if let Some(state) = filter.state {
            query = query.bind(state.as_str());
        }
        query = query.bind(filter.limit.map(|l| l as i64).unwrap_or(-1));

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(post_from_row).collect()
    }

    /// Count posts per state for one subscriber and cycle
    pub async fn count_posts_in_state(
        &self,
        subscriber_id: &str,
        cycle_id: i64,
        state: PostState,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM posts
            WHERE subscriber_id = ? AND cycle_id = ? AND state = ?
            "#,
        )
        .bind(subscriber_id)
        .bind(cycle_id)
        .bind(state.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(count)
    }

    // ========================================================================
    // Platform connections
    // ========================================================================

    /// Insert or replace the credential for a connection and mark it valid
    pub async fn upsert_connection(&self, key: &ConnectionKey, credential: &Credential) -> Result<()> {
        use secrecy::ExposeSecret;

        sqlx::query(
            r#"
            INSERT INTO platform_connections
                (subscriber_id, platform, access_token, refresh_token, expires_at, valid, updated_at)
            VALUES (?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(subscriber_id, platform) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                valid = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&key.subscriber_id)
        .bind(key.platform.as_str())
        .bind(credential.access_token.expose_secret())
        .bind(credential.refresh_token.as_ref().map(|t| t.expose_secret().to_string()))
        .bind(credential.expires_at)
        .bind(crate::types::now_ms())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_connection(&self, key: &ConnectionKey) -> Result<Option<PlatformConnection>> {
        let row = sqlx::query(
            r#"
            SELECT subscriber_id, platform, access_token, refresh_token, expires_at, valid, updated_at
            FROM platform_connections
            WHERE subscriber_id = ? AND platform = ?
            "#,
        )
        .bind(&key.subscriber_id)
        .bind(key.platform.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(connection_from_row).transpose()
    }

    /// Flag a connection as needing re-authorization
    pub async fn invalidate_connection(&self, key: &ConnectionKey) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE platform_connections SET valid = 0, updated_at = ?
            WHERE subscriber_id = ? AND platform = ?
            "#,
        )
        .bind(crate::types::now_ms())
        .bind(&key.subscriber_id)
        .bind(key.platform.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    // ========================================================================
    // Cycle warnings
    // ========================================================================

    /// Record that a cycle-end warning was raised
    ///
    /// Returns `false` when this cycle was already warned about.
    pub async fn record_cycle_warning(
        &self,
        subscriber_id: &str,
        cycle_id: i64,
        unpublished_count: i64,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO cycle_warnings (subscriber_id, cycle_id, raised_at, unpublished_count)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(subscriber_id)
        .bind(cycle_id)
        .bind(now)
        .bind(unpublished_count)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }
}

pub(crate) async fn get_subscriber_in(
    conn: &mut SqliteConnection,
    subscriber_id: &str,
) -> Result<Option<Subscriber>> {
    let row = sqlx::query(
        r#"
        SELECT id, plan, cycle_id, cycle_start FROM subscribers WHERE id = ?
        "#,
    )
    .bind(subscriber_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    row.as_ref().map(subscriber_from_row).transpose()
}

pub(crate) async fn get_post_in(conn: &mut SqliteConnection, post_id: &str) -> Result<Option<Post>> {
    let query_str = format!("SELECT {} FROM posts WHERE id = ?", POST_COLUMNS);
    let row = sqlx::query(&query_str)
        .bind(post_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DbError::SqlxError)?;

    row.as_ref().map(post_from_row).transpose()
}

fn subscriber_from_row(row: &SqliteRow) -> Result<Subscriber> {
    let plan: String = row.try_get("plan").map_err(DbError::SqlxError)?;
    Ok(Subscriber {
        id: row.try_get("id").map_err(DbError::SqlxError)?,
        plan: plan.parse().map_err(DbError::Corrupt)?,
        cycle_id: row.try_get("cycle_id").map_err(DbError::SqlxError)?,
        cycle_start: row.try_get("cycle_start").map_err(DbError::SqlxError)?,
    })
}

pub(crate) fn post_from_row(row: &SqliteRow) -> Result<Post> {
    let platform: String = row.try_get("platform").map_err(DbError::SqlxError)?;
    let state: String = row.try_get("state").map_err(DbError::SqlxError)?;
    let content: String = row.try_get("content").map_err(DbError::SqlxError)?;
    let failure_class: Option<String> = row.try_get("failure_class").map_err(DbError::SqlxError)?;
    let reservation_token: Option<String> =
        row.try_get("reservation_token").map_err(DbError::SqlxError)?;
    let attempts: i64 = row.try_get("attempts").map_err(DbError::SqlxError)?;

    Ok(Post {
        id: row.try_get("id").map_err(DbError::SqlxError)?,
        subscriber_id: row.try_get("subscriber_id").map_err(DbError::SqlxError)?,
        platform: platform.parse::<Platform>().map_err(DbError::Corrupt)?,
        content: serde_json::from_str::<Content>(&content)
            .map_err(|e| DbError::Corrupt(format!("post content: {}", e)))?,
        target_at: row.try_get("target_at").map_err(DbError::SqlxError)?,
        state: state.parse::<PostState>().map_err(DbError::Corrupt)?,
        platform_post_id: row.try_get("platform_post_id").map_err(DbError::SqlxError)?,
        failure_class: failure_class
            .map(|c| c.parse())
            .transpose()
            .map_err(DbError::Corrupt)?,
        failure_reason: row.try_get("failure_reason").map_err(DbError::SqlxError)?,
        attempts: attempts.max(0) as u32,
        reservation_token: reservation_token.map(ReservationToken),
        cycle_id: row.try_get("cycle_id").map_err(DbError::SqlxError)?,
        queued_at: row.try_get("queued_at").map_err(DbError::SqlxError)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(DbError::SqlxError)?,
        lease_owner: row.try_get("lease_owner").map_err(DbError::SqlxError)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(DbError::SqlxError)?,
        created_at: row.try_get("created_at").map_err(DbError::SqlxError)?,
        updated_at: row.try_get("updated_at").map_err(DbError::SqlxError)?,
    })
}

fn connection_from_row(row: &SqliteRow) -> Result<PlatformConnection> {
    let platform: String = row.try_get("platform").map_err(DbError::SqlxError)?;
    let access_token: String = row.try_get("access_token").map_err(DbError::SqlxError)?;
    let refresh_token: Option<String> = row.try_get("refresh_token").map_err(DbError::SqlxError)?;
    let valid: i64 = row.try_get("valid").map_err(DbError::SqlxError)?;

    Ok(PlatformConnection {
        key: ConnectionKey {
            subscriber_id: row.try_get("subscriber_id").map_err(DbError::SqlxError)?,
            platform: platform.parse().map_err(DbError::Corrupt)?,
        },
        credential: Credential::new(
            access_token,
            refresh_token,
            row.try_get("expires_at").map_err(DbError::SqlxError)?,
        ),
        valid: valid != 0,
        updated_at: row.try_get("updated_at").map_err(DbError::SqlxError)?,
    })
}
