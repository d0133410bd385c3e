//! Quota ledger
//!
//! One row per subscriber per cycle holds `allocated`, `reserved`, `committed`
//! and `released`. Approval reserves a unit, a confirmed publish commits it and
//! a failure or cancellation releases it. Each reservation is a row in
//! `reservations` whose state moves `held -> committed` or `held -> released`
//! exactly once, which is what makes commit and release idempotent.
//!
//! The `*_in` functions take a connection so callers can run them inside the
//! same transaction as a post state write.

use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::db::get_subscriber_in;
use crate::error::{AutopostError, DbError, QuotaError, Result};
use crate::types::{
    now_ms, QuotaStatus, ReservationState, ReservationToken, CYCLE_LENGTH_MS,
};
use crate::Database;

/// A freshly taken reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub token: ReservationToken,
    pub cycle_id: i64,
}

/// Raw counters of one ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerEntry {
    pub allocated: i64,
    pub reserved: i64,
    pub committed: i64,
    pub released: i64,
}

impl LedgerEntry {
    pub fn remaining(&self) -> i64 {
        (self.allocated - self.committed - self.reserved).max(0)
    }
}

/// Durable per-subscriber, per-cycle quota counter
#[derive(Clone)]
pub struct QuotaLedger {
    db: Database,
}

impl QuotaLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Reserve one unit of the subscriber's current cycle
    pub async fn reserve(&self, subscriber_id: &str) -> Result<ReservationToken> {
        self.reserve_at(subscriber_id, now_ms()).await
    }

    /// Reserve one unit, evaluating cycle expiry at `now`
    pub async fn reserve_at(&self, subscriber_id: &str, now: i64) -> Result<ReservationToken> {
        let mut tx = self.db.begin().await?;
        let reservation = reserve_in(&mut tx, subscriber_id, now).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(reservation.token)
    }

    /// Convert a reservation into counted usage
    ///
    /// Returns `false` when the token had already been committed.
    pub async fn commit(&self, token: &ReservationToken) -> Result<bool> {
        let mut tx = self.db.begin().await?;
        let committed = commit_in(&mut tx, token, now_ms()).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(committed)
    }

    /// Return a reservation to the pool
    ///
    /// Returns `false` when the token had already been released.
    pub async fn release(&self, token: &ReservationToken) -> Result<bool> {
        let mut tx = self.db.begin().await?;
        let released = release_in(&mut tx, token, now_ms()).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(released)
    }

    /// Snapshot of the subscriber's current cycle
    pub async fn status(&self, subscriber_id: &str) -> Result<QuotaStatus> {
        let row = sqlx::query(
            r#"
            SELECT s.cycle_id, s.cycle_start, l.allocated, l.reserved, l.committed, l.released
            FROM subscribers s
            JOIN quota_ledger l ON l.subscriber_id = s.id AND l.cycle_id = s.cycle_id
            WHERE s.id = ?
            "#,
        )
        .bind(subscriber_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?
        .ok_or_else(|| AutopostError::NotFound(format!("subscriber {}", subscriber_id)))?;

        let cycle_start: i64 = row.try_get("cycle_start").map_err(DbError::SqlxError)?;
        let entry = entry_from_row(&row)?;

        Ok(QuotaStatus {
            subscriber_id: subscriber_id.to_string(),
            cycle_id: row.try_get("cycle_id").map_err(DbError::SqlxError)?,
            cycle_start,
            cycle_end: cycle_start + CYCLE_LENGTH_MS,
            allocated: entry.allocated,
            reserved: entry.reserved,
            committed: entry.committed,
            released: entry.released,
            remaining: entry.remaining(),
        })
    }

    /// Counters of a specific cycle, current or past
    pub async fn entry(&self, subscriber_id: &str, cycle_id: i64) -> Result<Option<LedgerEntry>> {
        let mut conn = self.db.pool().acquire().await.map_err(DbError::SqlxError)?;
        entry_in(&mut conn, subscriber_id, cycle_id).await
    }
}

/// Reserve one unit in the subscriber's current cycle
///
/// The guarded `UPDATE` is the whole capacity check: it only matches while
/// `committed + reserved < allocated` and the cycle has not ended, so
/// concurrent callers serialise on the row and can never overshoot.
pub(crate) async fn reserve_in(
    conn: &mut SqliteConnection,
    subscriber_id: &str,
    now: i64,
) -> Result<Reservation> {
    let cycle_id: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE quota_ledger SET reserved = reserved + 1
        WHERE subscriber_id = ?
          AND committed + reserved < allocated
          AND cycle_id = (
              SELECT s.cycle_id FROM subscribers s
              WHERE s.id = ? AND ? < s.cycle_start + ?
          )
        RETURNING cycle_id
        "#,
    )
    .bind(subscriber_id)
    .bind(subscriber_id)
    .bind(now)
    .bind(CYCLE_LENGTH_MS)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    let cycle_id = match cycle_id {
        Some(cycle_id) => cycle_id,
        None => return Err(reserve_refusal(conn, subscriber_id, now).await),
    };

    let token = ReservationToken::generate();
    sqlx::query(
        r#"
        INSERT INTO reservations (token, subscriber_id, cycle_id, state, created_at)
        VALUES (?, ?, ?, 'held', ?)
        "#,
    )
    .bind(token.as_str())
    .bind(subscriber_id)
    .bind(cycle_id)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    debug!(subscriber_id = %subscriber_id, cycle_id, token = %token, "Reserved quota");
    Ok(Reservation { token, cycle_id })
}

/// Work out why the guarded reserve matched nothing
async fn reserve_refusal(conn: &mut SqliteConnection, subscriber_id: &str, now: i64) -> AutopostError {
    let subscriber = match get_subscriber_in(conn, subscriber_id).await {
        Ok(Some(subscriber)) => subscriber,
        Ok(None) => return AutopostError::NotFound(format!("subscriber {}", subscriber_id)),
        Err(e) => return e,
    };

    if now >= subscriber.cycle_end() {
        return QuotaError::CycleExpired {
            subscriber_id: subscriber_id.to_string(),
            cycle_id: subscriber.cycle_id,
        }
        .into();
    }

    match entry_in(conn, subscriber_id, subscriber.cycle_id).await {
        Ok(entry) => QuotaError::Exceeded {
            subscriber_id: subscriber_id.to_string(),
            allocated: entry.map(|e| e.allocated).unwrap_or(0),
        }
        .into(),
        Err(e) => e,
    }
}

/// Mark a held reservation committed and move it from `reserved` to `committed`
///
/// The reservation is settled against the cycle it was taken in, even if the
/// subscriber has rolled over since.
pub(crate) async fn commit_in(
    conn: &mut SqliteConnection,
    token: &ReservationToken,
    now: i64,
) -> Result<bool> {
    let settled = settle(conn, token, ReservationState::Committed, now).await?;
    let (subscriber_id, cycle_id) = match settled {
        Some(row) => row,
        None => {
            return match reservation_state_in(conn, token).await? {
                None => Err(QuotaError::UnknownReservation(token.to_string()).into()),
                Some(ReservationState::Released) => {
                    Err(QuotaError::AlreadyReleased(token.to_string()).into())
                }
                Some(_) => {
                    debug!(token = %token, "Reservation already committed, nothing to do");
                    Ok(false)
                }
            };
        }
    };

    apply_to_ledger(
        conn,
        &subscriber_id,
        cycle_id,
        "reserved = reserved - 1, committed = committed + 1",
    )
    .await?;

    debug!(subscriber_id = %subscriber_id, cycle_id, token = %token, "Committed quota");
    Ok(true)
}

/// Mark a held reservation released and return it to the pool
pub(crate) async fn release_in(
    conn: &mut SqliteConnection,
    token: &ReservationToken,
    now: i64,
) -> Result<bool> {
    let settled = settle(conn, token, ReservationState::Released, now).await?;
    let (subscriber_id, cycle_id) = match settled {
        Some(row) => row,
        None => {
            return match reservation_state_in(conn, token).await? {
                None => Err(QuotaError::UnknownReservation(token.to_string()).into()),
                Some(ReservationState::Committed) => {
                    Err(QuotaError::AlreadyCommitted(token.to_string()).into())
                }
                Some(_) => {
                    debug!(token = %token, "Reservation already released, nothing to do");
                    Ok(false)
                }
            };
        }
    };

    apply_to_ledger(
        conn,
        &subscriber_id,
        cycle_id,
        "reserved = reserved - 1, released = released + 1",
    )
    .await?;

    debug!(subscriber_id = %subscriber_id, cycle_id, token = %token, "Released quota");
    Ok(true)
}

/// Single-use transition of a reservation out of `held`
async fn settle(
    conn: &mut SqliteConnection,
    token: &ReservationToken,
    to: ReservationState,
    now: i64,
) -> Result<Option<(String, i64)>> {
    let row = sqlx::query(
        r#"
        UPDATE reservations SET state = ?, settled_at = ?
        WHERE token = ? AND state = 'held'
        RETURNING subscriber_id, cycle_id
        "#,
    )
    .bind(to.as_str())
    .bind(now)
    .bind(token.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    match row {
        Some(row) => Ok(Some((
            row.try_get("subscriber_id").map_err(DbError::SqlxError)?,
            row.try_get("cycle_id").map_err(DbError::SqlxError)?,
        ))),
        None => Ok(None),
    }
}

async fn apply_to_ledger(
    conn: &mut SqliteConnection,
    subscriber_id: &str,
    cycle_id: i64,
    assignments: &str,
) -> Result<()> {
    let query_str = format!(
        "UPDATE quota_ledger SET {} WHERE subscriber_id = ? AND cycle_id = ? AND reserved > 0",
        assignments
    );

    let result = sqlx::query(&query_str)
        .bind(subscriber_id)
        .bind(cycle_id)
        .execute(&mut *conn)
        .await
        .map_err(DbError::SqlxError)?;

    if result.rows_affected() != 1 {
        return Err(DbError::Corrupt(format!(
            "ledger row {}/{} has no reserved unit for a held reservation",
            subscriber_id, cycle_id
        ))
        .into());
    }

    Ok(())
}

pub(crate) async fn reservation_state_in(
    conn: &mut SqliteConnection,
    token: &ReservationToken,
) -> Result<Option<ReservationState>> {
    let state: Option<String> =
        sqlx::query_scalar("SELECT state FROM reservations WHERE token = ?")
            .bind(token.as_str())
            .fetch_optional(&mut *conn)
            .await
            .map_err(DbError::SqlxError)?;

    state
        .map(|s| s.parse::<ReservationState>().map_err(|e| DbError::Corrupt(e).into()))
        .transpose()
}

pub(crate) async fn entry_in(
    conn: &mut SqliteConnection,
    subscriber_id: &str,
    cycle_id: i64,
) -> Result<Option<LedgerEntry>> {
    let row = sqlx::query(
        r#"
        SELECT allocated, reserved, committed, released FROM quota_ledger
        WHERE subscriber_id = ? AND cycle_id = ?
        "#,
    )
    .bind(subscriber_id)
    .bind(cycle_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    row.as_ref().map(entry_from_row).transpose()
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<LedgerEntry> {
    Ok(LedgerEntry {
        allocated: row.try_get("allocated").map_err(DbError::SqlxError)?,
        reserved: row.try_get("reserved").map_err(DbError::SqlxError)?,
        committed: row.try_get("committed").map_err(DbError::SqlxError)?,
        released: row.try_get("released").map_err(DbError::SqlxError)?,
    })
}

/// Advance the subscriber to the next cycle and open its ledger row
///
/// Returns `(previous_cycle_id, new_cycle_id)`, or `None` when the renewal is
/// stale: its start is not after the current cycle start.
pub(crate) async fn advance_cycle_in(
    conn: &mut SqliteConnection,
    subscriber_id: &str,
    new_cycle_start: i64,
    new_allocation: i64,
) -> Result<Option<(i64, i64)>> {
    let new_cycle_id: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE subscribers SET cycle_id = cycle_id + 1, cycle_start = ?
        WHERE id = ? AND cycle_start < ?
        RETURNING cycle_id
        "#,
    )
    .bind(new_cycle_start)
    .bind(subscriber_id)
    .bind(new_cycle_start)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    let new_cycle_id = match new_cycle_id {
        Some(id) => id,
        None => {
            if get_subscriber_in(conn, subscriber_id).await?.is_none() {
                return Err(AutopostError::NotFound(format!("subscriber {}", subscriber_id)));
            }
            return Ok(None);
        }
    };

    sqlx::query(
        r#"
        INSERT INTO quota_ledger (subscriber_id, cycle_id, allocated)
        VALUES (?, ?, ?)
        "#,
    )
    .bind(subscriber_id)
    .bind(new_cycle_id)
    .bind(new_allocation)
    .execute(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    info!(
        subscriber_id = %subscriber_id,
        cycle_id = new_cycle_id,
        allocation = new_allocation,
        "Opened new quota cycle"
    );
    Ok(Some((new_cycle_id - 1, new_cycle_id)))
}

/// Release every reservation of cycles before `cycle_id` that no post is
/// still publishing under
///
/// Run after leftover posts were cancelled, this catches reservations taken
/// directly through the ledger without a post attached.
pub(crate) async fn release_stale_in(
    conn: &mut SqliteConnection,
    subscriber_id: &str,
    cycle_id: i64,
    now: i64,
) -> Result<u64> {
    let tokens: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT r.token FROM reservations r
        WHERE r.subscriber_id = ? AND r.cycle_id < ? AND r.state = 'held'
          AND NOT EXISTS (
              SELECT 1 FROM posts p
              WHERE p.reservation_token = r.token AND p.state = 'publishing'
          )
        "#,
    )
    .bind(subscriber_id)
    .bind(cycle_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;

    let mut released = 0;
    for token in tokens {
        if release_in(conn, &ReservationToken(token), now).await? {
            released += 1;
        }
    }

    if released > 0 {
        warn!(
            subscriber_id = %subscriber_id,
            released,
            "Released reservations left over from an expired cycle"
        );
    }
    Ok(released)
}
