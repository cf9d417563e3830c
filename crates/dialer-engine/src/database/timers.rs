//! Attempt timers. Arming and cancelling happen inside
//! [`apply_transition`](DialerDatabase::apply_transition); this module covers reads and
//! the fire-once claim.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{from_ms, to_ms, DialerDatabase};
use crate::attempt::{AttemptTimer, TimerKind};
use crate::error::{DialerError, Result};

fn timer_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AttemptTimer> {
    let kind: String = row.try_get("kind")?;
    Ok(AttemptTimer {
        timer_id: row.try_get("timer_id")?,
        attempt_id: row.try_get("attempt_id")?,
        kind: TimerKind::from_str(&kind)
            .ok_or_else(|| DialerError::database(format!("unknown timer kind {}", kind)))?,
        fire_at: from_ms(row.try_get("fire_at_ms")?),
        fired: row.try_get("fired")?,
        cancelled: row.try_get("cancelled")?,
    })
}

impl DialerDatabase {
    /// All timers ever armed for an attempt, oldest first
    pub async fn list_attempt_timers(&self, attempt_id: &str) -> Result<Vec<AttemptTimer>> {
        let rows = sqlx::query(
            r#"
            SELECT timer_id, attempt_id, kind, fire_at_ms, fired, cancelled
            FROM attempt_timers WHERE attempt_id = ? ORDER BY created_at_ms, rowid
            "#,
        )
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(timer_from_row).collect()
    }

    pub async fn active_timers(&self, attempt_id: &str) -> Result<Vec<AttemptTimer>> {
        Ok(self
            .list_attempt_timers(attempt_id)
            .await?
            .into_iter()
            .filter(AttemptTimer::is_active)
            .collect())
    }

    /// Active timers due at `now`, earliest first
    pub async fn due_timers(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<AttemptTimer>> {
        let rows = sqlx::query(
            r#"
            SELECT timer_id, attempt_id, kind, fire_at_ms, fired, cancelled
            FROM attempt_timers
            WHERE fired = 0 AND cancelled = 0 AND fire_at_ms <= ?
            ORDER BY fire_at_ms
            LIMIT ?
            "#,
        )
        .bind(to_ms(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(timer_from_row).collect()
    }

    /// Mark a timer fired if it is still active.
    ///
    /// Only the caller that gets `true` may produce the expiry event; a timer cancelled
    /// between the scan and the claim yields `false`.
    pub async fn claim_timer(&self, timer_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE attempt_timers SET fired = 1 WHERE timer_id = ? AND fired = 0 AND cancelled = 0",
        )
        .bind(timer_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
