//! # Trunk Admission State
//!
//! The sliding window of a trunk is the set of its `trunk_admissions` rows younger than
//! the trunk's window. The helpers taking a `SqliteConnection` run inside the rate
//! limiter's admission transaction; they must not touch the pool, or an in-memory
//! database (one connection) would deadlock against its own transaction.

use chrono::Utc;
use sqlx::{Row, SqliteConnection};
use tracing::debug;

use super::{to_ms, DialerDatabase};
use crate::error::{DialerError, Result};
use crate::rate_limit::{LimitScope, TrunkLimit, TrunkLimitConfig, TrunkState};

fn limit_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TrunkLimit> {
    let scope: String = row.try_get("scope")?;
    let max_cps: i64 = row.try_get("max_cps")?;
    let burst_allowance: i64 = row.try_get("burst_allowance")?;
    let throttle_ms: Option<i64> = row.try_get("throttle_ms")?;
    let current_usage: i64 = row.try_get("current_usage")?;
    Ok(TrunkLimit {
        limit_id: row.try_get("limit_id")?,
        scope: LimitScope::from_str(&scope)
            .ok_or_else(|| DialerError::database(format!("unknown limit scope {}", scope)))?,
        scope_value: row.try_get("scope_value")?,
        max_cps: max_cps.max(0) as u32,
        burst_allowance: burst_allowance.max(0) as u32,
        throttle_ms: throttle_ms.map(|ms| ms.max(0) as u64),
        current_usage: current_usage.max(0) as u32,
    })
}

fn trunk_from_row(trunk_id: &str, row: &sqlx::sqlite::SqliteRow) -> Result<TrunkState> {
    let max_cps: i64 = row.try_get("max_cps")?;
    let burst_limit: Option<i64> = row.try_get("burst_limit")?;
    let window_ms: i64 = row.try_get("window_ms")?;
    let occupancy: i64 = row.try_get("current_occupancy")?;
    Ok(TrunkState {
        trunk_id: trunk_id.to_string(),
        max_cps: max_cps.max(0) as u32,
        burst_limit: burst_limit.map(|b| b.max(0) as u32),
        window_ms: window_ms.max(1) as u64,
        current_occupancy: occupancy.max(0) as u32,
    })
}

impl DialerDatabase {
    /// Replace a trunk's configuration and its granular limits
    pub async fn store_trunk_limits(
        &self,
        trunk_id: &str,
        config: &TrunkLimitConfig,
        default_window_ms: u64,
    ) -> Result<()> {
        let now_ms = to_ms(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO trunks (trunk_id, max_cps, burst_limit, window_ms, current_occupancy, updated_at_ms)
            VALUES (?, ?, ?, ?, 0, ?)
            ON CONFLICT(trunk_id) DO UPDATE SET
                max_cps = excluded.max_cps,
                burst_limit = excluded.burst_limit,
                window_ms = excluded.window_ms,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(trunk_id)
        .bind(config.max_cps as i64)
        .bind(config.burst_limit.map(i64::from))
        .bind(config.window_ms.unwrap_or(default_window_ms) as i64)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM trunk_limits WHERE trunk_id = ?")
            .bind(trunk_id)
            .execute(&mut *tx)
            .await?;

        for limit in &config.limits {
            sqlx::query(
                r#"
                INSERT INTO trunk_limits (limit_id, trunk_id, scope, scope_value, max_cps,
                                          burst_allowance, throttle_ms, current_usage)
                VALUES (?, ?, ?, ?, ?, ?, ?, 0)
                "#,
            )
            .bind(&limit.limit_id)
            .bind(trunk_id)
            .bind(limit.scope.as_str())
            .bind(&limit.scope_value)
            .bind(limit.max_cps as i64)
            .bind(limit.burst_allowance as i64)
            .bind(limit.throttle_ms.map(|ms| ms as i64))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "Trunk {} configured: max_cps={} burst={:?} limits={}",
            trunk_id,
            config.max_cps,
            config.burst_limit,
            config.limits.len()
        );
        Ok(())
    }

    pub async fn get_trunk(&self, trunk_id: &str) -> Result<Option<TrunkState>> {
        let row = sqlx::query(
            "SELECT max_cps, burst_limit, window_ms, current_occupancy FROM trunks WHERE trunk_id = ?",
        )
        .bind(trunk_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(|r| trunk_from_row(trunk_id, r)).transpose()
    }

    pub async fn get_trunk_limits(&self, trunk_id: &str) -> Result<Vec<TrunkLimit>> {
        let mut conn = self.pool.acquire().await?;
        load_trunk_limits(&mut conn, trunk_id).await
    }

    /// Admissions of a trunk (or of one of its limits) younger than `window_start_ms`
    pub async fn count_window_admissions(
        &self,
        trunk_id: &str,
        limit_id: Option<&str>,
        window_start_ms: i64,
    ) -> Result<u32> {
        let mut conn = self.pool.acquire().await?;
        let (count, _) = window_occupancy(&mut conn, trunk_id, limit_id, window_start_ms).await?;
        Ok(count)
    }

    /// Drop the oldest admission of a trunk; `false` when the window was empty
    pub async fn release_oldest_admission(&self, trunk_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM trunk_admissions
            WHERE admission_id = (
                SELECT admission_id FROM trunk_admissions
                WHERE trunk_id = ?
                ORDER BY admitted_at_ms ASC, admission_id ASC
                LIMIT 1
            )
            "#,
        )
        .bind(trunk_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            sqlx::query(
                "UPDATE trunks SET current_occupancy = MAX(0, current_occupancy - 1) WHERE trunk_id = ?",
            )
            .bind(trunk_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(result.rows_affected() > 0)
    }
}

/// Take the trunk's write lock by touching its row, returning its configuration
pub(crate) async fn touch_trunk(
    conn: &mut SqliteConnection,
    trunk_id: &str,
    now_ms: i64,
) -> Result<Option<TrunkState>> {
    let row = sqlx::query(
        r#"
        UPDATE trunks SET updated_at_ms = ? WHERE trunk_id = ?
        RETURNING max_cps, burst_limit, window_ms, current_occupancy
        "#,
    )
    .bind(now_ms)
    .bind(trunk_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(|r| trunk_from_row(trunk_id, r)).transpose()
}

pub(crate) async fn evict_expired(conn: &mut SqliteConnection, trunk_id: &str, window_start_ms: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM trunk_admissions WHERE trunk_id = ? AND admitted_at_ms <= ?")
        .bind(trunk_id)
        .bind(window_start_ms)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Count and oldest timestamp of admissions in the window
pub(crate) async fn window_occupancy(
    conn: &mut SqliteConnection,
    trunk_id: &str,
    limit_id: Option<&str>,
    window_start_ms: i64,
) -> Result<(u32, Option<i64>)> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS occupancy, MIN(admitted_at_ms) AS oldest
        FROM trunk_admissions
        WHERE trunk_id = ? AND admitted_at_ms > ? AND (? IS NULL OR limit_id = ?)
        "#,
    )
    .bind(trunk_id)
    .bind(window_start_ms)
    .bind(limit_id)
    .bind(limit_id)
    .fetch_one(&mut *conn)
    .await?;

    let occupancy: i64 = row.try_get("occupancy")?;
    let oldest: Option<i64> = row.try_get("oldest")?;
    Ok((occupancy.max(0) as u32, oldest))
}

pub(crate) async fn load_trunk_limits(conn: &mut SqliteConnection, trunk_id: &str) -> Result<Vec<TrunkLimit>> {
    let rows = sqlx::query(
        r#"
        SELECT limit_id, scope, scope_value, max_cps, burst_allowance, throttle_ms, current_usage
        FROM trunk_limits WHERE trunk_id = ? ORDER BY limit_id
        "#,
    )
    .bind(trunk_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(limit_from_row).collect()
}

pub(crate) async fn insert_admission(
    conn: &mut SqliteConnection,
    trunk_id: &str,
    limit_id: Option<&str>,
    campaign_id: Option<&str>,
    destination: Option<&str>,
    now_ms: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO trunk_admissions (trunk_id, limit_id, campaign_id, destination, admitted_at_ms)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(trunk_id)
    .bind(limit_id)
    .bind(campaign_id)
    .bind(destination)
    .bind(now_ms)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn set_trunk_occupancy(conn: &mut SqliteConnection, trunk_id: &str, occupancy: u32) -> Result<()> {
    sqlx::query("UPDATE trunks SET current_occupancy = ? WHERE trunk_id = ?")
        .bind(occupancy as i64)
        .bind(trunk_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn set_limit_usage(conn: &mut SqliteConnection, limit_id: &str, usage: u32) -> Result<()> {
    sqlx::query("UPDATE trunk_limits SET current_usage = ? WHERE limit_id = ?")
        .bind(usage as i64)
        .bind(limit_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Persist a denial; returns the trunk's denials since `since_ms`, this one included
pub(crate) async fn record_throttle_event(
    conn: &mut SqliteConnection,
    trunk_id: &str,
    limit_id: Option<&str>,
    occupancy: u32,
    retry_after_ms: u64,
    now_ms: i64,
    since_ms: i64,
) -> Result<u32> {
    sqlx::query(
        r#"
        INSERT INTO trunk_throttle_events (trunk_id, limit_id, occupancy, retry_after_ms, occurred_at_ms)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(trunk_id)
    .bind(limit_id)
    .bind(occupancy as i64)
    .bind(retry_after_ms as i64)
    .bind(now_ms)
    .execute(&mut *conn)
    .await?;

    let denials: i64 = sqlx::query(
        "SELECT COUNT(*) AS denials FROM trunk_throttle_events WHERE trunk_id = ? AND occurred_at_ms > ?",
    )
    .bind(trunk_id)
    .bind(since_ms)
    .fetch_one(&mut *conn)
    .await?
    .try_get("denials")?;
    Ok(denials.max(0) as u32)
}
