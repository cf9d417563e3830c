//! # Call Attempt Persistence
//!
//! Attempts are created together with their origination job in one transaction and are
//! then only ever changed through [`DialerDatabase::apply_transition`], a compare-and-swap
//! on `(state, version)` that also updates timers and appends the event log. If the
//! swap misses, nothing is written and the caller reloads and retries.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use super::leads::terminal_states_sql;
use super::{from_ms, parse_timestamp, to_ms, ts, DialerDatabase};
use crate::attempt::table::stamp_column;
use crate::attempt::{AttemptEventRecord, CallAttempt, CallState, EventKind, TimerKind};
use crate::error::{DialerError, Result};

/// Attempt about to be created for a freshly reserved lead
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub campaign_id: String,
    pub account_id: String,
    pub lead_id: String,
    pub destination: String,
    pub attempt_number: u32,
    pub job_priority: i32,
}

impl NewAttempt {
    /// Idempotency key shared by every writer that might create this attempt
    pub fn correlation_id(&self) -> String {
        format!("{}:{}:{}", self.campaign_id, self.lead_id, self.attempt_number)
    }
}

/// Everything written by one applied state transition
#[derive(Debug, Clone)]
pub struct AttemptTransition {
    pub attempt_id: String,
    pub from: CallState,
    pub to: CallState,
    /// Version read together with `from`; the swap only succeeds if both still hold
    pub expected_version: i64,
    pub event: EventKind,
    pub detail: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
    pub cancel_timers: Vec<TimerKind>,
    pub arm_timers: Vec<(TimerKind, DateTime<Utc>)>,
    pub final_sip_code: Option<u16>,
    pub final_reason: Option<String>,
    pub agent_id: Option<String>,
    pub trunk_id: Option<String>,
    pub caller_id: Option<String>,
}

const ATTEMPT_COLUMNS: &str = r#"
    attempt_id, campaign_id, account_id, lead_id, destination, state, version,
    correlation_id, trunk_id, caller_id, provider_call_id, agent_id, created_at_ms,
    reserved_at, originate_at, ring_at, early_media_at, answer_at, bridge_at, end_at,
    final_sip_code, final_reason
"#;

fn attempt_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CallAttempt> {
    let state: String = row.try_get("state")?;
    let final_sip_code: Option<i64> = row.try_get("final_sip_code")?;
    Ok(CallAttempt {
        attempt_id: row.try_get("attempt_id")?,
        campaign_id: row.try_get("campaign_id")?,
        account_id: row.try_get("account_id")?,
        lead_id: row.try_get("lead_id")?,
        destination: row.try_get("destination")?,
        state: CallState::from_str(&state)
            .ok_or_else(|| DialerError::database(format!("unknown call state {}", state)))?,
        version: row.try_get("version")?,
        correlation_id: row.try_get("correlation_id")?,
        trunk_id: row.try_get("trunk_id")?,
        caller_id: row.try_get("caller_id")?,
        provider_call_id: row.try_get("provider_call_id")?,
        agent_id: row.try_get("agent_id")?,
        created_at: from_ms(row.try_get("created_at_ms")?),
        reserved_at: parse_timestamp(row.try_get("reserved_at")?),
        originate_at: parse_timestamp(row.try_get("originate_at")?),
        ring_at: parse_timestamp(row.try_get("ring_at")?),
        early_media_at: parse_timestamp(row.try_get("early_media_at")?),
        answer_at: parse_timestamp(row.try_get("answer_at")?),
        bridge_at: parse_timestamp(row.try_get("bridge_at")?),
        end_at: parse_timestamp(row.try_get("end_at")?),
        final_sip_code: final_sip_code.and_then(|c| u16::try_from(c).ok()),
        final_reason: row.try_get("final_reason")?,
    })
}

impl DialerDatabase {
    /// Create a `QUEUED` attempt and its `PENDING` origination job.
    ///
    /// Returns the attempt and whether it was created by this call. A second call with
    /// the same correlation id returns the existing attempt and creates nothing.
    pub async fn create_attempt_with_job(
        &self,
        new: &NewAttempt,
        now: DateTime<Utc>,
    ) -> Result<(CallAttempt, bool)> {
        let correlation_id = new.correlation_id();
        let attempt_id = Uuid::new_v4().to_string();
        let now_ms = to_ms(now);

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO call_attempts (attempt_id, campaign_id, account_id, lead_id, destination,
                                       state, version, correlation_id, created_at_ms, updated_at)
            VALUES (?, ?, ?, ?, ?, 'QUEUED', 0, ?, ?, ?)
            ON CONFLICT(correlation_id) DO NOTHING
            "#,
        )
        .bind(&attempt_id)
        .bind(&new.campaign_id)
        .bind(&new.account_id)
        .bind(&new.lead_id)
        .bind(&new.destination)
        .bind(&correlation_id)
        .bind(now_ms)
        .bind(ts(now))
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if inserted {
            sqlx::query(
                r#"
                INSERT INTO originate_jobs (job_id, attempt_id, campaign_id, priority, status,
                                            retry_count, not_before_ms, created_at_ms)
                VALUES (?, ?, ?, ?, 'PENDING', 0, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&attempt_id)
            .bind(&new.campaign_id)
            .bind(new.job_priority)
            .bind(now_ms)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
        }

        let sql = format!("SELECT {} FROM call_attempts WHERE correlation_id = ?", ATTEMPT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(&correlation_id)
            .fetch_one(&mut *tx)
            .await?;
        let attempt = attempt_from_row(&row)?;

        tx.commit().await?;

        if inserted {
            debug!("Created attempt {} ({})", attempt.attempt_id, correlation_id);
        } else {
            debug!("Attempt {} already exists, reusing {}", correlation_id, attempt.attempt_id);
        }
        Ok((attempt, inserted))
    }

    pub async fn get_attempt(&self, attempt_id: &str) -> Result<Option<CallAttempt>> {
        let sql = format!("SELECT {} FROM call_attempts WHERE attempt_id = ?", ATTEMPT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(attempt_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(attempt_from_row).transpose()
    }

    pub async fn list_campaign_attempts(&self, campaign_id: &str) -> Result<Vec<CallAttempt>> {
        let sql = format!(
            "SELECT {} FROM call_attempts WHERE campaign_id = ? ORDER BY created_at_ms, attempt_id",
            ATTEMPT_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(campaign_id).fetch_all(&self.pool).await?;
        rows.iter().map(attempt_from_row).collect()
    }

    /// Attempts of the campaign that have not reached a terminal state
    pub async fn count_active_attempts(&self, campaign_id: &str) -> Result<u32> {
        let sql = format!(
            "SELECT COUNT(*) AS active FROM call_attempts WHERE campaign_id = ? AND state NOT IN ({})",
            terminal_states_sql()
        );
        let count: i64 = sqlx::query(&sql)
            .bind(campaign_id)
            .fetch_one(&self.pool)
            .await?
            .try_get("active")?;
        Ok(count.max(0) as u32)
    }

    /// Record the provider's call id reported after origination
    pub async fn set_provider_call_id(&self, attempt_id: &str, provider_call_id: &str) -> Result<()> {
        sqlx::query("UPDATE call_attempts SET provider_call_id = ? WHERE attempt_id = ?")
            .bind(provider_call_id)
            .bind(attempt_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Apply a transition if the attempt is still at `(from, expected_version)`.
    ///
    /// Returns `false` when another writer got there first; nothing is written then.
    pub async fn apply_transition(&self, t: &AttemptTransition) -> Result<bool> {
        let at = ts(t.at);
        let at_ms = to_ms(t.at);
        let stamp = stamp_column(t.to)
            .map(|column| format!("{column} = COALESCE({column}, ?),"))
            .unwrap_or_default();
        let sql = format!(
            r#"
            UPDATE call_attempts
            SET state = ?, version = version + 1, updated_at = ?, {stamp}
                final_sip_code = COALESCE(?, final_sip_code),
                final_reason = COALESCE(?, final_reason),
                agent_id = COALESCE(?, agent_id),
                trunk_id = COALESCE(?, trunk_id),
                caller_id = COALESCE(?, caller_id)
            WHERE attempt_id = ? AND state = ? AND version = ?
            "#
        );

        let mut tx = self.pool.begin().await?;

        let mut query = sqlx::query(&sql).bind(t.to.as_str()).bind(&at);
        if !stamp.is_empty() {
            query = query.bind(&at);
        }
        let swapped = query
            .bind(t.final_sip_code.map(i64::from))
            .bind(&t.final_reason)
            .bind(&t.agent_id)
            .bind(&t.trunk_id)
            .bind(&t.caller_id)
            .bind(&t.attempt_id)
            .bind(t.from.as_str())
            .bind(t.expected_version)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;

        if !swapped {
            tx.rollback().await?;
            return Ok(false);
        }

        for kind in &t.cancel_timers {
            sqlx::query(
                r#"
                UPDATE attempt_timers SET cancelled = 1
                WHERE attempt_id = ? AND kind = ? AND fired = 0 AND cancelled = 0
                "#,
            )
            .bind(&t.attempt_id)
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;
        }

        // The partial unique index keeps an already-active timer of the same kind.
        for (kind, fire_at) in &t.arm_timers {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO attempt_timers (timer_id, attempt_id, kind, fire_at_ms, created_at_ms)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&t.attempt_id)
            .bind(kind.as_str())
            .bind(to_ms(*fire_at))
            .bind(at_ms)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO attempt_events (attempt_id, from_state, to_state, event, detail, occurred_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&t.attempt_id)
        .bind(t.from.as_str())
        .bind(t.to.as_str())
        .bind(t.event.as_str())
        .bind(t.detail.as_ref().map(|d| d.to_string()))
        .bind(&at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// The attempt's transition log, oldest first
    pub async fn list_attempt_events(&self, attempt_id: &str) -> Result<Vec<AttemptEventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, attempt_id, from_state, to_state, event, detail, occurred_at
            FROM attempt_events WHERE attempt_id = ? ORDER BY event_id
            "#,
        )
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let from: String = row.try_get("from_state")?;
            let to: String = row.try_get("to_state")?;
            let detail: Option<String> = row.try_get("detail")?;
            events.push(AttemptEventRecord {
                event_id: row.try_get("event_id")?,
                attempt_id: row.try_get("attempt_id")?,
                from_state: CallState::from_str(&from)
                    .ok_or_else(|| DialerError::database(format!("unknown call state {}", from)))?,
                to_state: CallState::from_str(&to)
                    .ok_or_else(|| DialerError::database(format!("unknown call state {}", to)))?,
                event: row.try_get("event")?,
                detail: detail.map(|d| serde_json::from_str(&d)).transpose()?,
                occurred_at: parse_timestamp(row.try_get("occurred_at")?).unwrap_or_default(),
            });
        }
        Ok(events)
    }
}
