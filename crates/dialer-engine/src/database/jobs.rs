//! # Origination Jobs
//!
//! Job status flow: `PENDING -> IN_FLIGHT -> DISPATCHED | FAILED`, with a rate-limited
//! job going `IN_FLIGHT -> PENDING` again under a later `not_before`. Claiming is a single
//! conditional update, so two dispatchers never work the same job. A claim is a lease:
//! an IN_FLIGHT job whose claim has aged past the dispatcher's lease is claimable again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::debug;

use super::{from_ms, to_ms, DialerDatabase};
use crate::error::{DialerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    InFlight,
    Dispatched,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::InFlight => "IN_FLIGHT",
            JobStatus::Dispatched => "DISPATCHED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "IN_FLIGHT" => Some(JobStatus::InFlight),
            "DISPATCHED" => Some(JobStatus::Dispatched),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Dispatched | JobStatus::Failed)
    }
}

/// Unit of work handed to the dispatcher
#[derive(Debug, Clone)]
pub struct OriginateJob {
    pub job_id: String,
    pub attempt_id: String,
    pub campaign_id: String,
    pub priority: i32,
    pub status: JobStatus,
    pub retry_count: u32,
    pub not_before: DateTime<Utc>,
    pub last_error: Option<String>,
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<OriginateJob> {
    let status: String = row.try_get("status")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    Ok(OriginateJob {
        job_id: row.try_get("job_id")?,
        attempt_id: row.try_get("attempt_id")?,
        campaign_id: row.try_get("campaign_id")?,
        priority: row.try_get("priority")?,
        status: JobStatus::from_str(&status)
            .ok_or_else(|| DialerError::database(format!("unknown job status {}", status)))?,
        retry_count: retry_count.max(0) as u32,
        not_before: from_ms(row.try_get("not_before_ms")?),
        last_error: row.try_get("last_error")?,
    })
}

impl DialerDatabase {
    /// Claim up to `limit` due jobs, highest priority first
    ///
    /// Besides due PENDING jobs this takes over IN_FLIGHT jobs whose claim is older than
    /// `lease`, i.e. jobs a crashed or stalled dispatcher never finished.
    pub async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: u32,
    ) -> Result<Vec<OriginateJob>> {
        let now_ms = to_ms(now);
        let stale_before_ms = now_ms.saturating_sub(i64::try_from(lease.as_millis()).unwrap_or(i64::MAX));
        let rows = sqlx::query(
            r#"
            UPDATE originate_jobs
            SET status = 'IN_FLIGHT', claimed_at_ms = ?1
            WHERE job_id IN (
                SELECT job_id FROM originate_jobs
                WHERE (status = 'PENDING' AND not_before_ms <= ?1)
                   OR (status = 'IN_FLIGHT' AND COALESCE(claimed_at_ms, 0) <= ?2)
                ORDER BY priority DESC, not_before_ms ASC
                LIMIT ?3
            )
            AND (
                (status = 'PENDING' AND not_before_ms <= ?1)
                OR (status = 'IN_FLIGHT' AND COALESCE(claimed_at_ms, 0) <= ?2)
            )
            RETURNING job_id, attempt_id, campaign_id, priority, status, retry_count,
                      not_before_ms, last_error
            "#,
        )
        .bind(now_ms)
        .bind(stale_before_ms)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
        // RETURNING order is unspecified
        jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.not_before.cmp(&b.not_before)));

        if !jobs.is_empty() {
            debug!("Claimed {} origination jobs", jobs.len());
        }
        Ok(jobs)
    }

    pub async fn mark_job_dispatched(&self, job_id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE originate_jobs SET status = 'DISPATCHED', dispatched_at_ms = ? WHERE job_id = ?",
        )
        .bind(to_ms(now))
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Put a claimed job back for a later retry
    pub async fn requeue_job(&self, job_id: &str, not_before: DateTime<Utc>, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE originate_jobs
            SET status = 'PENDING', retry_count = retry_count + 1, not_before_ms = ?, last_error = ?
            WHERE job_id = ? AND status = 'IN_FLIGHT'
            "#,
        )
        .bind(to_ms(not_before))
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_job(&self, job_id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE originate_jobs SET status = 'FAILED', last_error = ? WHERE job_id = ?")
            .bind(error)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_job_for_attempt(&self, attempt_id: &str) -> Result<Option<OriginateJob>> {
        let row = sqlx::query(
            r#"
            SELECT job_id, attempt_id, campaign_id, priority, status, retry_count,
                   not_before_ms, last_error
            FROM originate_jobs WHERE attempt_id = ?
            "#,
        )
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }
}
