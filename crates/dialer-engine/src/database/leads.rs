//! # Lead Reservation
//!
//! [`DialerDatabase::reserve_leads`] is the only way a lead leaves `AVAILABLE`. It is one
//! `UPDATE ... WHERE lead_id IN (SELECT ...) AND status = 'AVAILABLE' RETURNING` statement:
//! SQLite runs it under the database write lock, and the repeated status predicate means a
//! row claimed by another writer is simply not returned. Two schedulers racing over the
//! same pool therefore partition it instead of sharing leads.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::debug;

use super::{from_ms, to_ms, DialerDatabase};
use crate::attempt::CallState;
use crate::error::{DialerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadStatus {
    Available,
    Reserved,
    /// An attempt reached an agent
    Completed,
    /// Out of attempts without reaching an agent
    Exhausted,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Available => "AVAILABLE",
            LeadStatus::Reserved => "RESERVED",
            LeadStatus::Completed => "COMPLETED",
            LeadStatus::Exhausted => "EXHAUSTED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "AVAILABLE" => Some(LeadStatus::Available),
            "RESERVED" => Some(LeadStatus::Reserved),
            "COMPLETED" => Some(LeadStatus::Completed),
            "EXHAUSTED" => Some(LeadStatus::Exhausted),
            _ => None,
        }
    }
}

/// Lead as loaded by the lead import pipeline
#[derive(Debug, Clone)]
pub struct NewLead {
    pub lead_id: String,
    pub campaign_id: String,
    pub account_id: String,
    pub phone_number: String,
    pub priority: i32,
    pub score: f64,
    pub do_not_call: bool,
    pub consent: bool,
}

impl NewLead {
    pub fn new(lead_id: &str, campaign_id: &str, account_id: &str, phone_number: &str) -> Self {
        Self {
            lead_id: lead_id.to_string(),
            campaign_id: campaign_id.to_string(),
            account_id: account_id.to_string(),
            phone_number: phone_number.to_string(),
            priority: 0,
            score: 0.0,
            do_not_call: false,
            consent: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Lead {
    pub lead_id: String,
    pub campaign_id: String,
    pub phone_number: String,
    pub status: LeadStatus,
    pub priority: i32,
    pub score: f64,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub reserved_by: Option<String>,
}

/// A lead claimed by one scheduler tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedLead {
    pub lead_id: String,
    pub phone_number: String,
    /// 1-based number of the attempt this reservation is for
    pub attempt_number: u32,
}

/// Eligibility rules applied during reservation
#[derive(Debug, Clone)]
pub struct ReservationPolicy {
    pub max_attempts_per_lead: u32,
    pub retry_cooldown: Duration,
    /// Written into `reserved_by`
    pub reserved_by: String,
}

pub(crate) fn terminal_states_sql() -> String {
    CallState::ALL
        .iter()
        .filter(|s| s.is_terminal())
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl DialerDatabase {
    pub async fn insert_lead(&self, lead: &NewLead) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO leads (lead_id, campaign_id, account_id, phone_number, status,
                               priority, score, do_not_call, consent, created_at_ms)
            VALUES (?, ?, ?, ?, 'AVAILABLE', ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&lead.lead_id)
        .bind(&lead.campaign_id)
        .bind(&lead.account_id)
        .bind(&lead.phone_number)
        .bind(lead.priority)
        .bind(lead.score)
        .bind(lead.do_not_call)
        .bind(lead.consent)
        .bind(to_ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_lead(&self, lead_id: &str) -> Result<Option<Lead>> {
        let row = sqlx::query(
            r#"
            SELECT lead_id, campaign_id, phone_number, status, priority, score,
                   attempt_count, last_attempt_at_ms, reserved_by
            FROM leads WHERE lead_id = ?
            "#,
        )
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status")?;
        let attempt_count: i64 = row.try_get("attempt_count")?;
        let last_attempt: Option<i64> = row.try_get("last_attempt_at_ms")?;
        Ok(Some(Lead {
            lead_id: row.try_get("lead_id")?,
            campaign_id: row.try_get("campaign_id")?,
            phone_number: row.try_get("phone_number")?,
            status: LeadStatus::from_str(&status)
                .ok_or_else(|| DialerError::database(format!("unknown lead status {}", status)))?,
            priority: row.try_get("priority")?,
            score: row.try_get("score")?,
            attempt_count: attempt_count.max(0) as u32,
            last_attempt_at: last_attempt.map(from_ms),
            reserved_by: row.try_get("reserved_by")?,
        }))
    }

    /// Atomically reserve up to `limit` eligible leads, best priority and score first.
    ///
    /// Eligible means available, not do-not-call, consented, under the attempt cap and
    /// past the retry cooldown.
    pub async fn reserve_leads(
        &self,
        campaign_id: &str,
        account_id: &str,
        limit: u32,
        policy: &ReservationPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservedLead>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now_ms = to_ms(now);
        let cooldown_cutoff = now_ms - policy.retry_cooldown.as_millis() as i64;

        let rows = sqlx::query(
            r#"
            UPDATE leads
            SET status = 'RESERVED',
                reserved_at_ms = ?,
                reserved_by = ?,
                attempt_count = attempt_count + 1,
                last_attempt_at_ms = ?
            WHERE lead_id IN (
                SELECT lead_id FROM leads
                WHERE campaign_id = ? AND account_id = ?
                  AND status = 'AVAILABLE'
                  AND do_not_call = 0 AND consent = 1
                  AND attempt_count < ?
                  AND (last_attempt_at_ms IS NULL OR last_attempt_at_ms <= ?)
                ORDER BY priority DESC, score DESC, created_at_ms ASC
                LIMIT ?
            )
            AND status = 'AVAILABLE'
            RETURNING lead_id, phone_number, attempt_count
            "#,
        )
        .bind(now_ms)
        .bind(&policy.reserved_by)
        .bind(now_ms)
        .bind(campaign_id)
        .bind(account_id)
        .bind(policy.max_attempts_per_lead as i64)
        .bind(cooldown_cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut reserved = Vec::with_capacity(rows.len());
        for row in rows {
            let attempt_count: i64 = row.try_get("attempt_count")?;
            reserved.push(ReservedLead {
                lead_id: row.try_get("lead_id")?,
                phone_number: row.try_get("phone_number")?,
                attempt_number: attempt_count.max(1) as u32,
            });
        }

        debug!("Reserved {}/{} leads for campaign {}", reserved.len(), limit, campaign_id);
        Ok(reserved)
    }

    /// Return a reserved lead whose attempt could not be created
    pub async fn release_lead(&self, lead_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE leads
            SET status = 'AVAILABLE', reserved_at_ms = NULL, reserved_by = NULL,
                attempt_count = MAX(0, attempt_count - 1)
            WHERE lead_id = ? AND status = 'RESERVED'
            "#,
        )
        .bind(lead_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Settle reserved leads whose attempts have all reached a terminal state.
    ///
    /// A lead whose attempt reached an agent is `COMPLETED`; one out of attempts is
    /// `EXHAUSTED`; the rest return to `AVAILABLE` for a later retry.
    pub async fn recycle_finished_leads(&self, campaign_id: &str, max_attempts: u32) -> Result<u64> {
        let terminal = terminal_states_sql();
        let sql = format!(
            r#"
            UPDATE leads
            SET status = CASE
                    WHEN EXISTS (SELECT 1 FROM call_attempts a
                                 WHERE a.lead_id = leads.lead_id AND a.bridge_at IS NOT NULL)
                        THEN 'COMPLETED'
                    WHEN attempt_count >= ? THEN 'EXHAUSTED'
                    ELSE 'AVAILABLE'
                END,
                reserved_at_ms = NULL,
                reserved_by = NULL
            WHERE campaign_id = ? AND status = 'RESERVED'
              AND EXISTS (SELECT 1 FROM call_attempts a WHERE a.lead_id = leads.lead_id)
              AND NOT EXISTS (SELECT 1 FROM call_attempts a
                              WHERE a.lead_id = leads.lead_id AND a.state NOT IN ({terminal}))
            "#
        );

        let result = sqlx::query(&sql)
            .bind(max_attempts as i64)
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            debug!("Recycled {} leads for campaign {}", result.rows_affected(), campaign_id);
        }
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReservationPolicy {
        ReservationPolicy {
            max_attempts_per_lead: 2,
            retry_cooldown: Duration::from_secs(60),
            reserved_by: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_reserve_orders_by_priority_and_skips_ineligible() {
        let db = DialerDatabase::new_in_memory().await.unwrap();
        let mut high = NewLead::new("high", "camp", "acme", "+15550001");
        high.priority = 5;
        let low = NewLead::new("low", "camp", "acme", "+15550002");
        let mut dnc = NewLead::new("dnc", "camp", "acme", "+15550003");
        dnc.priority = 9;
        dnc.do_not_call = true;
        let mut no_consent = NewLead::new("nc", "camp", "acme", "+15550004");
        no_consent.consent = false;
        for lead in [&high, &low, &dnc, &no_consent] {
            db.insert_lead(lead).await.unwrap();
        }

        let reserved = db.reserve_leads("camp", "acme", 1, &policy(), Utc::now()).await.unwrap();
        assert_eq!(reserved.len(), 1);
        assert_eq!(reserved[0].lead_id, "high");
        assert_eq!(reserved[0].attempt_number, 1);

        let rest = db.reserve_leads("camp", "acme", 10, &policy(), Utc::now()).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].lead_id, "low");
    }

    #[tokio::test]
    async fn test_reserve_is_scoped_to_account() {
        let db = DialerDatabase::new_in_memory().await.unwrap();
        db.insert_lead(&NewLead::new("l1", "camp", "globex", "+15550001")).await.unwrap();
        let reserved = db.reserve_leads("camp", "acme", 5, &policy(), Utc::now()).await.unwrap();
        assert!(reserved.is_empty());
    }

    #[tokio::test]
    async fn test_released_lead_respects_cooldown() {
        let db = DialerDatabase::new_in_memory().await.unwrap();
        db.insert_lead(&NewLead::new("l1", "camp", "acme", "+15550001")).await.unwrap();
        let now = Utc::now();

        db.reserve_leads("camp", "acme", 1, &policy(), now).await.unwrap();
        db.release_lead("l1").await.unwrap();

        let lead = db.get_lead("l1").await.unwrap().unwrap();
        assert_eq!(lead.status, LeadStatus::Available);
        assert_eq!(lead.attempt_count, 0);

        // Released leads keep last_attempt_at, so the cooldown still applies.
        let again = db.reserve_leads("camp", "acme", 1, &policy(), now).await.unwrap();
        assert!(again.is_empty());
        let later = now + chrono::Duration::seconds(61);
        let again = db.reserve_leads("camp", "acme", 1, &policy(), later).await.unwrap();
        assert_eq!(again.len(), 1);
    }
}
