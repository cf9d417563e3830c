//! # Agent Availability
//!
//! Agent presence is maintained by the agent desktop integration; the dialer only reads
//! it to size each tick's budget. The write operations exist for that integration and
//! for tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::debug;

use super::{parse_timestamp, ts, DialerDatabase};
use crate::error::{DialerError, Result};

/// Agent status as stored in the `agents` table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Offline,
    Available,
    Busy,
    PostCallWrapUp,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Offline => "OFFLINE",
            AgentStatus::Available => "AVAILABLE",
            AgentStatus::Busy => "BUSY",
            AgentStatus::PostCallWrapUp => "POSTCALLWRAPUP",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "OFFLINE" => Some(AgentStatus::Offline),
            "AVAILABLE" => Some(AgentStatus::Available),
            "BUSY" => Some(AgentStatus::Busy),
            "POSTCALLWRAPUP" => Some(AgentStatus::PostCallWrapUp),
            _ => None,
        }
    }
}

/// Agent record from database
#[derive(Debug, Clone)]
pub struct DbAgent {
    pub agent_id: String,
    pub account_id: String,
    pub campaign_id: Option<String>,
    pub username: String,
    pub status: AgentStatus,
    pub current_calls: i32,
    pub max_calls: i32,
    pub available_since: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl DbAgent {
    pub fn new(agent_id: &str, account_id: &str, campaign_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            account_id: account_id.to_string(),
            campaign_id: Some(campaign_id.to_string()),
            username: agent_id.to_string(),
            status: AgentStatus::Offline,
            current_calls: 0,
            max_calls: 1,
            available_since: None,
            last_heartbeat: None,
        }
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self> {
        let status: String = row.try_get("status")?;
        Ok(DbAgent {
            agent_id: row.try_get("agent_id")?,
            account_id: row.try_get("account_id")?,
            campaign_id: row.try_get("campaign_id")?,
            username: row.try_get("username")?,
            status: AgentStatus::from_str(&status)
                .ok_or_else(|| DialerError::database(format!("unknown agent status {}", status)))?,
            current_calls: row.try_get("current_calls")?,
            max_calls: row.try_get("max_calls")?,
            available_since: parse_timestamp(row.try_get("available_since")?),
            last_heartbeat: parse_timestamp(row.try_get("last_heartbeat")?),
        })
    }
}

impl DialerDatabase {
    pub async fn upsert_agent(&self, agent: &DbAgent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (agent_id, account_id, campaign_id, username, status,
                                current_calls, max_calls, available_since, last_heartbeat)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(agent_id) DO UPDATE SET
                account_id = excluded.account_id,
                campaign_id = excluded.campaign_id,
                username = excluded.username,
                status = excluded.status,
                current_calls = excluded.current_calls,
                max_calls = excluded.max_calls,
                available_since = excluded.available_since,
                last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(&agent.agent_id)
        .bind(&agent.account_id)
        .bind(&agent.campaign_id)
        .bind(&agent.username)
        .bind(agent.status.as_str())
        .bind(agent.current_calls)
        .bind(agent.max_calls)
        .bind(agent.available_since.map(ts))
        .bind(agent.last_heartbeat.map(ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update agent status; becoming available stamps `available_since`
    pub async fn update_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let available_since = matches!(status, AgentStatus::Available).then(|| ts(Utc::now()));

        let result = sqlx::query(
            "UPDATE agents SET status = ?, available_since = ?, last_heartbeat = ? WHERE agent_id = ?",
        )
        .bind(status.as_str())
        .bind(available_since)
        .bind(ts(Utc::now()))
        .bind(agent_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DialerError::not_found(format!("agent {}", agent_id)));
        }
        debug!("Agent {} status updated to {}", agent_id, status.as_str());
        Ok(())
    }

    /// Agents of a campaign that can take another call, longest-idle first
    pub async fn get_available_agents(&self, campaign_id: &str) -> Result<Vec<DbAgent>> {
        let rows = sqlx::query(
            r#"
            SELECT agent_id, account_id, campaign_id, username, status, current_calls, max_calls,
                   available_since, last_heartbeat
            FROM agents
            WHERE campaign_id = ? AND status = 'AVAILABLE' AND current_calls < max_calls
            ORDER BY available_since ASC
            "#,
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(DbAgent::from_row).collect()
    }

    pub async fn count_available_agents(&self, campaign_id: &str) -> Result<u32> {
        let count: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS available
            FROM agents
            WHERE campaign_id = ? AND status = 'AVAILABLE' AND current_calls < max_calls
            "#,
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?
        .try_get("available")?;

        Ok(count.max(0) as u32)
    }

    /// Adjust an agent's call count, never below zero
    pub async fn update_agent_call_count(&self, agent_id: &str, delta: i32) -> Result<()> {
        sqlx::query("UPDATE agents SET current_calls = MAX(0, current_calls + ?) WHERE agent_id = ?")
            .bind(delta)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_available_agent_count_respects_capacity() {
        let db = DialerDatabase::new_in_memory().await.unwrap();
        for id in ["a1", "a2", "a3"] {
            db.upsert_agent(&DbAgent::new(id, "acme", "camp")).await.unwrap();
            db.update_agent_status(id, AgentStatus::Available).await.unwrap();
        }
        db.update_agent_status("a3", AgentStatus::PostCallWrapUp).await.unwrap();
        db.update_agent_call_count("a2", 1).await.unwrap();

        assert_eq!(db.count_available_agents("camp").await.unwrap(), 1);
        let agents = db.get_available_agents("camp").await.unwrap();
        assert_eq!(agents[0].agent_id, "a1");
        assert!(agents[0].available_since.is_some());
    }

    #[tokio::test]
    async fn test_unknown_agent_is_not_found() {
        let db = DialerDatabase::new_in_memory().await.unwrap();
        let err = db.update_agent_status("ghost", AgentStatus::Busy).await.unwrap_err();
        assert!(matches!(err, DialerError::NotFound(_)));
    }
}
