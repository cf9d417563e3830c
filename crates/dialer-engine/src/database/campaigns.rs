//! Campaign reads, plus the upsert used by administration tooling and tests.

use chrono::Utc;
use sqlx::Row;
use tracing::debug;

use super::{ts, DialerDatabase};
use crate::campaign::{Campaign, CampaignDialConfig, CampaignStatus};
use crate::error::{DialerError, Result};

fn campaign_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Campaign> {
    let status: String = row.try_get("status")?;
    let dial_config: String = row.try_get("dial_config")?;
    Ok(Campaign {
        campaign_id: row.try_get("campaign_id")?,
        account_id: row.try_get("account_id")?,
        name: row.try_get("name")?,
        status: CampaignStatus::from_str(&status)
            .ok_or_else(|| DialerError::database(format!("unknown campaign status {}", status)))?,
        dial_config: serde_json::from_str::<CampaignDialConfig>(&dial_config)?,
    })
}

impl DialerDatabase {
    /// Insert or replace a campaign definition
    pub async fn upsert_campaign(&self, campaign: &Campaign) -> Result<()> {
        campaign.dial_config.validate()?;
        let dial_config = serde_json::to_string(&campaign.dial_config)?;

        sqlx::query(
            r#"
            INSERT INTO campaigns (campaign_id, account_id, name, status, dial_config, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(campaign_id) DO UPDATE SET
                account_id = excluded.account_id,
                name = excluded.name,
                status = excluded.status,
                dial_config = excluded.dial_config,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&campaign.campaign_id)
        .bind(&campaign.account_id)
        .bind(&campaign.name)
        .bind(campaign.status.as_str())
        .bind(dial_config)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;

        debug!("Campaign {} stored ({})", campaign.campaign_id, campaign.status.as_str());
        Ok(())
    }

    pub async fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>> {
        let row = sqlx::query(
            "SELECT campaign_id, account_id, name, status, dial_config FROM campaigns WHERE campaign_id = ?",
        )
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(campaign_from_row).transpose()
    }

    /// Campaigns of `account_id` that the scheduler should tick
    pub async fn list_active_campaigns(&self, account_id: &str) -> Result<Vec<Campaign>> {
        let rows = sqlx::query(
            r#"
            SELECT campaign_id, account_id, name, status, dial_config
            FROM campaigns
            WHERE account_id = ? AND status = 'ACTIVE'
            ORDER BY campaign_id
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(campaign_from_row).collect()
    }

    pub async fn set_campaign_status(&self, campaign_id: &str, status: CampaignStatus) -> Result<()> {
        let result = sqlx::query("UPDATE campaigns SET status = ?, updated_at = ? WHERE campaign_id = ?")
            .bind(status.as_str())
            .bind(ts(Utc::now()))
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DialerError::not_found(format!("campaign {}", campaign_id)));
        }
        Ok(())
    }
}
