//! # Dial Metrics
//!
//! Counts are taken by event time: a call counts as dialed in the window its
//! origination was sent, as connected in the window it was answered, and as abandoned in
//! the window it ended abandoned. Consecutive windows do not overlap, so sums across
//! windows never count a call twice.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{from_ms, parse_timestamp, to_ms, ts, DialerDatabase};
use crate::error::Result;
use crate::pacing::DialMetricsWindow;

/// Raw per-window counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DialCounts {
    pub dialed: u32,
    pub ringing: u32,
    pub connected: u32,
    pub abandoned: u32,
    pub total_talk_secs: f64,
    pub talk_samples: u32,
}

impl DialCounts {
    pub fn answer_seizure_ratio(&self) -> f64 {
        ratio(self.connected, self.dialed)
    }

    pub fn abandon_rate(&self) -> f64 {
        ratio(self.abandoned, self.connected)
    }

    pub fn avg_talk_time_secs(&self) -> f64 {
        if self.talk_samples == 0 {
            0.0
        } else {
            self.total_talk_secs / self.talk_samples as f64
        }
    }
}

fn ratio(numerator: u32, denominator: u32) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn window_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DialMetricsWindow> {
    let count = |name: &str| -> Result<u32> {
        let value: i64 = row.try_get(name)?;
        Ok(value.max(0) as u32)
    };
    Ok(DialMetricsWindow {
        campaign_id: row.try_get("campaign_id")?,
        window_start: from_ms(row.try_get("window_start_ms")?),
        window_end: from_ms(row.try_get("window_end_ms")?),
        calls_dialed: count("calls_dialed")?,
        calls_ringing: count("calls_ringing")?,
        calls_connected: count("calls_connected")?,
        calls_abandoned: count("calls_abandoned")?,
        answer_seizure_ratio: row.try_get("answer_seizure_ratio")?,
        abandon_rate: row.try_get("abandon_rate")?,
        avg_talk_time_secs: row.try_get("avg_talk_time_secs")?,
        dial_ratio: row.try_get("dial_ratio")?,
        agents_available: count("agents_available")?,
    })
}

impl DialerDatabase {
    /// Count dial activity of a campaign in `[start, end)`
    pub async fn compute_dial_counts(
        &self,
        campaign_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DialCounts> {
        let (start, end) = (ts(start), ts(end));

        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN originate_at >= ?1 AND originate_at < ?2 THEN 1 ELSE 0 END), 0) AS dialed,
                COALESCE(SUM(CASE WHEN COALESCE(ring_at, early_media_at) >= ?1
                                   AND COALESCE(ring_at, early_media_at) < ?2 THEN 1 ELSE 0 END), 0) AS ringing,
                COALESCE(SUM(CASE WHEN answer_at >= ?1 AND answer_at < ?2 THEN 1 ELSE 0 END), 0) AS connected,
                COALESCE(SUM(CASE WHEN state = 'ABANDONED' AND end_at >= ?1 AND end_at < ?2
                                  THEN 1 ELSE 0 END), 0) AS abandoned
            FROM call_attempts
            WHERE campaign_id = ?3
            "#,
        )
        .bind(&start)
        .bind(&end)
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;

        let get = |name: &str| -> Result<u32> {
            let value: i64 = row.try_get(name)?;
            Ok(value.max(0) as u32)
        };
        let mut counts = DialCounts {
            dialed: get("dialed")?,
            ringing: get("ringing")?,
            connected: get("connected")?,
            abandoned: get("abandoned")?,
            ..Default::default()
        };

        let talks = sqlx::query(
            r#"
            SELECT bridge_at, end_at FROM call_attempts
            WHERE campaign_id = ? AND bridge_at IS NOT NULL AND end_at >= ? AND end_at < ?
            "#,
        )
        .bind(campaign_id)
        .bind(&start)
        .bind(&end)
        .fetch_all(&self.pool)
        .await?;

        for talk in talks {
            let bridged = parse_timestamp(talk.try_get("bridge_at")?);
            let ended = parse_timestamp(talk.try_get("end_at")?);
            if let (Some(bridged), Some(ended)) = (bridged, ended) {
                counts.total_talk_secs += (ended - bridged).num_milliseconds().max(0) as f64 / 1000.0;
                counts.talk_samples += 1;
            }
        }

        Ok(counts)
    }

    pub async fn append_dial_metrics(&self, window: &DialMetricsWindow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dial_metrics (campaign_id, window_start_ms, window_end_ms, calls_dialed,
                                      calls_ringing, calls_connected, calls_abandoned,
                                      answer_seizure_ratio, abandon_rate, avg_talk_time_secs,
                                      dial_ratio, agents_available)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&window.campaign_id)
        .bind(to_ms(window.window_start))
        .bind(to_ms(window.window_end))
        .bind(window.calls_dialed as i64)
        .bind(window.calls_ringing as i64)
        .bind(window.calls_connected as i64)
        .bind(window.calls_abandoned as i64)
        .bind(window.answer_seizure_ratio)
        .bind(window.abandon_rate)
        .bind(window.avg_talk_time_secs)
        .bind(window.dial_ratio)
        .bind(window.agents_available as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Windows of a campaign that ended after `since`, oldest first
    pub async fn get_recent_metrics(
        &self,
        campaign_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DialMetricsWindow>> {
        let rows = sqlx::query(
            r#"
            SELECT campaign_id, window_start_ms, window_end_ms, calls_dialed, calls_ringing,
                   calls_connected, calls_abandoned, answer_seizure_ratio, abandon_rate,
                   avg_talk_time_secs, dial_ratio, agents_available
            FROM dial_metrics
            WHERE campaign_id = ? AND window_end_ms > ?
            ORDER BY window_end_ms ASC, metrics_id ASC
            "#,
        )
        .bind(campaign_id)
        .bind(to_ms(since))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(window_from_row).collect()
    }

    /// End of the newest metrics window of a campaign
    pub async fn last_metrics_window_end(&self, campaign_id: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(window_end_ms) AS last_end FROM dial_metrics WHERE campaign_id = ?")
            .bind(campaign_id)
            .fetch_one(&self.pool)
            .await?;
        let last: Option<i64> = row.try_get("last_end")?;
        Ok(last.map(from_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_with_empty_denominators() {
        let counts = DialCounts::default();
        assert_eq!(counts.answer_seizure_ratio(), 0.0);
        assert_eq!(counts.abandon_rate(), 0.0);
        assert_eq!(counts.avg_talk_time_secs(), 0.0);
    }

    #[test]
    fn test_rates() {
        let counts = DialCounts {
            dialed: 10,
            connected: 4,
            abandoned: 1,
            total_talk_secs: 90.0,
            talk_samples: 3,
            ..Default::default()
        };
        assert!((counts.answer_seizure_ratio() - 0.4).abs() < 1e-9);
        assert!((counts.abandon_rate() - 0.25).abs() < 1e-9);
        assert!((counts.avg_talk_time_secs() - 30.0).abs() < 1e-9);
    }
}
