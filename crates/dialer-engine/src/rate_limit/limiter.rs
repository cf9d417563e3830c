//! # Trunk Rate Limiter
//!
//! Sliding-window admission control per trunk. The window is persisted, and each
//! decision runs as one write transaction opened by touching the trunk row, so the
//! evict / count / decide / record sequence is serialized per database, not per process.
//! Local callers additionally queue on a per-trunk async mutex so they do not spin on
//! SQLite's busy timeout.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use super::types::{Admission, TrunkHealth, TrunkLimit, TrunkLimitConfig, TrunkStatus};
use crate::config::RateLimiterConfig;
use crate::database::trunks::{
    evict_expired, insert_admission, load_trunk_limits, record_throttle_event, set_limit_usage,
    set_trunk_occupancy, touch_trunk, window_occupancy,
};
use crate::database::{to_ms, DialerDatabase};
use crate::error::{DialerError, Result};
use crate::monitoring::{DialerEvent, DialerEvents};

/// Per-trunk admission authority
#[derive(Clone)]
pub struct TrunkRateLimiter {
    db: DialerDatabase,
    config: RateLimiterConfig,
    events: DialerEvents,
    trunk_locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Last quality alert per trunk, so sustained overload alerts once per window
    last_alert: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl TrunkRateLimiter {
    pub fn new(db: DialerDatabase, config: RateLimiterConfig, events: DialerEvents) -> Self {
        Self {
            db,
            config,
            events,
            trunk_locks: Arc::new(DashMap::new()),
            last_alert: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn trunk_lock(&self, trunk_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.trunk_locks
            .entry(trunk_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Configure a trunk and replace its granular limits
    pub async fn set_limits(&self, trunk_id: &str, config: TrunkLimitConfig) -> Result<()> {
        config.validate()?;
        let lock = self.trunk_lock(trunk_id);
        let _guard = lock.lock().await;
        self.db
            .store_trunk_limits(trunk_id, &config, self.config.default_window_ms)
            .await?;
        info!(
            "Trunk {} limits set: max_cps={} burst={:?} granular={}",
            trunk_id,
            config.max_cps,
            config.burst_limit,
            config.limits.len()
        );
        Ok(())
    }

    pub async fn acquire(
        &self,
        trunk_id: &str,
        campaign_id: Option<&str>,
        destination: Option<&str>,
    ) -> Result<Admission> {
        self.acquire_at(trunk_id, campaign_id, destination, Utc::now()).await
    }

    /// Ask for one admission on `trunk_id` at `now`
    pub async fn acquire_at(
        &self,
        trunk_id: &str,
        campaign_id: Option<&str>,
        destination: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        let lock = self.trunk_lock(trunk_id);
        let _guard = lock.lock().await;

        let now_ms = to_ms(now);
        let mut tx = self.db.begin_transaction().await?;

        let trunk = touch_trunk(&mut tx, trunk_id, now_ms)
            .await?
            .ok_or_else(|| DialerError::not_found(format!("trunk {}", trunk_id)))?;
        let window_ms = trunk.window_ms as i64;
        let window_start = now_ms - window_ms;

        evict_expired(&mut tx, trunk_id, window_start).await?;
        let (occupancy, oldest) = window_occupancy(&mut tx, trunk_id, None, window_start).await?;

        let ceiling = trunk.burst_ceiling();
        if occupancy >= ceiling {
            let retry_after_ms = retry_after(oldest, window_ms, now_ms);
            set_trunk_occupancy(&mut tx, trunk_id, occupancy).await?;
            let denials = self
                .record_denial(&mut tx, trunk_id, None, occupancy, retry_after_ms, now_ms)
                .await?;
            tx.commit().await?;

            debug!(
                "Trunk {} throttled: occupancy {}/{} retry after {}ms",
                trunk_id, occupancy, ceiling, retry_after_ms
            );
            self.after_denial(trunk_id, None, occupancy, retry_after_ms, denials, trunk.max_cps, now);
            return Ok(Admission::Denied {
                retry_after_ms,
                limit_id: None,
                occupancy,
            });
        }

        let limits = load_trunk_limits(&mut tx, trunk_id).await?;
        let applicable = most_specific(&limits, campaign_id, destination);

        if let Some(limit) = applicable {
            let (usage, limit_oldest) =
                window_occupancy(&mut tx, trunk_id, Some(&limit.limit_id), window_start).await?;
            if usage >= limit.capacity() {
                let retry_after_ms = limit
                    .throttle_ms
                    .unwrap_or_else(|| retry_after(limit_oldest, window_ms, now_ms));
                set_limit_usage(&mut tx, &limit.limit_id, usage).await?;
                let denials = self
                    .record_denial(&mut tx, trunk_id, Some(&limit.limit_id), occupancy, retry_after_ms, now_ms)
                    .await?;
                tx.commit().await?;

                debug!(
                    "Trunk {} limit {} ({}) throttled: usage {}/{} retry after {}ms",
                    trunk_id,
                    limit.limit_id,
                    limit.scope.as_str(),
                    usage,
                    limit.capacity(),
                    retry_after_ms
                );
                self.after_denial(
                    trunk_id,
                    Some(&limit.limit_id),
                    occupancy,
                    retry_after_ms,
                    denials,
                    trunk.max_cps,
                    now,
                );
                return Ok(Admission::Denied {
                    retry_after_ms,
                    limit_id: Some(limit.limit_id.clone()),
                    occupancy,
                });
            }
            set_limit_usage(&mut tx, &limit.limit_id, usage + 1).await?;
        }

        let limit_id = applicable.map(|l| l.limit_id.clone());
        insert_admission(&mut tx, trunk_id, limit_id.as_deref(), campaign_id, destination, now_ms).await?;
        set_trunk_occupancy(&mut tx, trunk_id, occupancy + 1).await?;
        tx.commit().await?;

        let burst = occupancy >= trunk.max_cps;
        if burst {
            debug!("Trunk {} admitted on burst headroom ({}/{})", trunk_id, occupancy + 1, ceiling);
        }
        Ok(Admission::Allowed {
            limit_id,
            occupancy: occupancy + 1,
            burst,
        })
    }

    /// Give back the most recent slot's capacity by dropping the oldest admission
    pub async fn release(&self, trunk_id: &str) -> Result<bool> {
        let lock = self.trunk_lock(trunk_id);
        let _guard = lock.lock().await;
        let released = self.db.release_oldest_admission(trunk_id).await?;
        debug!("Trunk {} release (removed={})", trunk_id, released);
        Ok(released)
    }

    pub async fn status(&self, trunk_id: &str) -> Result<TrunkStatus> {
        self.status_at(trunk_id, Utc::now()).await
    }

    pub async fn status_at(&self, trunk_id: &str, now: DateTime<Utc>) -> Result<TrunkStatus> {
        let trunk = self
            .db
            .get_trunk(trunk_id)
            .await?
            .ok_or_else(|| DialerError::not_found(format!("trunk {}", trunk_id)))?;
        let window_start = to_ms(now) - trunk.window_ms as i64;
        let occupancy = self.db.count_window_admissions(trunk_id, None, window_start).await?;

        let mut limits = self.db.get_trunk_limits(trunk_id).await?;
        for limit in &mut limits {
            limit.current_usage = self
                .db
                .count_window_admissions(trunk_id, Some(&limit.limit_id), window_start)
                .await?;
        }

        let utilization = occupancy as f64 / trunk.max_cps.max(1) as f64;
        Ok(TrunkStatus {
            trunk_id: trunk_id.to_string(),
            occupancy,
            max_cps: trunk.max_cps,
            burst_limit: trunk.burst_ceiling(),
            window_ms: trunk.window_ms,
            utilization,
            health: TrunkHealth::from_utilization(utilization),
            limits,
        })
    }

    async fn record_denial(
        &self,
        conn: &mut sqlx::SqliteConnection,
        trunk_id: &str,
        limit_id: Option<&str>,
        occupancy: u32,
        retry_after_ms: u64,
        now_ms: i64,
    ) -> Result<u32> {
        let since_ms = now_ms - (self.config.alert_window_secs as i64) * 1000;
        record_throttle_event(conn, trunk_id, limit_id, occupancy, retry_after_ms, now_ms, since_ms).await
    }

    #[allow(clippy::too_many_arguments)]
    fn after_denial(
        &self,
        trunk_id: &str,
        limit_id: Option<&str>,
        occupancy: u32,
        retry_after_ms: u64,
        denials: u32,
        max_cps: u32,
        now: DateTime<Utc>,
    ) {
        self.events.publish(DialerEvent::TrunkThrottled {
            trunk_id: trunk_id.to_string(),
            limit_id: limit_id.map(str::to_string),
            occupancy,
            retry_after_ms,
        });

        if denials <= self.config.alert_threshold {
            return;
        }

        let window = chrono::Duration::seconds(self.config.alert_window_secs as i64);
        {
            let mut last_alert = self.last_alert.lock();
            if let Some(last) = last_alert.get(trunk_id) {
                if now - *last < window {
                    return;
                }
            }
            last_alert.insert(trunk_id.to_string(), now);
        }

        let health = TrunkHealth::from_utilization(occupancy as f64 / max_cps.max(1) as f64);
        error!(
            "Quality alert: trunk {} denied {} admissions in the last {}s",
            trunk_id, denials, self.config.alert_window_secs
        );
        self.events.publish(DialerEvent::QualityAlert {
            trunk_id: trunk_id.to_string(),
            denials,
            window_secs: self.config.alert_window_secs,
            health,
            at: now,
        });
    }
}

/// Time until the oldest admission leaves the window, at least 1ms
fn retry_after(oldest: Option<i64>, window_ms: i64, now_ms: i64) -> u64 {
    match oldest {
        Some(oldest) => (oldest + window_ms - now_ms).max(1) as u64,
        None => {
            warn!("Denied with an empty window; retrying after a full window");
            window_ms.max(1) as u64
        }
    }
}

/// The applicable limit ranked first by specificity
fn most_specific<'a>(
    limits: &'a [TrunkLimit],
    campaign_id: Option<&str>,
    destination: Option<&str>,
) -> Option<&'a TrunkLimit> {
    limits
        .iter()
        .filter_map(|limit| limit.specificity(campaign_id, destination).map(|rank| (rank, limit)))
        .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.limit_id.cmp(&b.1.limit_id)))
        .map(|(_, limit)| limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::LimitScope;

    async fn limiter() -> TrunkRateLimiter {
        let db = DialerDatabase::new_in_memory().await.unwrap();
        TrunkRateLimiter::new(db, RateLimiterConfig::default(), DialerEvents::default())
    }

    #[tokio::test]
    async fn test_unknown_trunk_is_not_found() {
        let limiter = limiter().await;
        let err = limiter.acquire("nope", None, None).await.unwrap_err();
        assert!(matches!(err, DialerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_burst_headroom_is_used_then_denied() {
        let limiter = limiter().await;
        limiter
            .set_limits("t1", TrunkLimitConfig::new(2).with_burst_limit(3))
            .await
            .unwrap();
        let now = Utc::now();

        let results: Vec<_> = {
            let mut out = Vec::new();
            for _ in 0..4 {
                out.push(limiter.acquire_at("t1", None, None, now).await.unwrap());
            }
            out
        };
        assert!(matches!(results[1], Admission::Allowed { burst: false, .. }));
        assert!(matches!(results[2], Admission::Allowed { burst: true, occupancy: 3, .. }));
        assert!(!results[3].is_allowed());
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = limiter().await;
        limiter.set_limits("t1", TrunkLimitConfig::new(1)).await.unwrap();
        let now = Utc::now();

        assert!(limiter.acquire_at("t1", None, None, now).await.unwrap().is_allowed());
        let denied = limiter
            .acquire_at("t1", None, None, now + chrono::Duration::milliseconds(400))
            .await
            .unwrap();
        assert_eq!(denied.retry_after_ms(), Some(600));
        assert!(limiter
            .acquire_at("t1", None, None, now + chrono::Duration::milliseconds(1000))
            .await
            .unwrap()
            .is_allowed());
    }

    #[tokio::test]
    async fn test_campaign_limit_uses_throttle_duration() {
        let limiter = limiter().await;
        let mut limit = TrunkLimit::new("camp-cap", LimitScope::Campaign, Some("camp"), 1);
        limit.throttle_ms = Some(5000);
        limiter
            .set_limits("t1", TrunkLimitConfig::new(10).with_limit(limit))
            .await
            .unwrap();
        let now = Utc::now();

        let first = limiter.acquire_at("t1", Some("camp"), None, now).await.unwrap();
        assert_eq!(
            first,
            Admission::Allowed {
                limit_id: Some("camp-cap".to_string()),
                occupancy: 1,
                burst: false
            }
        );
        let second = limiter.acquire_at("t1", Some("camp"), None, now).await.unwrap();
        assert_eq!(second.retry_after_ms(), Some(5000));

        // Other campaigns are unaffected by that limit
        assert!(limiter.acquire_at("t1", Some("other"), None, now).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_release_frees_a_slot() {
        let limiter = limiter().await;
        limiter.set_limits("t1", TrunkLimitConfig::new(1)).await.unwrap();
        let now = Utc::now();
        assert!(limiter.acquire_at("t1", None, None, now).await.unwrap().is_allowed());
        assert!(limiter.release("t1").await.unwrap());
        assert!(limiter.acquire_at("t1", None, None, now).await.unwrap().is_allowed());
    }
}
