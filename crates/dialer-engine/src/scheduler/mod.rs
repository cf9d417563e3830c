//! # Admission Scheduler
//!
//! The control loop of the dialer. Once per tick and per account, every `ACTIVE`
//! campaign is sampled (work hours, available agents, attempts in flight, pacing) and
//! turned into a number of calls to place. That many leads are reserved atomically and
//! each becomes a `QUEUED` [`CallAttempt`](crate::attempt::CallAttempt) with a pending
//! origination job for the dispatcher.
//!
//! Nothing that goes wrong with one campaign stops the tick: the problem is logged,
//! reported in the [`TickReport`] and retried on the next tick.

mod budget;

pub use budget::compute_budget;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::campaign::{Campaign, DialMode};
use crate::config::SchedulerConfig;
use crate::database::{DialerDatabase, NewAttempt, ReservationPolicy};
use crate::error::Result;
use crate::monitoring::{DialerEvent, DialerEvents};
use crate::pacing::{DialMetricsWindow, PacingCalculator, PacingSource, PacingTuning};

/// Why a campaign placed no calls this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    OutsideWorkHours,
    PreviewMode,
    NoAgentsAvailable,
    AtConcurrencyLimit,
    NoLeadsAvailable,
    ReservationFailed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::OutsideWorkHours => "outside work hours",
            SkipReason::PreviewMode => "preview mode",
            SkipReason::NoAgentsAvailable => "no agents available",
            SkipReason::AtConcurrencyLimit => "at concurrency limit",
            SkipReason::NoLeadsAvailable => "no leads available",
            SkipReason::ReservationFailed => "reservation failed",
        }
    }
}

/// Result of scheduling one campaign
#[derive(Debug, Clone, PartialEq)]
pub enum CampaignOutcome {
    Skipped {
        reason: SkipReason,
    },
    Scheduled {
        /// Calls the campaign was allowed to place
        budget: u32,
        /// Leads actually reserved; may be below `budget`
        reserved: u32,
        /// Attempts created from those leads
        created: u32,
        /// Reserved leads whose attempt could not be created; they were released
        failed: u32,
    },
    /// The campaign could not be evaluated; retried next tick
    Error {
        message: String,
    },
}

impl CampaignOutcome {
    pub fn created(&self) -> u32 {
        match self {
            CampaignOutcome::Scheduled { created, .. } => *created,
            _ => 0,
        }
    }
}

/// What one tick did for one account
#[derive(Debug, Clone)]
pub struct TickReport {
    pub account_id: String,
    pub at: DateTime<Utc>,
    pub outcomes: Vec<(String, CampaignOutcome)>,
}

impl TickReport {
    pub fn outcome(&self, campaign_id: &str) -> Option<&CampaignOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == campaign_id)
            .map(|(_, outcome)| outcome)
    }

    pub fn total_created(&self) -> u32 {
        self.outcomes.iter().map(|(_, o)| o.created()).sum()
    }
}

/// Runs scheduler ticks
#[derive(Clone)]
pub struct AdmissionScheduler {
    db: DialerDatabase,
    config: SchedulerConfig,
    pacing: PacingCalculator,
    events: DialerEvents,
    /// Recorded as `reserved_by` on leads
    instance_id: String,
}

impl AdmissionScheduler {
    pub fn new(
        db: DialerDatabase,
        config: SchedulerConfig,
        tuning: PacingTuning,
        instance_id: impl Into<String>,
        events: DialerEvents,
    ) -> Self {
        let pacing = PacingCalculator::new(tuning, config.min_pacing_samples);
        Self {
            db,
            config,
            pacing,
            events,
            instance_id: instance_id.into(),
        }
    }

    pub async fn run_tick(&self, account_id: &str) -> Result<TickReport> {
        self.run_tick_at(account_id, Utc::now()).await
    }

    /// Schedule every active campaign of `account_id` as of `now`.
    ///
    /// Only failing to list the campaigns is an error; per-campaign failures are
    /// reported as [`CampaignOutcome::Error`].
    pub async fn run_tick_at(&self, account_id: &str, now: DateTime<Utc>) -> Result<TickReport> {
        let campaigns = self.db.list_active_campaigns(account_id).await?;
        debug!("Scheduler tick for account {}: {} active campaigns", account_id, campaigns.len());

        let mut outcomes = Vec::with_capacity(campaigns.len());
        for campaign in campaigns {
            let outcome = match self.schedule_campaign(&campaign, now).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Failed to schedule campaign {}: {}", campaign.campaign_id, e);
                    CampaignOutcome::Error {
                        message: e.to_string(),
                    }
                }
            };
            outcomes.push((campaign.campaign_id, outcome));
        }

        Ok(TickReport {
            account_id: account_id.to_string(),
            at: now,
            outcomes,
        })
    }

    async fn schedule_campaign(&self, campaign: &Campaign, now: DateTime<Utc>) -> Result<CampaignOutcome> {
        let id = campaign.campaign_id.as_str();
        let config = &campaign.dial_config;

        let recycled = self
            .db
            .recycle_finished_leads(id, config.max_attempts_per_lead)
            .await?;
        if recycled > 0 {
            debug!("Campaign {}: recycled {} leads", id, recycled);
        }

        if !config.work_schedule.is_open_at(now) {
            return Ok(self.skip(id, SkipReason::OutsideWorkHours));
        }

        let agents = self.db.count_available_agents(id).await?;
        let dial_ratio = self.dial_ratio(campaign, now).await?;

        if let Err(e) = self.record_metrics(id, now, dial_ratio, agents).await {
            warn!("Campaign {}: failed to record dial metrics: {}", id, e);
        }

        if config.dial_mode == DialMode::Preview {
            return Ok(self.skip(id, SkipReason::PreviewMode));
        }
        if config.dial_mode.requires_agents() && agents == 0 {
            return Ok(self.skip(id, SkipReason::NoAgentsAvailable));
        }

        let active = self.db.count_active_attempts(id).await?;
        if active >= config.max_concurrent {
            return Ok(self.skip(id, SkipReason::AtConcurrencyLimit));
        }
        let free_slots = config.max_concurrent - active;

        let budget = compute_budget(config.dial_mode, agents, dial_ratio, free_slots)
            .min(self.config.max_reservations_per_tick);
        if budget == 0 {
            return Ok(self.skip(id, SkipReason::NoAgentsAvailable));
        }

        let policy = ReservationPolicy {
            max_attempts_per_lead: config.max_attempts_per_lead,
            retry_cooldown: std::time::Duration::from_secs(config.retry_cooldown_secs),
            reserved_by: self.instance_id.clone(),
        };
        let leads = match self
            .db
            .reserve_leads(id, &campaign.account_id, budget, &policy, now)
            .await
        {
            Ok(leads) => leads,
            Err(e) => {
                warn!("Campaign {}: lead reservation failed: {}", id, e);
                return Ok(self.skip(id, SkipReason::ReservationFailed));
            }
        };
        if leads.is_empty() {
            return Ok(self.skip(id, SkipReason::NoLeadsAvailable));
        }

        let reserved = leads.len() as u32;
        let mut created = 0;
        let mut failed = 0;
        for lead in leads {
            let new = NewAttempt {
                campaign_id: id.to_string(),
                account_id: campaign.account_id.clone(),
                lead_id: lead.lead_id.clone(),
                destination: lead.phone_number,
                attempt_number: lead.attempt_number,
                job_priority: config.job_priority,
            };
            match self.db.create_attempt_with_job(&new, now).await {
                Ok((_, true)) => created += 1,
                Ok((attempt, false)) => {
                    debug!("Campaign {}: attempt {} already existed", id, attempt.attempt_id);
                }
                Err(e) => {
                    failed += 1;
                    warn!("Campaign {}: failed to create attempt for lead {}: {}", id, lead.lead_id, e);
                    if let Err(e) = self.db.release_lead(&lead.lead_id).await {
                        error!("Campaign {}: failed to release lead {}: {}", id, lead.lead_id, e);
                    }
                }
            }
        }

        info!(
            "Campaign {} ({}): budget {} reserved {} created {} failed {} ratio {:.2}",
            id,
            config.dial_mode.as_str(),
            budget,
            reserved,
            created,
            failed,
            dial_ratio
        );
        self.events.publish(DialerEvent::CallsScheduled {
            campaign_id: id.to_string(),
            budget,
            created,
            dial_ratio,
        });

        Ok(CampaignOutcome::Scheduled {
            budget,
            reserved,
            created,
            failed,
        })
    }

    /// Dial ratio for this tick: adaptive in predictive mode, otherwise static
    async fn dial_ratio(&self, campaign: &Campaign, now: DateTime<Utc>) -> Result<f64> {
        let config = &campaign.dial_config;
        match config.dial_mode {
            DialMode::Preview | DialMode::Progressive => Ok(1.0),
            DialMode::Power => Ok(config.dial_ratio),
            DialMode::Predictive => {
                let lookback = chrono::Duration::seconds(self.config.pacing_lookback_secs as i64);
                let windows = self
                    .db
                    .get_recent_metrics(&campaign.campaign_id, now - lookback)
                    .await?;
                let decision = self.pacing.dial_ratio(config, &windows);
                if let PacingSource::Adaptive(method) = decision.source {
                    debug!(
                        "Campaign {}: {:?} pacing ratio {:.2} (asr {:.2}, abandon {:.3})",
                        campaign.campaign_id,
                        method,
                        decision.dial_ratio,
                        decision.answer_seizure_ratio,
                        decision.abandon_rate
                    );
                }
                Ok(decision.dial_ratio)
            }
        }
    }

    /// Close the current metrics bucket once it is complete
    async fn record_metrics(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
        dial_ratio: f64,
        agents: u32,
    ) -> Result<()> {
        let bucket = chrono::Duration::seconds(self.config.metrics_bucket_secs as i64);
        let start = match self.db.last_metrics_window_end(campaign_id).await? {
            Some(last_end) if now - last_end < bucket => return Ok(()),
            Some(last_end) => last_end,
            None => now - bucket,
        };

        let counts = self.db.compute_dial_counts(campaign_id, start, now).await?;
        let window = DialMetricsWindow::from_counts(campaign_id, start, now, &counts, dial_ratio, agents);
        self.db.append_dial_metrics(&window).await
    }

    fn skip(&self, campaign_id: &str, reason: SkipReason) -> CampaignOutcome {
        debug!("Campaign {} skipped: {}", campaign_id, reason.as_str());
        self.events.publish(DialerEvent::CampaignSkipped {
            campaign_id: campaign_id.to_string(),
            reason,
        });
        CampaignOutcome::Skipped { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::{CampaignDialConfig, CampaignStatus};
    use crate::database::{AgentStatus, DbAgent, NewLead};

    async fn scheduler() -> AdmissionScheduler {
        let db = DialerDatabase::new_in_memory().await.unwrap();
        AdmissionScheduler::new(
            db,
            SchedulerConfig::default(),
            PacingTuning::default(),
            "test-instance",
            DialerEvents::default(),
        )
    }

    async fn seed(db: &DialerDatabase, mode: DialMode, agents: usize, leads: usize) {
        let campaign = Campaign {
            campaign_id: "camp".to_string(),
            account_id: "acme".to_string(),
            name: "Camp".to_string(),
            status: CampaignStatus::Active,
            dial_config: CampaignDialConfig {
                dial_mode: mode,
                dial_ratio: 2.0,
                max_concurrent: 20,
                ..Default::default()
            },
        };
        db.upsert_campaign(&campaign).await.unwrap();
        for i in 0..agents {
            let mut agent = DbAgent::new(&format!("agent-{}", i), "acme", "camp");
            agent.status = AgentStatus::Available;
            db.upsert_agent(&agent).await.unwrap();
        }
        for i in 0..leads {
            db.insert_lead(&NewLead::new(&format!("lead-{}", i), "camp", "acme", &format!("+1555010{:04}", i)))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_preview_places_nothing() {
        let scheduler = scheduler().await;
        seed(&scheduler.db, DialMode::Preview, 3, 10).await;
        let report = scheduler.run_tick("acme").await.unwrap();
        assert_eq!(
            report.outcome("camp"),
            Some(&CampaignOutcome::Skipped {
                reason: SkipReason::PreviewMode
            })
        );
    }

    #[tokio::test]
    async fn test_no_agents_skips() {
        let scheduler = scheduler().await;
        seed(&scheduler.db, DialMode::Power, 0, 10).await;
        let report = scheduler.run_tick("acme").await.unwrap();
        assert_eq!(
            report.outcome("camp"),
            Some(&CampaignOutcome::Skipped {
                reason: SkipReason::NoAgentsAvailable
            })
        );
    }

    #[tokio::test]
    async fn test_reservation_is_short_of_budget() {
        let scheduler = scheduler().await;
        seed(&scheduler.db, DialMode::Power, 5, 4).await;
        let report = scheduler.run_tick("acme").await.unwrap();
        assert_eq!(
            report.outcome("camp"),
            Some(&CampaignOutcome::Scheduled {
                budget: 10,
                reserved: 4,
                created: 4,
                failed: 0
            })
        );

        let again = scheduler.run_tick("acme").await.unwrap();
        assert_eq!(
            again.outcome("camp"),
            Some(&CampaignOutcome::Skipped {
                reason: SkipReason::NoLeadsAvailable
            })
        );
    }

    #[tokio::test]
    async fn test_paused_campaign_is_not_ticked() {
        let scheduler = scheduler().await;
        seed(&scheduler.db, DialMode::Progressive, 2, 10).await;
        scheduler
            .db
            .set_campaign_status("camp", CampaignStatus::Paused)
            .await
            .unwrap();
        let report = scheduler.run_tick("acme").await.unwrap();
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let scheduler = scheduler().await;
        seed(&scheduler.db, DialMode::Power, 20, 40).await;
        let first = scheduler.run_tick("acme").await.unwrap();
        assert_eq!(first.total_created(), 20);
        let second = scheduler.run_tick("acme").await.unwrap();
        assert_eq!(
            second.outcome("camp"),
            Some(&CampaignOutcome::Skipped {
                reason: SkipReason::AtConcurrencyLimit
            })
        );
    }
}
