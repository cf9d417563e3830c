//! # Campaign Dial Configuration
//!
//! Campaigns are created and edited by campaign administration, outside the engine. The
//! engine reads a campaign's [`CampaignDialConfig`] every tick and never writes it, so a
//! change made between ticks takes effect on the next one.

use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Offset, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::attempt::TimerKind;
use crate::config::TimerConfig;
use crate::error::{DialerError, Result};

/// Longest wait any attempt timer may be armed for
pub const MAX_TIMER_SECS: u64 = 7 * 24 * 3600;

/// How a campaign decides how many calls to place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DialMode {
    /// Agents pick and dial leads themselves; the scheduler places nothing
    Preview,
    /// One call per available agent
    Progressive,
    /// A fixed number of calls per available agent (`dial_ratio`)
    Power,
    /// Calls per agent adapted from live answer/abandon metrics
    Predictive,
}

impl DialMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialMode::Preview => "PREVIEW",
            DialMode::Progressive => "PROGRESSIVE",
            DialMode::Power => "POWER",
            DialMode::Predictive => "PREDICTIVE",
        }
    }

    /// Whether the scheduler needs at least one available agent to place calls
    pub fn requires_agents(&self) -> bool {
        !matches!(self, DialMode::Preview)
    }
}

/// Adaptive method used by the pacing calculator in predictive mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacingMethod {
    HardLimit,
    Tapered,
    Average,
}

/// Lifecycle status set by campaign administration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Active,
    Paused,
    Stopped,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Active => "ACTIVE",
            CampaignStatus::Paused => "PAUSED",
            CampaignStatus::Stopped => "STOPPED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(CampaignStatus::Active),
            "PAUSED" => Some(CampaignStatus::Paused),
            "STOPPED" => Some(CampaignStatus::Stopped),
            _ => None,
        }
    }
}

/// Days and local hours during which a campaign may dial
///
/// `start == end` means the whole day. A window whose end is earlier than its start
/// runs overnight; the day check applies to the day the window opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSchedule {
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Campaign-local offset from UTC, in minutes
    pub utc_offset_minutes: i32,
}

impl Default for WorkSchedule {
    fn default() -> Self {
        Self {
            days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            start: NaiveTime::MIN,
            end: NaiveTime::MIN,
            utc_offset_minutes: 0,
        }
    }
}

impl WorkSchedule {
    /// Whether dialing is permitted at `now`
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::{NaiveTime, TimeZone, Utc, Weekday};
    /// use rvoip_dialer_engine::campaign::WorkSchedule;
    ///
    /// let schedule = WorkSchedule {
    ///     days: vec![Weekday::Mon],
    ///     start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
    ///     end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
    ///     utc_offset_minutes: 0,
    /// };
    /// // 2024-01-01 was a Monday
    /// assert!(schedule.is_open_at(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()));
    /// assert!(!schedule.is_open_at(Utc.with_ymd_and_hms(2024, 1, 1, 18, 0, 0).unwrap()));
    /// ```
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        let offset = FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        let local = now.with_timezone(&offset);
        let time = local.time();

        if self.start == self.end {
            return self.days.contains(&local.weekday());
        }

        if self.start < self.end {
            self.days.contains(&local.weekday()) && time >= self.start && time < self.end
        } else if time >= self.start {
            self.days.contains(&local.weekday())
        } else if time < self.end {
            // Early-morning tail of a window that opened the previous day
            self.days.contains(&local.weekday().pred())
        } else {
            false
        }
    }
}

/// Per-campaign dialing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignDialConfig {
    pub dial_mode: DialMode,

    /// Calls per available agent in power mode, and the fallback ratio for predictive
    /// mode until enough metrics have accumulated
    pub dial_ratio: f64,

    /// Ceiling on the adaptive ratio in predictive mode
    pub max_adapt_dial_level: f64,

    /// Abandon rate the predictive controller steers towards (0.03 = 3%)
    pub target_abandon_rate: f64,

    pub pacing_method: PacingMethod,

    /// Maximum non-terminal attempts at any moment
    pub max_concurrent: u32,

    /// Attempts allowed per lead before it is no longer eligible
    pub max_attempts_per_lead: u32,

    /// Minimum time between two attempts on the same lead
    pub retry_cooldown_secs: u64,

    pub work_schedule: WorkSchedule,

    pub ring_timeout_secs: Option<u64>,
    pub amd_timeout_secs: Option<u64>,
    pub agent_assign_timeout_secs: Option<u64>,
    pub max_call_duration_secs: Option<u64>,

    /// Trunk used when the route provider has no better choice
    pub trunk_id: Option<String>,

    /// Priority given to this campaign's origination jobs
    pub job_priority: i32,
}

impl Default for CampaignDialConfig {
    fn default() -> Self {
        Self {
            dial_mode: DialMode::Progressive,
            dial_ratio: 1.0,
            max_adapt_dial_level: 3.0,
            target_abandon_rate: 0.03,
            pacing_method: PacingMethod::HardLimit,
            max_concurrent: 10,
            max_attempts_per_lead: 3,
            retry_cooldown_secs: 3600,
            work_schedule: WorkSchedule::default(),
            ring_timeout_secs: None,
            amd_timeout_secs: None,
            agent_assign_timeout_secs: None,
            max_call_duration_secs: None,
            trunk_id: None,
            job_priority: 0,
        }
    }
}

impl CampaignDialConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.dial_ratio > 0.0) {
            return Err(DialerError::invalid_input("dial_ratio must be positive"));
        }
        if !(self.max_adapt_dial_level >= 1.0) {
            return Err(DialerError::invalid_input("max_adapt_dial_level must be >= 1.0"));
        }
        if !(self.target_abandon_rate > 0.0 && self.target_abandon_rate < 1.0) {
            return Err(DialerError::invalid_input(
                "target_abandon_rate must be between 0 and 1",
            ));
        }
        if self.max_concurrent == 0 {
            return Err(DialerError::invalid_input("max_concurrent must be > 0"));
        }
        if self.max_attempts_per_lead == 0 {
            return Err(DialerError::invalid_input("max_attempts_per_lead must be > 0"));
        }
        let timeouts = [
            ("ring_timeout_secs", self.ring_timeout_secs),
            ("amd_timeout_secs", self.amd_timeout_secs),
            ("agent_assign_timeout_secs", self.agent_assign_timeout_secs),
            ("max_call_duration_secs", self.max_call_duration_secs),
        ];
        for (name, secs) in timeouts {
            if let Some(secs) = secs {
                if secs == 0 || secs > MAX_TIMER_SECS {
                    return Err(DialerError::invalid_input(format!(
                        "{} must be between 1 and {}",
                        name, MAX_TIMER_SECS
                    )));
                }
            }
        }
        Ok(())
    }

    /// Duration of a timer for this campaign, falling back to the engine defaults.
    ///
    /// Never longer than [`MAX_TIMER_SECS`], even for configs stored without validation.
    pub fn timer_duration(&self, kind: TimerKind, defaults: &TimerConfig) -> Duration {
        let secs = match kind {
            TimerKind::RingTimeout => self.ring_timeout_secs.unwrap_or(defaults.ring_timeout_secs),
            TimerKind::AmdTimeout => self.amd_timeout_secs.unwrap_or(defaults.amd_timeout_secs),
            TimerKind::AgentAssignTimeout => self
                .agent_assign_timeout_secs
                .unwrap_or(defaults.agent_assign_timeout_secs),
            TimerKind::MaxDuration => self
                .max_call_duration_secs
                .unwrap_or(defaults.max_call_duration_secs),
            TimerKind::HangupGuard => defaults.hangup_guard_secs,
        };
        Duration::from_secs(secs.min(MAX_TIMER_SECS))
    }
}

/// A campaign as the engine sees it
#[derive(Debug, Clone, PartialEq)]
pub struct Campaign {
    pub campaign_id: String,
    pub account_id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub dial_config: CampaignDialConfig,
}
