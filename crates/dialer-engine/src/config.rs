//! # Dialer Engine Configuration
//!
//! [`DialerConfig`] groups the settings of every subsystem. Each section implements
//! `Default` with production-sensible values and is `#[serde(default)]`, so a TOML file
//! only needs the keys it wants to override:
//!
//! ```toml
//! [general]
//! instance_id = "dialer-east-1"
//! accounts = ["acme"]
//!
//! [scheduler]
//! tick_interval_ms = 2000
//!
//! [pacing]
//! hard_limit_factor = 0.6
//! ```
//!
//! Per-campaign knobs (dial mode, ratios, timeouts) are not here; they belong to
//! [`CampaignDialConfig`](crate::campaign::CampaignDialConfig), which campaign
//! administration owns.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::campaign::MAX_TIMER_SECS;
use crate::error::{DialerError, Result};
use crate::logging::LoggingConfig;
use crate::pacing::PacingTuning;

/// Complete dialer engine configuration
///
/// # Examples
///
/// ```
/// use rvoip_dialer_engine::config::DialerConfig;
///
/// let config = DialerConfig::default();
/// assert_eq!(config.scheduler.tick_interval_ms, 3000);
/// config.validate().expect("defaults are valid");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Instance identity and served accounts
    pub general: GeneralConfig,

    /// Admission scheduler control loop
    pub scheduler: SchedulerConfig,

    /// Origination job dispatcher
    pub dispatcher: DispatcherConfig,

    /// Attempt timer defaults and timer firing loop
    pub timers: TimerConfig,

    /// Trunk rate limiter defaults and overload alerting
    pub rate_limiter: RateLimiterConfig,

    /// Feedback-controller tuning constants for predictive pacing
    pub pacing: PacingTuning,

    /// Persistent store
    pub database: DatabaseConfig,

    /// Tracing subscriber setup
    pub logging: LoggingConfig,
}

/// Instance-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Identifier written into `reserved_by` when this instance reserves leads
    pub instance_id: String,

    /// Accounts whose campaigns this instance schedules
    pub accounts: Vec<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("dialer-{}", uuid::Uuid::new_v4()),
            accounts: Vec::new(),
        }
    }
}

/// Admission scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between control-loop ticks, per account
    pub tick_interval_ms: u64,

    /// Width of the bucket summarised into each `DialMetricsWindow`
    pub metrics_bucket_secs: u64,

    /// How far back the pacing calculator looks at metrics windows
    pub pacing_lookback_secs: u64,

    /// Dialed calls required across the lookback before adaptive pacing kicks in;
    /// below this the campaign's static dial ratio is used
    pub min_pacing_samples: u32,

    /// Upper bound on leads reserved for one campaign in a single tick
    pub max_reservations_per_tick: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 3000,
            metrics_bucket_secs: 60,
            pacing_lookback_secs: 900,
            min_pacing_samples: 20,
            max_reservations_per_tick: 200,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn metrics_bucket(&self) -> Duration {
        Duration::from_secs(self.metrics_bucket_secs)
    }

    pub fn pacing_lookback(&self) -> Duration {
        Duration::from_secs(self.pacing_lookback_secs)
    }
}

/// Origination dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Interval between dispatcher polls for due jobs
    pub poll_interval_ms: u64,

    /// Maximum jobs claimed per poll
    pub batch_size: u32,

    /// Rate-limiter denials tolerated before the attempt is failed
    pub max_rate_limit_retries: u32,

    /// Back-off used when a retry hint is unavailable (route or store errors)
    pub default_retry_after_ms: u64,

    /// How long a claimed job may stay IN_FLIGHT before another poll may reclaim it
    pub claim_lease_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            batch_size: 50,
            max_rate_limit_retries: 5,
            default_retry_after_ms: 1000,
            claim_lease_ms: 30_000,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_millis(self.claim_lease_ms)
    }
}

/// Attempt timer defaults
///
/// These apply when the campaign's dial config leaves the matching timeout unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Interval between scans for due timers
    pub poll_interval_ms: u64,

    /// Maximum timers fired per scan
    pub batch_size: u32,

    pub ring_timeout_secs: u64,
    pub amd_timeout_secs: u64,
    pub agent_assign_timeout_secs: u64,
    pub max_call_duration_secs: u64,

    /// Wait in ENDING or NO_RTP for the far end's BYE before forcing the call to ENDED
    pub hangup_guard_secs: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            batch_size: 200,
            ring_timeout_secs: 30,
            amd_timeout_secs: 5,
            agent_assign_timeout_secs: 3,
            max_call_duration_secs: 3600,
            hangup_guard_secs: 30,
        }
    }
}

impl TimerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Trunk rate limiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Sliding window used when a trunk is configured without one
    pub default_window_ms: u64,

    /// Rolling period over which throttle denials are counted for alerting
    pub alert_window_secs: u64,

    /// Denials within `alert_window_secs` that constitute sustained overload
    pub alert_threshold: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_window_ms: 1000,
            alert_window_secs: 60,
            alert_threshold: 50,
        }
    }
}

impl RateLimiterConfig {
    pub fn alert_window(&self) -> Duration {
        Duration::from_secs(self.alert_window_secs)
    }
}

/// Database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite:///var/lib/dialer/dialer.db` or `sqlite::memory:`
    pub url: String,

    /// Pool size for file-backed databases; in-memory databases always use one connection
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 5,
        }
    }
}

impl DialerConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DialerError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(DialerError::configuration("scheduler.tick_interval_ms must be > 0"));
        }
        if self.scheduler.metrics_bucket_secs == 0 {
            return Err(DialerError::configuration("scheduler.metrics_bucket_secs must be > 0"));
        }
        if self.scheduler.pacing_lookback_secs < self.scheduler.metrics_bucket_secs {
            return Err(DialerError::configuration(
                "scheduler.pacing_lookback_secs must cover at least one metrics bucket",
            ));
        }
        if self.dispatcher.poll_interval_ms == 0 || self.dispatcher.batch_size == 0 {
            return Err(DialerError::configuration(
                "dispatcher.poll_interval_ms and dispatcher.batch_size must be > 0",
            ));
        }
        if self.timers.poll_interval_ms == 0 || self.timers.batch_size == 0 {
            return Err(DialerError::configuration(
                "timers.poll_interval_ms and timers.batch_size must be > 0",
            ));
        }
        let timer_defaults = [
            ("timers.ring_timeout_secs", self.timers.ring_timeout_secs),
            ("timers.amd_timeout_secs", self.timers.amd_timeout_secs),
            ("timers.agent_assign_timeout_secs", self.timers.agent_assign_timeout_secs),
            ("timers.max_call_duration_secs", self.timers.max_call_duration_secs),
            ("timers.hangup_guard_secs", self.timers.hangup_guard_secs),
        ];
        for (name, secs) in timer_defaults {
            if secs == 0 || secs > MAX_TIMER_SECS {
                return Err(DialerError::configuration(format!(
                    "{} must be between 1 and {}",
                    name, MAX_TIMER_SECS
                )));
            }
        }
        if self.dispatcher.claim_lease_ms == 0 {
            return Err(DialerError::configuration("dispatcher.claim_lease_ms must be > 0"));
        }
        if self.rate_limiter.default_window_ms == 0 {
            return Err(DialerError::configuration("rate_limiter.default_window_ms must be > 0"));
        }
        if self.database.max_connections == 0 {
            return Err(DialerError::configuration("database.max_connections must be > 0"));
        }
        self.logging.validate()?;
        self.pacing.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        DialerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DialerConfig::from_toml_str(
            r#"
            [general]
            instance_id = "dialer-test"
            accounts = ["acme", "globex"]

            [dispatcher]
            max_rate_limit_retries = 2

            [pacing]
            hard_limit_factor = 0.6
            "#,
        )
        .unwrap();

        assert_eq!(config.general.instance_id, "dialer-test");
        assert_eq!(config.general.accounts.len(), 2);
        assert_eq!(config.dispatcher.max_rate_limit_retries, 2);
        assert_eq!(config.dispatcher.batch_size, 50);
        assert!((config.pacing.hard_limit_factor - 0.6).abs() < f64::EPSILON);
        assert!((config.pacing.average_over_target_factor - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_tick_interval_rejected() {
        let result = DialerConfig::from_toml_str("[scheduler]\ntick_interval_ms = 0\n");
        assert!(matches!(result, Err(DialerError::Configuration(_))));
    }

    #[test]
    fn test_out_of_range_timer_default_rejected() {
        let result = DialerConfig::from_toml_str("[timers]\nhangup_guard_secs = 0\n");
        assert!(matches!(result, Err(DialerError::Configuration(_))));

        let mut config = DialerConfig::default();
        config.timers.ring_timeout_secs = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let result = DialerConfig::from_toml_str("[logging]\nlevel = \"shouting\"\n");
        assert!(matches!(result, Err(DialerError::Configuration(_))));
    }

    #[test]
    fn test_invalid_pacing_factor_rejected() {
        let mut config = DialerConfig::default();
        config.pacing.tapered_max_growth_factor = 0.8;
        assert!(config.validate().is_err());
    }
}
