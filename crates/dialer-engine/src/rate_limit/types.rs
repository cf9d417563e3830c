use serde::{Deserialize, Serialize};

use crate::error::{DialerError, Result};

/// Scope of a granular trunk limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitScope {
    /// Applies to every call on the trunk
    Trunk,
    /// Calls placed for one campaign
    Campaign,
    /// Calls to one exact destination number
    Destination,
    /// Calls whose destination matches a digit prefix such as `212` or `1212*`
    AreaCode,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitScope::Trunk => "TRUNK",
            LimitScope::Campaign => "CAMPAIGN",
            LimitScope::Destination => "DESTINATION",
            LimitScope::AreaCode => "AREA_CODE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "TRUNK" => Some(LimitScope::Trunk),
            "CAMPAIGN" => Some(LimitScope::Campaign),
            "DESTINATION" => Some(LimitScope::Destination),
            "AREA_CODE" => Some(LimitScope::AreaCode),
            _ => None,
        }
    }
}

/// A granular sub-limit of a trunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrunkLimit {
    pub limit_id: String,
    pub scope: LimitScope,
    /// Campaign id, destination number or area-code pattern; unused for `Trunk`
    pub scope_value: Option<String>,
    pub max_cps: u32,
    #[serde(default)]
    pub burst_allowance: u32,
    /// Fixed back-off returned when this limit denies; otherwise the time until its
    /// oldest admission leaves the window
    #[serde(default)]
    pub throttle_ms: Option<u64>,
    /// Admissions charged to this limit in the current window, as of the last decision
    #[serde(default)]
    pub current_usage: u32,
}

impl TrunkLimit {
    pub fn new(limit_id: &str, scope: LimitScope, scope_value: Option<&str>, max_cps: u32) -> Self {
        Self {
            limit_id: limit_id.to_string(),
            scope,
            scope_value: scope_value.map(str::to_string),
            max_cps,
            burst_allowance: 0,
            throttle_ms: None,
            current_usage: 0,
        }
    }

    /// Admissions this limit allows per window
    pub fn capacity(&self) -> u32 {
        self.max_cps.saturating_add(self.burst_allowance)
    }

    /// How specifically this limit applies to a call; `None` when it does not apply.
    /// Lower sorts first.
    pub(crate) fn specificity(&self, campaign_id: Option<&str>, destination: Option<&str>) -> Option<(u8, usize)> {
        match self.scope {
            LimitScope::Destination => {
                let wanted = digits(self.scope_value.as_deref()?);
                let dest = digits(destination?);
                (!wanted.is_empty() && wanted == dest).then_some((0, 0))
            }
            LimitScope::AreaCode => {
                let pattern = digits(self.scope_value.as_deref()?.trim_end_matches('*'));
                let dest = digits(destination?);
                if pattern.is_empty() {
                    return None;
                }
                let national = dest.strip_prefix('1').unwrap_or(&dest);
                let matched = dest.starts_with(&pattern) || national.starts_with(&pattern);
                // Longer patterns are more specific
                matched.then_some((1, usize::MAX - pattern.len()))
            }
            LimitScope::Campaign => {
                let wanted = self.scope_value.as_deref()?;
                (Some(wanted) == campaign_id).then_some((2, 0))
            }
            LimitScope::Trunk => Some((3, 0)),
        }
    }
}

fn digits(number: &str) -> String {
    number.chars().filter(char::is_ascii_digit).collect()
}

/// Complete admission configuration of one trunk, as given to `set_limits`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrunkLimitConfig {
    /// Steady-state admissions per window
    pub max_cps: u32,
    /// Absolute ceiling per window including burst headroom; defaults to `max_cps`
    #[serde(default)]
    pub burst_limit: Option<u32>,
    /// Sliding window size; defaults to the limiter's configured window
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub limits: Vec<TrunkLimit>,
}

impl TrunkLimitConfig {
    pub fn new(max_cps: u32) -> Self {
        Self {
            max_cps,
            burst_limit: None,
            window_ms: None,
            limits: Vec::new(),
        }
    }

    pub fn with_burst_limit(mut self, burst_limit: u32) -> Self {
        self.burst_limit = Some(burst_limit);
        self
    }

    pub fn with_limit(mut self, limit: TrunkLimit) -> Self {
        self.limits.push(limit);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_cps == 0 {
            return Err(DialerError::invalid_input("trunk max_cps must be > 0"));
        }
        if let Some(burst) = self.burst_limit {
            if burst < self.max_cps {
                return Err(DialerError::invalid_input("trunk burst_limit must be >= max_cps"));
            }
        }
        if self.window_ms == Some(0) {
            return Err(DialerError::invalid_input("trunk window_ms must be > 0"));
        }
        for limit in &self.limits {
            if limit.max_cps == 0 {
                return Err(DialerError::invalid_input(format!(
                    "limit {} max_cps must be > 0",
                    limit.limit_id
                )));
            }
            if limit.scope != LimitScope::Trunk && limit.scope_value.is_none() {
                return Err(DialerError::invalid_input(format!(
                    "limit {} needs a scope value",
                    limit.limit_id
                )));
            }
        }
        Ok(())
    }
}

/// Persisted admission state of a trunk
#[derive(Debug, Clone, PartialEq)]
pub struct TrunkState {
    pub trunk_id: String,
    pub max_cps: u32,
    pub burst_limit: Option<u32>,
    pub window_ms: u64,
    pub current_occupancy: u32,
}

impl TrunkState {
    /// Hard ceiling of admissions per window
    pub fn burst_ceiling(&self) -> u32 {
        self.burst_limit.unwrap_or(self.max_cps).max(self.max_cps)
    }
}

/// Outcome of an `acquire`
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Allowed {
        /// Granular limit the admission was charged to, if any applied
        limit_id: Option<String>,
        /// Window occupancy including this admission
        occupancy: u32,
        /// Admitted using burst headroom above `max_cps`
        burst: bool,
    },
    Denied {
        retry_after_ms: u64,
        /// Granular limit that denied, or `None` for the trunk-wide window
        limit_id: Option<String>,
        occupancy: u32,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Admission::Denied { retry_after_ms, .. } => Some(*retry_after_ms),
            Admission::Allowed { .. } => None,
        }
    }
}

/// Load classification of a trunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrunkHealth {
    Healthy,
    Warning,
    Critical,
    Throttled,
}

impl TrunkHealth {
    /// Classify `occupancy / max_cps`
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization >= 1.0 {
            TrunkHealth::Throttled
        } else if utilization >= 0.9 {
            TrunkHealth::Critical
        } else if utilization >= 0.7 {
            TrunkHealth::Warning
        } else {
            TrunkHealth::Healthy
        }
    }
}

/// Snapshot reported by `status`
#[derive(Debug, Clone, PartialEq)]
pub struct TrunkStatus {
    pub trunk_id: String,
    pub occupancy: u32,
    pub max_cps: u32,
    pub burst_limit: u32,
    pub window_ms: u64,
    pub utilization: f64,
    pub health: TrunkHealth,
    pub limits: Vec<TrunkLimit>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_thresholds() {
        assert_eq!(TrunkHealth::from_utilization(0.69), TrunkHealth::Healthy);
        assert_eq!(TrunkHealth::from_utilization(0.7), TrunkHealth::Warning);
        assert_eq!(TrunkHealth::from_utilization(0.95), TrunkHealth::Critical);
        assert_eq!(TrunkHealth::from_utilization(1.0), TrunkHealth::Throttled);
    }

    #[test]
    fn test_area_code_matching_handles_country_code() {
        let limit = TrunkLimit::new("nyc", LimitScope::AreaCode, Some("212*"), 2);
        assert!(limit.specificity(None, Some("+1 (212) 555-0100")).is_some());
        assert!(limit.specificity(None, Some("2125550100")).is_some());
        assert!(limit.specificity(None, Some("+13125550100")).is_none());
    }

    #[test]
    fn test_longer_area_code_is_more_specific() {
        let short = TrunkLimit::new("a", LimitScope::AreaCode, Some("1212"), 2);
        let long = TrunkLimit::new("b", LimitScope::AreaCode, Some("1212555"), 2);
        let dest = Some("+12125550100");
        assert!(long.specificity(None, dest) < short.specificity(None, dest));
    }

    #[test]
    fn test_specificity_order() {
        let dest = Some("+12125550100");
        let campaign = Some("camp");
        let exact = TrunkLimit::new("d", LimitScope::Destination, Some("12125550100"), 1);
        let area = TrunkLimit::new("a", LimitScope::AreaCode, Some("212"), 1);
        let camp = TrunkLimit::new("c", LimitScope::Campaign, Some("camp"), 1);
        let trunk = TrunkLimit::new("t", LimitScope::Trunk, None, 1);

        let ranks: Vec<_> = [&exact, &area, &camp, &trunk]
            .iter()
            .map(|l| l.specificity(campaign, dest).unwrap())
            .collect();
        assert!(ranks.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_validate_rejects_burst_below_cps() {
        assert!(TrunkLimitConfig::new(10).with_burst_limit(5).validate().is_err());
        assert!(TrunkLimitConfig::new(10).with_burst_limit(15).validate().is_ok());
    }
}
