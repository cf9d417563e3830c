//! # Predictive Pacing
//!
//! [`PacingCalculator`] turns recent [`DialMetricsWindow`]s into a dial ratio for a
//! predictive campaign. The starting point is `1 / ASR`, the number of calls needed per
//! agent for one of them to be answered. Each method then backs off when the measured
//! abandon rate is over the campaign's target:
//!
//! - `HARD_LIMIT` cuts the ratio to `hard_limit_factor` of the base while over target.
//! - `TAPERED` moves last tick's ratio towards the target in proportion to the relative
//!   abandon-rate error, by at most `tapered_max_shrink_factor` down or up to
//!   `tapered_max_growth_factor` times up per tick.
//! - `AVERAGE` blends the mean of recent ratios with the base, trimmed by
//!   `average_over_target_factor` while over target.
//!
//! Every result is clamped to `[1.0, max_adapt_dial_level]`. Until the lookback holds
//! `min_samples` dialed calls (or nothing has been answered yet) the campaign's static
//! `dial_ratio` is used instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::campaign::{CampaignDialConfig, PacingMethod};
use crate::database::DialCounts;
use crate::error::{DialerError, Result};

/// Feedback-controller constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingTuning {
    /// HARD_LIMIT: fraction of the base ratio used while over target
    pub hard_limit_factor: f64,
    /// AVERAGE: multiplier applied to the blended ratio while over target
    pub average_over_target_factor: f64,
    /// AVERAGE: weight of the recent-ratio mean against the instantaneous base
    pub average_blend_weight: f64,
    /// TAPERED: largest per-tick growth multiplier
    pub tapered_max_growth_factor: f64,
    /// TAPERED: largest per-tick fractional reduction
    pub tapered_max_shrink_factor: f64,
}

impl Default for PacingTuning {
    fn default() -> Self {
        Self {
            hard_limit_factor: 0.7,
            average_over_target_factor: 0.9,
            average_blend_weight: 0.5,
            tapered_max_growth_factor: 1.2,
            tapered_max_shrink_factor: 0.5,
        }
    }
}

impl PacingTuning {
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, value: f64| {
            if value > 0.0 && value <= 1.0 {
                Ok(())
            } else {
                Err(DialerError::configuration(format!("pacing.{} must be in (0, 1]", name)))
            }
        };
        unit("hard_limit_factor", self.hard_limit_factor)?;
        unit("average_over_target_factor", self.average_over_target_factor)?;
        unit("tapered_max_shrink_factor", self.tapered_max_shrink_factor)?;

        if !(0.0..=1.0).contains(&self.average_blend_weight) {
            return Err(DialerError::configuration("pacing.average_blend_weight must be in [0, 1]"));
        }
        if !(self.tapered_max_growth_factor >= 1.0 && self.tapered_max_growth_factor.is_finite()) {
            return Err(DialerError::configuration("pacing.tapered_max_growth_factor must be >= 1"));
        }
        Ok(())
    }
}

/// Aggregate of one campaign's dial activity over one time bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialMetricsWindow {
    pub campaign_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub calls_dialed: u32,
    pub calls_ringing: u32,
    pub calls_connected: u32,
    pub calls_abandoned: u32,
    pub answer_seizure_ratio: f64,
    pub abandon_rate: f64,
    pub avg_talk_time_secs: f64,
    /// Ratio the scheduler used in the tick that closed this window
    pub dial_ratio: f64,
    pub agents_available: u32,
}

impl DialMetricsWindow {
    pub fn from_counts(
        campaign_id: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        counts: &DialCounts,
        dial_ratio: f64,
        agents_available: u32,
    ) -> Self {
        Self {
            campaign_id: campaign_id.to_string(),
            window_start,
            window_end,
            calls_dialed: counts.dialed,
            calls_ringing: counts.ringing,
            calls_connected: counts.connected,
            calls_abandoned: counts.abandoned,
            answer_seizure_ratio: counts.answer_seizure_ratio(),
            abandon_rate: counts.abandon_rate(),
            avg_talk_time_secs: counts.avg_talk_time_secs(),
            dial_ratio,
            agents_available,
        }
    }
}

/// Where a ratio came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingSource {
    /// Not enough data yet; the campaign's static ratio
    Static,
    Adaptive(PacingMethod),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacingDecision {
    pub dial_ratio: f64,
    pub source: PacingSource,
    pub answer_seizure_ratio: f64,
    pub abandon_rate: f64,
}

/// Totals over the lookback
#[derive(Debug, Clone, Default)]
struct MetricsSummary {
    dialed: u64,
    connected: u64,
    abandoned: u64,
    recent_ratios: Vec<f64>,
}

impl MetricsSummary {
    fn from_windows(windows: &[DialMetricsWindow]) -> Self {
        let mut summary = Self::default();
        for window in windows {
            summary.dialed += u64::from(window.calls_dialed);
            summary.connected += u64::from(window.calls_connected);
            summary.abandoned += u64::from(window.calls_abandoned);
            if window.dial_ratio.is_finite() && window.dial_ratio > 0.0 {
                summary.recent_ratios.push(window.dial_ratio);
            }
        }
        summary
    }

    fn answer_seizure_ratio(&self) -> f64 {
        if self.dialed == 0 {
            0.0
        } else {
            self.connected as f64 / self.dialed as f64
        }
    }

    fn abandon_rate(&self) -> f64 {
        if self.connected == 0 {
            0.0
        } else {
            self.abandoned as f64 / self.connected as f64
        }
    }
}

/// Computes predictive dial ratios from recent metrics
#[derive(Debug, Clone)]
pub struct PacingCalculator {
    tuning: PacingTuning,
    min_samples: u32,
}

impl PacingCalculator {
    pub fn new(tuning: PacingTuning, min_samples: u32) -> Self {
        Self { tuning, min_samples }
    }

    pub fn tuning(&self) -> &PacingTuning {
        &self.tuning
    }

    /// Dial ratio for the next tick. `windows` must be ordered oldest first.
    pub fn dial_ratio(&self, config: &CampaignDialConfig, windows: &[DialMetricsWindow]) -> PacingDecision {
        let ceiling = config.max_adapt_dial_level.max(1.0);
        let clamp = |ratio: f64| {
            if ratio.is_finite() {
                ratio.clamp(1.0, ceiling)
            } else {
                1.0
            }
        };

        let summary = MetricsSummary::from_windows(windows);
        let asr = summary.answer_seizure_ratio();
        let abandon = summary.abandon_rate();

        if summary.dialed < u64::from(self.min_samples) || asr <= 0.0 {
            return PacingDecision {
                dial_ratio: clamp(config.dial_ratio),
                source: PacingSource::Static,
                answer_seizure_ratio: asr,
                abandon_rate: abandon,
            };
        }

        let base = 1.0 / asr;
        let target = config.target_abandon_rate;
        let over_target = abandon > target;

        let raw = match config.pacing_method {
            PacingMethod::HardLimit => {
                if over_target {
                    base * self.tuning.hard_limit_factor
                } else {
                    base
                }
            }
            PacingMethod::Tapered => {
                let previous = clamp(
                    summary
                        .recent_ratios
                        .last()
                        .copied()
                        .unwrap_or(config.dial_ratio),
                );
                // Relative error, saturating at 100%
                let error = if target > 0.0 {
                    ((abandon - target) / target).clamp(-1.0, 1.0)
                } else {
                    0.0
                };
                if error > 0.0 {
                    previous * (1.0 - error * self.tuning.tapered_max_shrink_factor)
                } else {
                    previous * (1.0 + (-error) * (self.tuning.tapered_max_growth_factor - 1.0))
                }
            }
            PacingMethod::Average => {
                let mean = if summary.recent_ratios.is_empty() {
                    base
                } else {
                    summary.recent_ratios.iter().sum::<f64>() / summary.recent_ratios.len() as f64
                };
                let weight = self.tuning.average_blend_weight;
                let blended = weight * mean + (1.0 - weight) * base;
                if over_target {
                    blended * self.tuning.average_over_target_factor
                } else {
                    blended
                }
            }
        };

        let dial_ratio = clamp(raw);
        debug!(
            "Pacing {:?}: asr={:.3} abandon={:.3} target={:.3} base={:.2} ratio={:.2}",
            config.pacing_method, asr, abandon, target, base, dial_ratio
        );

        PacingDecision {
            dial_ratio,
            source: PacingSource::Adaptive(config.pacing_method),
            answer_seizure_ratio: asr,
            abandon_rate: abandon,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn window(dialed: u32, connected: u32, abandoned: u32, dial_ratio: f64) -> DialMetricsWindow {
        let now = Utc::now();
        DialMetricsWindow {
            campaign_id: "camp".to_string(),
            window_start: now,
            window_end: now,
            calls_dialed: dialed,
            calls_ringing: dialed,
            calls_connected: connected,
            calls_abandoned: abandoned,
            answer_seizure_ratio: 0.0,
            abandon_rate: 0.0,
            avg_talk_time_secs: 0.0,
            dial_ratio,
            agents_available: 5,
        }
    }

    fn config(method: PacingMethod) -> CampaignDialConfig {
        CampaignDialConfig {
            dial_ratio: 1.5,
            max_adapt_dial_level: 4.0,
            target_abandon_rate: 0.03,
            pacing_method: method,
            ..Default::default()
        }
    }

    fn calculator() -> PacingCalculator {
        PacingCalculator::new(PacingTuning::default(), 20)
    }

    #[test]
    fn test_static_ratio_until_enough_samples() {
        let decision = calculator().dial_ratio(&config(PacingMethod::HardLimit), &[window(10, 2, 0, 1.5)]);
        assert_eq!(decision.source, PacingSource::Static);
        assert!((decision.dial_ratio - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_hard_limit_uses_inverse_asr_under_target() {
        // ASR 0.4 -> base 2.5, no abandons
        let decision = calculator().dial_ratio(&config(PacingMethod::HardLimit), &[window(100, 40, 0, 1.5)]);
        assert_eq!(decision.source, PacingSource::Adaptive(PacingMethod::HardLimit));
        assert!((decision.dial_ratio - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_hard_limit_clamps_over_target() {
        // abandon 4/40 = 10% > 3% -> 2.5 * 0.7
        let decision = calculator().dial_ratio(&config(PacingMethod::HardLimit), &[window(100, 40, 4, 1.5)]);
        assert!((decision.dial_ratio - 1.75).abs() < 1e-9);
    }

    #[test]
    fn test_tapered_shrink_is_bounded() {
        // abandon far over target: shrink by at most 50% of the previous 3.0
        let decision = calculator().dial_ratio(&config(PacingMethod::Tapered), &[window(100, 40, 20, 3.0)]);
        assert!((decision.dial_ratio - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_tapered_growth_is_bounded() {
        // no abandons: grow by at most 20%
        let decision = calculator().dial_ratio(&config(PacingMethod::Tapered), &[window(100, 40, 0, 2.0)]);
        assert!((decision.dial_ratio - 2.4).abs() < 1e-9);
    }

    #[test]
    fn test_average_blends_and_trims_over_target() {
        let windows = [window(50, 20, 0, 2.0), window(50, 20, 4, 3.0)];
        // mean 2.5, base 2.5, blended 2.5, abandon 4/40 over target -> 2.25
        let decision = calculator().dial_ratio(&config(PacingMethod::Average), &windows);
        assert!((decision.dial_ratio - 2.25).abs() < 1e-9);
    }

    #[test]
    fn test_ceiling_applies() {
        // ASR 0.1 -> base 10, capped at 4
        let decision = calculator().dial_ratio(&config(PacingMethod::HardLimit), &[window(100, 10, 0, 1.5)]);
        assert!((decision.dial_ratio - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_tuning_validation() {
        assert!(PacingTuning::default().validate().is_ok());
        let tuning = PacingTuning {
            hard_limit_factor: 1.5,
            ..Default::default()
        };
        assert!(tuning.validate().is_err());
    }

    fn method() -> impl Strategy<Value = PacingMethod> {
        prop_oneof![
            Just(PacingMethod::HardLimit),
            Just(PacingMethod::Tapered),
            Just(PacingMethod::Average),
        ]
    }

    proptest! {
        #[test]
        fn prop_ratio_stays_within_bounds(
            method in method(),
            max_level in 1.0f64..8.0,
            static_ratio in 0.1f64..10.0,
            target in 0.001f64..0.5,
            windows in prop::collection::vec((0u32..500, 0u32..500, 0u32..500, 0.0f64..20.0), 0..12),
        ) {
            let config = CampaignDialConfig {
                dial_ratio: static_ratio,
                max_adapt_dial_level: max_level,
                target_abandon_rate: target,
                pacing_method: method,
                ..Default::default()
            };
            let windows: Vec<_> = windows
                .into_iter()
                .map(|(dialed, connected, abandoned, ratio)| {
                    window(dialed, connected.min(dialed), abandoned.min(connected.min(dialed)), ratio)
                })
                .collect();

            let decision = calculator().dial_ratio(&config, &windows);
            prop_assert!(decision.dial_ratio >= 1.0);
            prop_assert!(decision.dial_ratio <= max_level);
        }
    }
}
