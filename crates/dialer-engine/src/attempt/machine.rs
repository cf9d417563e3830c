//! # Call State Machine
//!
//! [`CallStateMachine::post_event`] is the single entry point through which an attempt's
//! state changes. Signaling adapters, the dispatcher and the timer service all call it,
//! possibly at the same moment for the same attempt; each call reads the attempt, looks
//! up the edge and applies it with a compare-and-swap on `(state, version)`. A loser of
//! that race re-reads and re-evaluates the event against the new state.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::table::{timer_plan, transition};
use super::types::{CallAttempt, CallEvent, CallState, EventKind, IgnoreReason, TransitionOutcome};
use crate::campaign::CampaignDialConfig;
use crate::config::TimerConfig;
use crate::database::{AttemptTransition, DialerDatabase};
use crate::error::{DialerError, Result};
use crate::monitoring::{DialerEvent, DialerEvents};

const MAX_CAS_RETRIES: usize = 8;

/// Applies events to persisted call attempts
#[derive(Clone)]
pub struct CallStateMachine {
    db: DialerDatabase,
    timer_defaults: TimerConfig,
    events: DialerEvents,
}

impl CallStateMachine {
    pub fn new(db: DialerDatabase, timer_defaults: TimerConfig, events: DialerEvents) -> Self {
        Self {
            db,
            timer_defaults,
            events,
        }
    }

    pub fn database(&self) -> &DialerDatabase {
        &self.db
    }

    /// Deliver `event` to an attempt
    pub async fn post_event(&self, attempt_id: &str, event: CallEvent) -> Result<TransitionOutcome> {
        self.post_event_at(attempt_id, event, Utc::now()).await
    }

    /// Deliver `event` as if it happened at `now`
    pub async fn post_event_at(
        &self,
        attempt_id: &str,
        event: CallEvent,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        for _ in 0..MAX_CAS_RETRIES {
            let attempt = self
                .db
                .get_attempt(attempt_id)
                .await?
                .ok_or_else(|| DialerError::not_found(format!("call attempt {}", attempt_id)))?;

            let Some(kind) = event.kind() else {
                debug!("Attempt {}: ignoring unclassified event {:?}", attempt_id, event);
                return Ok(self.ignored(&attempt, None, IgnoreReason::Unclassified));
            };

            if attempt.state.is_terminal() {
                warn!(
                    "Attempt {} is terminal ({}), ignoring {}",
                    attempt_id, attempt.state, kind
                );
                return Ok(self.ignored(&attempt, Some(kind), IgnoreReason::Terminal));
            }

            let Some(next) = transition(attempt.state, kind) else {
                if kind == EventKind::Sip100 {
                    debug!("Attempt {}: 100 Trying in {}", attempt_id, attempt.state);
                } else {
                    warn!(
                        "Attempt {}: no transition for {} in {}, state unchanged",
                        attempt_id, kind, attempt.state
                    );
                }
                return Ok(self.ignored(&attempt, Some(kind), IgnoreReason::NoTransition));
            };

            let plan = self.build_transition(&attempt, next, kind, &event, now).await?;
            if self.db.apply_transition(&plan).await? {
                info!(
                    "Attempt {} {} -> {} on {}",
                    attempt_id, attempt.state, next, kind
                );
                self.events.publish(DialerEvent::AttemptTransitioned {
                    attempt_id: attempt.attempt_id.clone(),
                    campaign_id: attempt.campaign_id.clone(),
                    from: attempt.state,
                    to: next,
                    event: kind,
                    at: now,
                });
                return Ok(TransitionOutcome::Applied {
                    attempt_id: attempt.attempt_id,
                    from: attempt.state,
                    to: next,
                    event: kind,
                });
            }

            debug!("Attempt {}: concurrent update, re-evaluating {}", attempt_id, kind);
        }

        Err(DialerError::Timeout(format!(
            "attempt {} kept changing under event; gave up after {} tries",
            attempt_id, MAX_CAS_RETRIES
        )))
    }

    async fn build_transition(
        &self,
        attempt: &CallAttempt,
        next: CallState,
        kind: EventKind,
        event: &CallEvent,
        now: DateTime<Utc>,
    ) -> Result<AttemptTransition> {
        let timers = timer_plan(next);

        let arm_timers = if timers.arm.is_empty() {
            Vec::new()
        } else {
            let dial_config = self
                .db
                .get_campaign(&attempt.campaign_id)
                .await?
                .map(|c| c.dial_config)
                .unwrap_or_else(CampaignDialConfig::default);
            timers
                .arm
                .iter()
                .map(|timer| {
                    let duration = dial_config.timer_duration(*timer, &self.timer_defaults);
                    let fire_at = chrono::Duration::from_std(duration)
                        .ok()
                        .and_then(|delay| now.checked_add_signed(delay))
                        .ok_or_else(|| {
                            DialerError::invalid_input(format!(
                                "{} timer of {:?} overflows the clock",
                                timer.as_str(),
                                duration
                            ))
                        })?;
                    Ok((*timer, fire_at))
                })
                .collect::<Result<Vec<_>>>()?
        };

        let (final_sip_code, mut final_reason) = match event.final_response() {
            Some((code, reason)) => (Some(code), reason),
            None => (None, None),
        };
        if next.is_terminal() && final_reason.is_none() {
            final_reason = Some(event.reason().unwrap_or_else(|| kind.as_str().to_string()));
        }

        let (agent_id, trunk_id, caller_id) = match event {
            CallEvent::AgentAssigned { agent_id } => (Some(agent_id.clone()), None, None),
            CallEvent::BridgeComplete { agent_id } => (agent_id.clone(), None, None),
            CallEvent::OriginateSent { trunk_id, caller_id } => (None, trunk_id.clone(), caller_id.clone()),
            _ => (None, None, None),
        };

        Ok(AttemptTransition {
            attempt_id: attempt.attempt_id.clone(),
            from: attempt.state,
            to: next,
            expected_version: attempt.version,
            event: kind,
            detail: Some(serde_json::to_value(event)?),
            at: now,
            cancel_timers: timers.cancel,
            arm_timers,
            final_sip_code,
            final_reason,
            agent_id,
            trunk_id,
            caller_id,
        })
    }

    fn ignored(&self, attempt: &CallAttempt, kind: Option<EventKind>, reason: IgnoreReason) -> TransitionOutcome {
        self.events.publish(DialerEvent::TransitionIgnored {
            attempt_id: attempt.attempt_id.clone(),
            state: attempt.state,
            event: kind,
        });
        TransitionOutcome::Ignored {
            attempt_id: attempt.attempt_id.clone(),
            state: attempt.state,
            event: kind,
            reason,
        }
    }
}
