//! Fires due attempt timers.
//!
//! A timer produces its expiry event only after [`claim_timer`] flips it from active to
//! fired. A timer cancelled by a transition that ran between the scan and the claim is
//! never fired, and two timer services scanning the same store cannot both fire it.
//!
//! [`claim_timer`]: crate::database::DialerDatabase::claim_timer

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use super::machine::CallStateMachine;
use crate::config::TimerConfig;
use crate::error::Result;

#[derive(Clone)]
pub struct TimerService {
    machine: CallStateMachine,
    config: TimerConfig,
}

impl TimerService {
    pub fn new(machine: CallStateMachine, config: TimerConfig) -> Self {
        Self { machine, config }
    }

    pub async fn fire_due(&self) -> Result<usize> {
        self.fire_due_at(Utc::now()).await
    }

    /// Fire every timer due at `now`; returns how many fired
    pub async fn fire_due_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let db = self.machine.database();
        let due = db.due_timers(now, self.config.batch_size).await?;
        let mut fired = 0;

        for timer in due {
            if !db.claim_timer(&timer.timer_id).await? {
                debug!("Timer {} was cancelled or already fired", timer.timer_id);
                continue;
            }
            fired += 1;

            match self
                .machine
                .post_event_at(&timer.attempt_id, timer.kind.expiry_event(), now)
                .await
            {
                Ok(outcome) => debug!(
                    "Timer {} ({}) fired for attempt {}: {:?}",
                    timer.timer_id,
                    timer.kind.as_str(),
                    timer.attempt_id,
                    outcome
                ),
                Err(e) => error!(
                    "Timer {} for attempt {} fired but the event failed: {}",
                    timer.timer_id, timer.attempt_id, e
                ),
            }
        }

        Ok(fired)
    }
}
