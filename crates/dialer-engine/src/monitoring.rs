//! # Dialer Events
//!
//! Real-time notifications for supervisors and external integrations. Publishing is
//! fire-and-forget over a `tokio::sync::broadcast` channel: with no subscribers the event
//! is dropped, and a subscriber that falls behind sees `RecvError::Lagged` rather than
//! slowing the engine down.
//!
//! ```
//! use rvoip_dialer_engine::monitoring::{DialerEvent, DialerEvents};
//!
//! # async fn example() {
//! let events = DialerEvents::new(64);
//! let mut rx = events.subscribe();
//! events.publish(DialerEvent::CampaignPaused { campaign_id: "spring-sale".into() });
//! assert!(matches!(rx.recv().await, Ok(DialerEvent::CampaignPaused { .. })));
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::attempt::{CallState, EventKind};
use crate::rate_limit::TrunkHealth;
use crate::scheduler::SkipReason;

/// Notifications emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DialerEvent {
    AttemptTransitioned {
        attempt_id: String,
        campaign_id: String,
        from: CallState,
        to: CallState,
        event: EventKind,
        at: DateTime<Utc>,
    },
    /// An event that had no edge from the attempt's state
    TransitionIgnored {
        attempt_id: String,
        state: CallState,
        event: Option<EventKind>,
    },
    CampaignSkipped {
        campaign_id: String,
        reason: SkipReason,
    },
    CallsScheduled {
        campaign_id: String,
        budget: u32,
        created: u32,
        dial_ratio: f64,
    },
    CampaignPaused {
        campaign_id: String,
    },
    TrunkThrottled {
        trunk_id: String,
        limit_id: Option<String>,
        occupancy: u32,
        retry_after_ms: u64,
    },
    /// Sustained trunk overload
    QualityAlert {
        trunk_id: String,
        denials: u32,
        window_secs: u64,
        health: TrunkHealth,
        at: DateTime<Utc>,
    },
    JobFailed {
        job_id: String,
        attempt_id: String,
        reason: String,
    },
}

/// Broadcast bus for [`DialerEvent`]s
#[derive(Clone)]
pub struct DialerEvents {
    sender: broadcast::Sender<DialerEvent>,
}

impl DialerEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DialerEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: DialerEvent) {
        if self.sender.send(event).is_err() {
            trace!("No dialer event subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for DialerEvents {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let events = DialerEvents::default();
        events.publish(DialerEvent::CampaignPaused {
            campaign_id: "c1".to_string(),
        });
        assert_eq!(events.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let events = DialerEvents::new(8);
        let mut first = events.subscribe();
        let mut second = events.subscribe();

        events.publish(DialerEvent::JobFailed {
            job_id: "j1".to_string(),
            attempt_id: "a1".to_string(),
            reason: "no route".to_string(),
        });

        assert!(matches!(first.recv().await.unwrap(), DialerEvent::JobFailed { .. }));
        assert!(matches!(second.recv().await.unwrap(), DialerEvent::JobFailed { .. }));
    }
}
