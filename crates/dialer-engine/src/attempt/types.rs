use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one outbound call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Queued,
    Reserving,
    Originating,
    Ringing,
    EarlyMedia,
    Answered,
    AmdProcessing,
    Bridging,
    Bridged,
    Playing,
    Recording,
    Transferring,
    Transferred,
    Ending,
    Ended,
    Failed,
    NoRtp,
    Abandoned,
    Timeout,
    Cancelled,
}

impl CallState {
    pub const ALL: [CallState; 20] = [
        CallState::Queued,
        CallState::Reserving,
        CallState::Originating,
        CallState::Ringing,
        CallState::EarlyMedia,
        CallState::Answered,
        CallState::AmdProcessing,
        CallState::Bridging,
        CallState::Bridged,
        CallState::Playing,
        CallState::Recording,
        CallState::Transferring,
        CallState::Transferred,
        CallState::Ending,
        CallState::Ended,
        CallState::Failed,
        CallState::NoRtp,
        CallState::Abandoned,
        CallState::Timeout,
        CallState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Queued => "QUEUED",
            CallState::Reserving => "RESERVING",
            CallState::Originating => "ORIGINATING",
            CallState::Ringing => "RINGING",
            CallState::EarlyMedia => "EARLY_MEDIA",
            CallState::Answered => "ANSWERED",
            CallState::AmdProcessing => "AMD_PROCESSING",
            CallState::Bridging => "BRIDGING",
            CallState::Bridged => "BRIDGED",
            CallState::Playing => "PLAYING",
            CallState::Recording => "RECORDING",
            CallState::Transferring => "TRANSFERRING",
            CallState::Transferred => "TRANSFERRED",
            CallState::Ending => "ENDING",
            CallState::Ended => "ENDED",
            CallState::Failed => "FAILED",
            CallState::NoRtp => "NO_RTP",
            CallState::Abandoned => "ABANDONED",
            CallState::Timeout => "TIMEOUT",
            CallState::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        CallState::ALL.iter().copied().find(|state| state.as_str() == s)
    }

    /// Terminal states accept no further events
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Ended
                | CallState::Failed
                | CallState::Abandoned
                | CallState::Timeout
                | CallState::Cancelled
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answering machine detection verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AmdResult {
    Human,
    Machine,
    Timeout,
}

/// RTP statistics reported alongside media loss
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaStats {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub jitter_ms: u32,
}

/// An event delivered to the state machine
///
/// Each variant carries only what that event needs. The transition table keys on
/// [`EventKind`], obtained through [`CallEvent::kind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallEvent {
    /// The dispatcher picked up the attempt's origination job
    Reserved,
    OriginateSent {
        trunk_id: Option<String>,
        caller_id: Option<String>,
    },
    OriginateFailed {
        reason: String,
    },
    SipResponse {
        code: u16,
        reason: Option<String>,
    },
    MediaStarted,
    MediaTimeout,
    MediaLost {
        stats: Option<MediaStats>,
    },
    Amd {
        result: AmdResult,
    },
    AgentAssigned {
        agent_id: String,
    },
    AgentTimeout,
    BridgeComplete {
        agent_id: Option<String>,
    },
    PlayStarted,
    PlayEnded,
    RecordStarted,
    RecordEnded,
    TransferInitiated {
        target: String,
    },
    TransferCompleted,
    TransferFailed {
        reason: Option<String>,
    },
    Bye,
    Cancel,
    Hangup {
        cause: Option<String>,
    },
    RingTimeout,
    MaxDuration,
    SystemError {
        message: String,
    },
}

/// Fieldless event classification used by the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Reserved,
    OriginateSent,
    OriginateFailed,
    Sip100,
    Sip180,
    Sip183,
    Sip2xx,
    Sip4xx,
    Sip5xx,
    Sip6xx,
    MediaStart,
    MediaTimeout,
    MediaLost,
    AmdHuman,
    AmdMachine,
    AmdTimeout,
    AgentAssigned,
    AgentTimeout,
    BridgeComplete,
    PlayStart,
    PlayEnd,
    RecordStart,
    RecordEnd,
    TransferInit,
    TransferComplete,
    TransferFailed,
    Bye,
    Cancel,
    Hangup,
    RingTimeout,
    MaxDuration,
    SystemError,
}

impl EventKind {
    pub const ALL: [EventKind; 32] = [
        EventKind::Reserved,
        EventKind::OriginateSent,
        EventKind::OriginateFailed,
        EventKind::Sip100,
        EventKind::Sip180,
        EventKind::Sip183,
        EventKind::Sip2xx,
        EventKind::Sip4xx,
        EventKind::Sip5xx,
        EventKind::Sip6xx,
        EventKind::MediaStart,
        EventKind::MediaTimeout,
        EventKind::MediaLost,
        EventKind::AmdHuman,
        EventKind::AmdMachine,
        EventKind::AmdTimeout,
        EventKind::AgentAssigned,
        EventKind::AgentTimeout,
        EventKind::BridgeComplete,
        EventKind::PlayStart,
        EventKind::PlayEnd,
        EventKind::RecordStart,
        EventKind::RecordEnd,
        EventKind::TransferInit,
        EventKind::TransferComplete,
        EventKind::TransferFailed,
        EventKind::Bye,
        EventKind::Cancel,
        EventKind::Hangup,
        EventKind::RingTimeout,
        EventKind::MaxDuration,
        EventKind::SystemError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Reserved => "RESERVED",
            EventKind::OriginateSent => "ORIGINATE_SENT",
            EventKind::OriginateFailed => "ORIGINATE_FAILED",
            EventKind::Sip100 => "SIP_100",
            EventKind::Sip180 => "SIP_180",
            EventKind::Sip183 => "SIP_183",
            EventKind::Sip2xx => "SIP_200",
            EventKind::Sip4xx => "SIP_4XX",
            EventKind::Sip5xx => "SIP_5XX",
            EventKind::Sip6xx => "SIP_6XX",
            EventKind::MediaStart => "MEDIA_START",
            EventKind::MediaTimeout => "MEDIA_TIMEOUT",
            EventKind::MediaLost => "MEDIA_LOST",
            EventKind::AmdHuman => "AMD_HUMAN",
            EventKind::AmdMachine => "AMD_MACHINE",
            EventKind::AmdTimeout => "AMD_TIMEOUT",
            EventKind::AgentAssigned => "AGENT_ASSIGNED",
            EventKind::AgentTimeout => "AGENT_TIMEOUT",
            EventKind::BridgeComplete => "BRIDGE_COMPLETE",
            EventKind::PlayStart => "PLAY_START",
            EventKind::PlayEnd => "PLAY_END",
            EventKind::RecordStart => "RECORD_START",
            EventKind::RecordEnd => "RECORD_END",
            EventKind::TransferInit => "TRANSFER_INIT",
            EventKind::TransferComplete => "TRANSFER_COMPLETE",
            EventKind::TransferFailed => "TRANSFER_FAILED",
            EventKind::Bye => "BYE",
            EventKind::Cancel => "CANCEL",
            EventKind::Hangup => "HANGUP",
            EventKind::RingTimeout => "RING_TIMEOUT",
            EventKind::MaxDuration => "MAX_DURATION",
            EventKind::SystemError => "SYSTEM_ERROR",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CallEvent {
    /// Classify the event for the transition table.
    ///
    /// Returns `None` for SIP responses that carry no lifecycle meaning
    /// (unknown provisional codes, codes outside 100..700).
    /// Unfollowed 3xx redirects count as client failures.
    pub fn kind(&self) -> Option<EventKind> {
        let kind = match self {
            CallEvent::Reserved => EventKind::Reserved,
            CallEvent::OriginateSent { .. } => EventKind::OriginateSent,
            CallEvent::OriginateFailed { .. } => EventKind::OriginateFailed,
            CallEvent::SipResponse { code, .. } => match *code {
                100 => EventKind::Sip100,
                180..=182 => EventKind::Sip180,
                183 => EventKind::Sip183,
                200..=299 => EventKind::Sip2xx,
                300..=499 => EventKind::Sip4xx,
                500..=599 => EventKind::Sip5xx,
                600..=699 => EventKind::Sip6xx,
                _ => return None,
            },
            CallEvent::MediaStarted => EventKind::MediaStart,
            CallEvent::MediaTimeout => EventKind::MediaTimeout,
            CallEvent::MediaLost { .. } => EventKind::MediaLost,
            CallEvent::Amd { result } => match result {
                AmdResult::Human => EventKind::AmdHuman,
                AmdResult::Machine => EventKind::AmdMachine,
                AmdResult::Timeout => EventKind::AmdTimeout,
            },
            CallEvent::AgentAssigned { .. } => EventKind::AgentAssigned,
            CallEvent::AgentTimeout => EventKind::AgentTimeout,
            CallEvent::BridgeComplete { .. } => EventKind::BridgeComplete,
            CallEvent::PlayStarted => EventKind::PlayStart,
            CallEvent::PlayEnded => EventKind::PlayEnd,
            CallEvent::RecordStarted => EventKind::RecordStart,
            CallEvent::RecordEnded => EventKind::RecordEnd,
            CallEvent::TransferInitiated { .. } => EventKind::TransferInit,
            CallEvent::TransferCompleted => EventKind::TransferComplete,
            CallEvent::TransferFailed { .. } => EventKind::TransferFailed,
            CallEvent::Bye => EventKind::Bye,
            CallEvent::Cancel => EventKind::Cancel,
            CallEvent::Hangup { .. } => EventKind::Hangup,
            CallEvent::RingTimeout => EventKind::RingTimeout,
            CallEvent::MaxDuration => EventKind::MaxDuration,
            CallEvent::SystemError { .. } => EventKind::SystemError,
        };
        Some(kind)
    }

    /// Final SIP code and reason carried by this event, if any
    pub fn final_response(&self) -> Option<(u16, Option<String>)> {
        match self {
            CallEvent::SipResponse { code, reason } if *code >= 200 => Some((*code, reason.clone())),
            _ => None,
        }
    }

    /// Human-readable reason carried by failure and hangup events
    pub fn reason(&self) -> Option<String> {
        match self {
            CallEvent::OriginateFailed { reason } => Some(reason.clone()),
            CallEvent::SipResponse { reason, .. } => reason.clone(),
            CallEvent::Hangup { cause } => cause.clone(),
            CallEvent::TransferFailed { reason } => reason.clone(),
            CallEvent::SystemError { message } => Some(message.clone()),
            _ => None,
        }
    }
}

/// Bounded waits bound to an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerKind {
    RingTimeout,
    AmdTimeout,
    AgentAssignTimeout,
    MaxDuration,
    /// Bounds how long a call may sit in ENDING or NO_RTP waiting for its BYE
    HangupGuard,
}

impl TimerKind {
    pub const ALL: [TimerKind; 5] = [
        TimerKind::RingTimeout,
        TimerKind::AmdTimeout,
        TimerKind::AgentAssignTimeout,
        TimerKind::MaxDuration,
        TimerKind::HangupGuard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::RingTimeout => "RING_TIMEOUT",
            TimerKind::AmdTimeout => "AMD_TIMEOUT",
            TimerKind::AgentAssignTimeout => "AGENT_ASSIGN_TIMEOUT",
            TimerKind::MaxDuration => "MAX_DURATION",
            TimerKind::HangupGuard => "HANGUP_GUARD",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        TimerKind::ALL.iter().copied().find(|kind| kind.as_str() == s)
    }

    /// The synthetic event produced when this timer fires
    pub fn expiry_event(&self) -> CallEvent {
        match self {
            TimerKind::RingTimeout => CallEvent::RingTimeout,
            TimerKind::AmdTimeout => CallEvent::Amd {
                result: AmdResult::Timeout,
            },
            TimerKind::AgentAssignTimeout => CallEvent::AgentTimeout,
            TimerKind::MaxDuration => CallEvent::MaxDuration,
            // The far end is gone; tear the call down as if the BYE had arrived
            TimerKind::HangupGuard => CallEvent::Bye,
        }
    }
}

/// One outbound dial effort
#[derive(Debug, Clone, PartialEq)]
pub struct CallAttempt {
    pub attempt_id: String,
    pub campaign_id: String,
    pub account_id: String,
    pub lead_id: String,
    pub destination: String,
    pub state: CallState,
    /// Incremented on every applied transition; the compare-and-swap token
    pub version: i64,
    /// Idempotency key: `campaign:lead:attempt_number`
    pub correlation_id: String,
    pub trunk_id: Option<String>,
    pub caller_id: Option<String>,
    pub provider_call_id: Option<String>,
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub originate_at: Option<DateTime<Utc>>,
    pub ring_at: Option<DateTime<Utc>>,
    pub early_media_at: Option<DateTime<Utc>>,
    pub answer_at: Option<DateTime<Utc>>,
    pub bridge_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub final_sip_code: Option<u16>,
    pub final_reason: Option<String>,
}

/// A scheduled timer row
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptTimer {
    pub timer_id: String,
    pub attempt_id: String,
    pub kind: TimerKind,
    pub fire_at: DateTime<Utc>,
    pub fired: bool,
    pub cancelled: bool,
}

impl AttemptTimer {
    pub fn is_active(&self) -> bool {
        !self.fired && !self.cancelled
    }
}

/// One row of the append-only transition log
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptEventRecord {
    pub event_id: i64,
    pub attempt_id: String,
    pub from_state: CallState,
    pub to_state: CallState,
    pub event: String,
    pub detail: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

/// Why an event left the attempt unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The attempt is already terminal
    Terminal,
    /// No edge exists for this event from the current state
    NoTransition,
    /// The event has no lifecycle meaning (e.g. an unknown provisional code)
    Unclassified,
}

/// Result of posting an event to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied {
        attempt_id: String,
        from: CallState,
        to: CallState,
        event: EventKind,
    },
    Ignored {
        attempt_id: String,
        state: CallState,
        event: Option<EventKind>,
        reason: IgnoreReason,
    },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }

    /// State of the attempt after the event was processed
    pub fn state(&self) -> CallState {
        match self {
            TransitionOutcome::Applied { to, .. } => *to,
            TransitionOutcome::Ignored { state, .. } => *state,
        }
    }
}
