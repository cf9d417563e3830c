//! The transition table and timer policy.
//!
//! Both are plain functions over fieldless enums so that every `(state, event)` pair
//! can be enumerated in tests. Anything not listed in [`transition`] is "no edge".

use super::types::{CallState, EventKind, TimerKind};

/// Resulting state for `event` in `state`, or `None` when no edge exists.
pub fn transition(state: CallState, event: EventKind) -> Option<CallState> {
    use CallState::*;
    use EventKind::*;

    let next = match (state, event) {
        (Queued, Reserved) => Reserving,
        (Queued | Reserving, OriginateFailed) => Failed,
        (Queued | Reserving, Cancel | Hangup) => Cancelled,
        (Reserving, OriginateSent) => Originating,

        (Originating, Sip180) => Ringing,
        (Originating | Ringing, Sip183) => EarlyMedia,
        (Originating | Ringing | EarlyMedia, Sip2xx) => Answered,
        (Originating | Ringing | EarlyMedia, Sip4xx | Sip5xx | Sip6xx | OriginateFailed) => {
            Failed
        }
        (Originating | Ringing | EarlyMedia, RingTimeout) => Timeout,
        (Originating | Ringing | EarlyMedia, Cancel | Hangup) => Cancelled,

        (Answered, MediaStart) => AmdProcessing,
        (Answered | AmdProcessing, AmdHuman | AmdTimeout | AgentAssigned) => Bridging,
        (Answered | AmdProcessing, AmdMachine) => Playing,
        (Answered | AmdProcessing, MediaTimeout | MediaLost) => NoRtp,
        (Answered | AmdProcessing, Bye) => Ended,
        (Answered | AmdProcessing, Hangup) => Ending,

        (Bridging, BridgeComplete) => Bridged,
        (Bridging, AgentTimeout | Bye | Hangup) => Abandoned,
        (Bridging, MediaTimeout | MediaLost) => NoRtp,

        (Bridged, RecordStart) => Recording,
        (Recording, RecordEnd) => Bridged,
        (Bridged | Recording, TransferInit) => Transferring,
        (Transferring, TransferComplete) => Transferred,
        (Transferring, TransferFailed) => Bridged,
        (Playing, PlayEnd) => Ending,

        (Bridged | Recording | Playing | Transferring | Transferred, Bye) => Ended,
        (Bridged | Recording | Playing | Transferring | Transferred, Hangup | MaxDuration) => {
            Ending
        }
        (Bridged | Recording | Playing | Transferring, MediaTimeout | MediaLost) => NoRtp,

        (Ending, Bye | MaxDuration) => Ended,
        (NoRtp, Bye) => Ended,

        (s, SystemError) if !s.is_terminal() && s != NoRtp => Failed,

        _ => return None,
    };
    Some(next)
}

impl TimerKind {
    /// States whose entry arms this timer
    pub fn arms_on_entry(&self, state: CallState) -> bool {
        use CallState::*;
        match self {
            TimerKind::RingTimeout => matches!(state, Originating | Ringing | EarlyMedia),
            TimerKind::AmdTimeout => matches!(state, Answered),
            TimerKind::AgentAssignTimeout => matches!(state, Bridging),
            TimerKind::MaxDuration => matches!(state, Bridged | Playing),
            TimerKind::HangupGuard => matches!(state, Ending | NoRtp),
        }
    }

    /// States in which an already-armed timer of this kind stays active
    pub fn live_in(&self, state: CallState) -> bool {
        use CallState::*;
        match self {
            TimerKind::RingTimeout => matches!(state, Originating | Ringing | EarlyMedia),
            TimerKind::AmdTimeout => matches!(state, Answered | AmdProcessing),
            TimerKind::AgentAssignTimeout => matches!(state, Bridging),
            TimerKind::MaxDuration => matches!(
                state,
                Bridged | Playing | Recording | Transferring | Transferred | Ending
            ),
            TimerKind::HangupGuard => matches!(state, Ending | NoRtp),
        }
    }
}

/// Timer changes implied by entering `state`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerPlan {
    /// Kinds whose active timers must be cancelled
    pub cancel: Vec<TimerKind>,
    /// Kinds to arm unless one is already active
    pub arm: Vec<TimerKind>,
}

pub fn timer_plan(state: CallState) -> TimerPlan {
    let mut plan = TimerPlan::default();
    for kind in TimerKind::ALL {
        if state.is_terminal() || !kind.live_in(state) {
            plan.cancel.push(kind);
        } else if kind.arms_on_entry(state) {
            plan.arm.push(kind);
        }
    }
    plan
}

/// Timestamp column stamped on entering `state`
pub(crate) fn stamp_column(state: CallState) -> Option<&'static str> {
    if state.is_terminal() {
        return Some("end_at");
    }
    match state {
        CallState::Reserving => Some("reserved_at"),
        CallState::Originating => Some("originate_at"),
        CallState::Ringing => Some("ring_at"),
        CallState::EarlyMedia => Some("early_media_at"),
        CallState::Answered => Some("answer_at"),
        CallState::Bridged => Some("bridge_at"),
        _ => None,
    }
}
