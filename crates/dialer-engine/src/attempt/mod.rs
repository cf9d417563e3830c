//! # Call Attempt Lifecycle
//!
//! One [`CallAttempt`] per outbound dial effort, moved through [`CallState`]s by
//! [`CallEvent`]s. The edges live in [`table::transition`]; [`CallStateMachine`] applies
//! them to the store together with timer and audit-log updates; [`TimerService`] turns
//! expired timers back into events.
//!
//! ```text
//! QUEUED -> RESERVING -> ORIGINATING -> RINGING / EARLY_MEDIA -> ANSWERED
//!   ANSWERED -> AMD_PROCESSING -> BRIDGING -> BRIDGED -> (RECORDING | TRANSFERRING) -> ENDING -> ENDED
//!   ANSWERED -> PLAYING (machine) -> ENDING -> ENDED
//! failures: FAILED, TIMEOUT, CANCELLED, ABANDONED, NO_RTP -> ENDED
//! ```

pub mod machine;
pub mod table;
pub mod timers;
pub mod types;

pub use machine::CallStateMachine;
pub use table::{timer_plan, transition, TimerPlan};
pub use timers::TimerService;
pub use types::{
    AmdResult, AttemptEventRecord, AttemptTimer, CallAttempt, CallEvent, CallState, EventKind,
    IgnoreReason, MediaStats, TimerKind, TransitionOutcome,
};
