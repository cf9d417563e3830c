//! # RVOIP Dialer Engine
//!
//! Outbound call-center dialing for the rvoip stack: decides how many calls each
//! campaign should place, reserves leads exactly once, admits originations against trunk
//! rate limits and tracks every call attempt through a persisted state machine.
//!
//! ## Architecture
//!
//! ```text
//!   AdmissionScheduler ──reserve leads──► CallAttempt (QUEUED) + OriginateJob
//!          │ pacing                                  │
//!   PacingCalculator                       OriginateDispatcher ──acquire──► TrunkRateLimiter
//!                                                    │
//!                                           SignalingAdapter (provider)
//!                                                    │ call progress
//!                                           CallStateMachine ◄── TimerService
//! ```
//!
//! The components share nothing but the [`DialerDatabase`](database::DialerDatabase).
//! Every exactly-once decision (lead reservation, job and timer claiming, state
//! transitions, trunk admission) is made by the store, so several engine instances can
//! run against one database.
//!
//! ## Quick Start
//!
//! ```rust
//! use rvoip_dialer_engine::prelude::*;
//!
//! # async fn example() -> rvoip_dialer_engine::Result<()> {
//! let db = DialerDatabase::new_in_memory().await?;
//! let events = DialerEvents::default();
//! let machine = CallStateMachine::new(db.clone(), TimerConfig::default(), events.clone());
//!
//! let (attempt, _) = db
//!     .create_attempt_with_job(
//!         &NewAttempt {
//!             campaign_id: "spring-sale".into(),
//!             account_id: "acme".into(),
//!             lead_id: "lead-1".into(),
//!             destination: "+15550100".into(),
//!             attempt_number: 1,
//!             job_priority: 0,
//!         },
//!         chrono::Utc::now(),
//!     )
//!     .await?;
//!
//! let outcome = machine.post_event(&attempt.attempt_id, CallEvent::Reserved).await?;
//! assert_eq!(outcome.state(), CallState::Reserving);
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod error;
pub mod config;
pub mod logging;

// Dialer functionality
pub mod campaign;
pub mod attempt;
pub mod pacing;
pub mod rate_limit;
pub mod scheduler;
pub mod dispatcher;
pub mod monitoring;

// External interfaces
pub mod integration;
pub mod server;

// Persistence
pub mod database;

pub use config::DialerConfig;
pub use error::{DialerError, Result};
pub use server::{DialerServer, DialerServerBuilder};

pub mod prelude {
    pub use crate::{DialerConfig, DialerError, DialerServer, DialerServerBuilder, Result};

    pub use crate::config::{
        DatabaseConfig, DispatcherConfig, GeneralConfig, RateLimiterConfig, SchedulerConfig, TimerConfig,
    };
    pub use crate::logging::{init_logging, LoggingConfig};

    pub use crate::campaign::{
        Campaign, CampaignDialConfig, CampaignStatus, DialMode, PacingMethod, WorkSchedule,
    };
    pub use crate::attempt::{
        AmdResult, CallAttempt, CallEvent, CallState, CallStateMachine, EventKind, TimerKind,
        TimerService, TransitionOutcome,
    };
    pub use crate::pacing::{DialMetricsWindow, PacingCalculator, PacingDecision, PacingTuning};
    pub use crate::rate_limit::{
        Admission, LimitScope, TrunkHealth, TrunkLimit, TrunkLimitConfig, TrunkRateLimiter, TrunkStatus,
    };
    pub use crate::scheduler::{AdmissionScheduler, CampaignOutcome, SkipReason, TickReport};
    pub use crate::dispatcher::{DispatchReport, OriginateDispatcher};
    pub use crate::monitoring::{DialerEvent, DialerEvents};
    pub use crate::integration::{
        OriginationRequest, OutboundRoute, RouteProvider, SignalingAdapter, StaticRouteProvider,
    };
    pub use crate::database::{
        AgentStatus, DbAgent, DialerDatabase, NewAttempt, NewLead, OriginateJob, ReservationPolicy,
    };
}
