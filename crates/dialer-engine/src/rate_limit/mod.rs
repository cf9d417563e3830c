//! # Trunk Admission Control
//!
//! Every origination must be admitted by [`TrunkRateLimiter::acquire`] for the trunk it
//! will use. A trunk admits at most `max_cps` calls per sliding window, plus burst
//! headroom up to `burst_limit`; granular [`TrunkLimit`]s can further cap calls of one
//! campaign, destination or area code.

pub mod limiter;
pub mod types;

pub use limiter::TrunkRateLimiter;
pub use types::{
    Admission, LimitScope, TrunkHealth, TrunkLimit, TrunkLimitConfig, TrunkState, TrunkStatus,
};
