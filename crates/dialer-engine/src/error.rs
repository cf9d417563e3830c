//! # Error Types for Dialer Operations
//!
//! Every fallible operation in the dialer engine returns [`Result<T>`], an alias over
//! [`DialerError`]. Conditions the engine treats as routine (an event with no transition,
//! a rate-limiter denial, a campaign skipped for the tick) are *not* errors: they are
//! reported through [`TransitionOutcome`](crate::attempt::TransitionOutcome),
//! [`Admission`](crate::rate_limit::Admission) and
//! [`CampaignOutcome`](crate::scheduler::CampaignOutcome) instead.

use thiserror::Error;

/// Error types for dialer engine operations
///
/// # Examples
///
/// ```
/// use rvoip_dialer_engine::{DialerError, Result};
///
/// fn load_trunk(trunk_id: &str) -> Result<()> {
///     Err(DialerError::not_found(format!("trunk {}", trunk_id)))
/// }
///
/// match load_trunk("trunk-a") {
///     Err(DialerError::NotFound(msg)) => assert_eq!(msg, "trunk trunk-a"),
///     _ => unreachable!(),
/// }
/// ```
#[derive(Error, Debug)]
pub enum DialerError {
    /// Database operation errors
    ///
    /// Connection failures, SQL errors and migration problems with the SQLite store.
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration validation and parsing errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A campaign, attempt, trunk or job could not be located
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller-supplied input failed validation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Failures reported by a signaling adapter or route provider
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// JSON encoding/decoding of persisted payloads
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Unexpected internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for DialerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound(err.to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DialerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(format!("migration failed: {}", err))
    }
}

impl From<serde_json::Error> for DialerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for DialerError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<anyhow::Error> for DialerError {
    fn from(err: anyhow::Error) -> Self {
        // Adapter errors arrive as anyhow; keep the full context chain.
        Self::Internal(format!("{:#}", err))
    }
}

impl DialerError {
    /// Create a new Database error with the provided message
    pub fn database<S: Into<String>>(msg: S) -> Self {
        Self::Database(msg.into())
    }

    /// Create a new Configuration error with the provided message
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new NotFound error with the provided message
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new InvalidInput error with the provided message
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new Signaling error with the provided message
    pub fn signaling<S: Into<String>>(msg: S) -> Self {
        Self::Signaling(msg.into())
    }
}

/// Result type for dialer operations
pub type Result<T> = std::result::Result<T, DialerError>;
