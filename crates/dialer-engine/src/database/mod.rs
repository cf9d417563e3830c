//! # Dialer Database (sqlx + SQLite)
//!
//! [`DialerDatabase`] owns the connection pool and is cheap to clone; every subsystem
//! holds its own clone. Operations are grouped by table in the submodules, each adding
//! methods to `DialerDatabase`.
//!
//! Anything that must be exactly-once (lead reservation, timer claiming, job claiming,
//! state transitions) is a single conditional statement or a transaction whose first
//! statement is a write, so concurrent engines sharing one database file serialize on
//! SQLite's write lock instead of racing on a read.
//!
//! Columns compared against "now" are integer milliseconds (`*_ms`); audit timestamps are
//! fixed-width RFC 3339 text in UTC (see [`ts`]).

pub mod agents;
pub mod attempts;
pub mod campaigns;
pub mod jobs;
pub mod leads;
pub mod metrics;
pub mod timers;
pub mod trunks;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::Result;

pub use agents::{AgentStatus, DbAgent};
pub use attempts::{AttemptTransition, NewAttempt};
pub use jobs::{JobStatus, OriginateJob};
pub use metrics::DialCounts;
pub use leads::{Lead, LeadStatus, NewLead, ReservationPolicy, ReservedLead};

/// Shared handle to the dialer's persistent store
#[derive(Clone)]
pub struct DialerDatabase {
    pool: SqlitePool,
}

impl DialerDatabase {
    /// Connect to `database_url` and apply migrations
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, 5).await
    }

    /// Create an in-memory database, mainly for tests
    pub async fn new_in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::connect(&config.url, config.max_connections).await
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Initializing dialer database: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        // Every connection to ":memory:" is its own database, so keep exactly one alive.
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("Dialer database ready (in_memory={})", in_memory);
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a new database transaction
    pub async fn begin_transaction(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn health_check(&self) -> Result<bool> {
        let ok = sqlx::query("SELECT 1").execute(&self.pool).await.is_ok();
        debug!("Database health check: {}", ok);
        Ok(ok)
    }
}

/// Fixed-width UTC text form, so stored timestamps compare correctly as strings
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub(crate) fn parse_timestamp(text: Option<String>) -> Option<DateTime<Utc>> {
    text.and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_migrates() {
        let db = DialerDatabase::new_in_memory().await.unwrap();
        assert!(db.health_check().await.unwrap());

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM call_attempts")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }

    #[test]
    fn test_ms_round_trip() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(from_ms(to_ms(at)), at);
    }
}
