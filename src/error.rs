use std::time::Duration;

use thiserror::Error;

/// Tagged error taxonomy the engine matches on.
///
/// Only `Config` is fatal, and only at startup. Everything else is a
/// per-tick or per-query condition that is counted, logged, and survived.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("connect to {backend} failed: {source}")]
    Connect {
        backend: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("pool for {backend} failed: {reason}")]
    PoolFailed { backend: String, reason: String },

    #[error("claim on {backend} timed out after {timeout:?}")]
    ClaimTimeout { backend: String, timeout: Duration },

    #[error("pool for {backend} is stopping")]
    PoolStopping { backend: String },

    #[error("query {query} on {backend} timed out after {timeout:?}")]
    QueryTimeout {
        backend: String,
        query: String,
        timeout: Duration,
    },

    #[error("query {query} on {backend} failed: {source}")]
    Query {
        backend: String,
        query: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("column {column} of {query} is not a number")]
    NaNValue { query: String, column: String },

    #[error("column {column} of {query} is null")]
    NullValue { query: String, column: String },

    #[error("{backend} is in recovery")]
    PostgresInRecovery { backend: String },
}

impl Error {
    /// Claim-path errors are all reported through `pg_connect_error`.
    pub fn is_claim_failure(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. }
                | Error::PoolFailed { .. }
                | Error::ClaimTimeout { .. }
                | Error::PoolStopping { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
