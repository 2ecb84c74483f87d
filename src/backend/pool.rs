//! Per-backend connection pool: at most one live connection.
//!
//! The slot mutex doubles as the claim token, so a second claimer blocks
//! until the holder releases or the claim deadline passes. A connection
//! that saw a query timeout or protocol error is destroyed on the next
//! claim (or explicitly via `PoolHandle::close`), and the claim path
//! reconnects with exponential backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sqlx::postgres::PgConnectOptions;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::backend::client::PgClient;
use crate::error::{Error, Result};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

pub struct BackendPool {
    backend: String,
    opts: PgConnectOptions,
    connect_timeout: Duration,
    connect_retries: u32,
    slot: Arc<Mutex<Option<PgClient>>>,
    stopping: AtomicBool,
}

/// An exclusive claim on the backend's connection. Dropping the handle
/// releases the connection back to the pool; `close` destroys it instead.
#[derive(Debug)]
pub struct PoolHandle {
    guard: OwnedMutexGuard<Option<PgClient>>,
}

impl PoolHandle {
    pub fn client(&mut self) -> &mut PgClient {
        // The claim path only hands out a populated slot.
        self.guard
            .as_mut()
            .expect("claimed pool handle holds a connection")
    }

    /// Destroy the connection instead of releasing it.
    pub async fn close(mut self) {
        if let Some(mut client) = self.guard.take() {
            client.destroy().await;
        }
    }
}

impl BackendPool {
    pub fn new(
        backend: &str,
        opts: PgConnectOptions,
        connect_timeout: Duration,
        connect_retries: u32,
    ) -> Self {
        Self {
            backend: backend.to_string(),
            opts,
            connect_timeout,
            connect_retries,
            slot: Arc::new(Mutex::new(None)),
            stopping: AtomicBool::new(false),
        }
    }

    /// Claim the connection, reconnecting if necessary. The whole attempt
    /// (waiting out a holder, backoff, handshakes) is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// `Error::PoolStopping` once `stop` has been called,
    /// `Error::ClaimTimeout` when the deadline passes first, and
    /// `Error::PoolFailed` when every reconnect attempt failed.
    pub async fn claim(&self, timeout: Duration) -> Result<PoolHandle> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(Error::PoolStopping {
                backend: self.backend.clone(),
            });
        }

        match tokio::time::timeout(timeout, self.claim_inner()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ClaimTimeout {
                backend: self.backend.clone(),
                timeout,
            }),
        }
    }

    async fn claim_inner(&self) -> Result<PoolHandle> {
        let mut guard = Arc::clone(&self.slot).lock_owned().await;

        if self.stopping.load(Ordering::SeqCst) {
            if let Some(mut client) = guard.take() {
                client.destroy().await;
            }
            return Err(Error::PoolStopping {
                backend: self.backend.clone(),
            });
        }

        if let Some(client) = guard.as_ref() {
            if !client.is_destroyed() && !client.had_error() {
                return Ok(PoolHandle { guard });
            }
        }
        if let Some(mut client) = guard.take() {
            debug!(backend = %self.backend, "discarding broken connection");
            client.destroy().await;
        }

        let mut backoff = BACKOFF_INITIAL;
        let mut last_error = String::new();
        for attempt in 0..=self.connect_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
            match PgClient::connect(&self.backend, &self.opts, self.connect_timeout).await {
                Ok(client) => {
                    *guard = Some(client);
                    return Ok(PoolHandle { guard });
                }
                Err(error) => {
                    warn!(
                        backend = %self.backend,
                        attempt,
                        retries = self.connect_retries,
                        %error,
                        "reconnect attempt failed"
                    );
                    last_error = error.to_string();
                }
            }
        }

        Err(Error::PoolFailed {
            backend: self.backend.clone(),
            reason: last_error,
        })
    }

    /// Refuse further claims and destroy the cached connection if idle. A
    /// connection that is currently claimed is destroyed by its holder once
    /// it observes the stopping flag.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = Arc::clone(&self.slot).try_lock_owned() {
            if let Some(mut client) = guard.take() {
                client.destroy().await;
            }
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_pool(retries: u32) -> BackendPool {
        // Discard port: connections fail fast, no Postgres required.
        let opts = PgConnectOptions::new()
            .host("127.0.0.1")
            .port(9)
            .username("nobody")
            .database("none");
        BackendPool::new("test", opts, Duration::from_millis(500), retries)
    }

    #[tokio::test]
    async fn test_claim_surfaces_pool_failed() {
        let pool = unreachable_pool(0);
        let err = pool.claim(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::PoolFailed { .. }));
    }

    #[tokio::test]
    async fn test_claim_times_out_during_backoff() {
        // One retry forces a 1s backoff sleep, longer than the claim bound.
        let pool = unreachable_pool(1);
        let err = pool.claim(Duration::from_millis(700)).await.unwrap_err();
        assert!(matches!(err, Error::ClaimTimeout { .. }));
    }

    #[tokio::test]
    async fn test_stopped_pool_refuses_claims() {
        let pool = unreachable_pool(0);
        pool.stop().await;
        let err = pool.claim(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::PoolStopping { .. }));
        assert!(pool.is_stopping());
    }
}
