//! Collection engine.
//!
//! Owns the per-backend registry, the tick scheduler, and the bounded
//! fan-out over backends. Backends are cooperative internally (their
//! queries run sequentially on the single pooled connection) and parallel
//! across each other up to [`FANOUT`] at a time. A tick never queues up
//! behind a slow backend: a backend whose previous collection is still
//! running is skipped with a warning and a counter bump.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::client::{PgClient, StatRow};
use crate::backend::pool::BackendPool;
use crate::backend::{Backend, bootstrap};
use crate::catalog::{Catalog, Query};
use crate::config::Config;
use crate::discovery::{self, DiscoveryEvent};
use crate::error::Error;
use crate::metrics::{MetricRegistry, exposer};

pub mod recorder;

/// Backends collected in parallel at any instant.
pub const FANOUT: usize = 10;

const QUERY_COUNT_METRIC: &str = "pg_query_count";
const QUERY_COUNT_HELP: &str = "Number of queries issued";
const QUERY_ERROR_METRIC: &str = "pg_query_error";
const QUERY_ERROR_HELP: &str = "Number of queries that failed";
const QUERY_TIMEOUT_METRIC: &str = "pg_query_timeout";
const QUERY_TIMEOUT_HELP: &str = "Number of queries that exceeded the query deadline";
const CONNECT_ERROR_METRIC: &str = "pg_connect_error";
const CONNECT_ERROR_HELP: &str = "Number of failed attempts to claim a backend connection";
const TICK_SKIPPED_METRIC: &str = "pg_tick_skipped";
const TICK_SKIPPED_HELP: &str = "Number of ticks skipped because the previous one was still running";

/// Per-backend runtime state. Owned by the engine's backend map; only the
/// task currently collecting this backend touches the mutable parts.
pub struct BackendState {
    backend: Backend,
    pool: BackendPool,
    needs_setup: AtomicBool,
    setting_up: AtomicBool,
    standby: AtomicBool,
    busy: AtomicBool,
    queries: std::sync::RwLock<Arc<Vec<Query>>>,
    last_rows: std::sync::Mutex<HashMap<&'static str, HashMap<String, StatRow>>>,
    in_flight: std::sync::Mutex<HashMap<&'static str, Instant>>,
}

impl BackendState {
    fn new(backend: Backend, config: &Config) -> Self {
        let pool = BackendPool::new(
            &backend.display_name,
            backend.connect_options(&config.user),
            config.connect_timeout(),
            config.connections.connect_retries,
        );
        Self {
            backend,
            pool,
            needs_setup: AtomicBool::new(true),
            setting_up: AtomicBool::new(false),
            standby: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            queries: std::sync::RwLock::new(Arc::new(Vec::new())),
            last_rows: std::sync::Mutex::new(HashMap::new()),
            in_flight: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn display_name(&self) -> &str {
        &self.backend.display_name
    }

    pub fn needs_setup(&self) -> bool {
        self.needs_setup.load(Ordering::SeqCst)
    }

    pub fn is_standby(&self) -> bool {
        self.standby.load(Ordering::SeqCst)
    }
}

enum QueryOutcome {
    Done,
    Timeout,
    Failed,
}

struct Inner {
    config: Config,
    catalog: Catalog,
    metrics: Arc<MetricRegistry>,
    backends: Mutex<HashMap<String, Arc<BackendState>>>,
    fanout: Arc<Semaphore>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// # Errors
    ///
    /// Returns an error if the configuration or catalog is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let catalog = Catalog::new(&config.schemata);
        // Validate the catalog before the first backend shows up.
        catalog.get_applicable_queries(0, config.interval)?;

        let metrics = Arc::new(MetricRegistry::new(&config.target.metadata));
        metrics.ensure_counter(QUERY_COUNT_METRIC, QUERY_COUNT_HELP, &["backend"])?;
        metrics.ensure_counter(QUERY_ERROR_METRIC, QUERY_ERROR_HELP, &["backend", "query"])?;
        metrics.ensure_counter(
            QUERY_TIMEOUT_METRIC,
            QUERY_TIMEOUT_HELP,
            &["backend", "query"],
        )?;
        metrics.ensure_counter(CONNECT_ERROR_METRIC, CONNECT_ERROR_HELP, &["backend"])?;
        metrics.ensure_counter(
            recorder::NAN_ERROR_METRIC,
            recorder::NAN_ERROR_HELP,
            &["backend", "query", "name"],
        )?;
        metrics.ensure_counter(TICK_SKIPPED_METRIC, TICK_SKIPPED_HELP, &["backend"])?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                catalog,
                metrics,
                backends: Mutex::new(HashMap::new()),
                fanout: Arc::new(Semaphore::new(FANOUT)),
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn metrics(&self) -> Arc<MetricRegistry> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Bring up discovery, the tick timer, and the scrape endpoint.
    /// Returns the exposer's bound address once everything is running.
    ///
    /// # Errors
    ///
    /// Returns an error if the scrape endpoint cannot be bound.
    pub async fn start(&self) -> Result<std::net::SocketAddr> {
        let (mut events, discovery_handle) = discovery::spawn(&self.inner.config);
        let engine = self.clone();
        let event_handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                engine.handle_event(event).await;
            }
        });

        let listener =
            exposer::bind(&self.inner.config.target.ip, self.inner.config.target.port).await?;
        let addr = listener.local_addr()?;
        let route = self.inner.config.target.route.clone();
        let registry = Arc::clone(&self.inner.metrics);
        let exposer_handle = tokio::spawn(async move {
            if let Err(error) = exposer::serve(listener, &route, registry).await {
                error!(%error, "scrape endpoint failed");
            }
        });

        let engine = self.clone();
        let ticker_handle = tokio::spawn(async move {
            let mut ticker = time::interval(engine.inner.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Ticks fire on the wall clock; a slow round must not delay
                // the next one. Busy backends are skipped inside tick().
                let engine = engine.clone();
                tokio::spawn(async move { engine.tick().await });
            }
        });

        let mut tasks = self.inner.tasks.lock().expect("tasks lock");
        tasks.extend([discovery_handle, event_handle, exposer_handle, ticker_handle]);
        drop(tasks);

        info!(%addr, interval_ms = self.inner.config.interval, "collection engine started");
        Ok(addr)
    }

    /// Apply one discovery event.
    pub async fn handle_event(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Added { key, backend } => {
                info!(key = %key, backend = %backend.display_name, "backend added");
                let state = Arc::new(BackendState::new(backend, &self.inner.config));
                let previous = self
                    .inner
                    .backends
                    .lock()
                    .await
                    .insert(key.clone(), Arc::clone(&state));
                if let Some(previous) = previous {
                    warn!(key = %key, "backend re-added, replacing previous state");
                    previous.pool.stop().await;
                }
                self.schedule_setup(state);
            }
            DiscoveryEvent::Removed { key } => {
                let state = self.inner.backends.lock().await.remove(&key);
                match state {
                    Some(state) => {
                        info!(key = %key, backend = %state.backend.display_name, "backend removed");
                        tokio::spawn(Self::teardown(state));
                    }
                    None => debug!(key = %key, "removal for unknown backend"),
                }
            }
        }
    }

    /// One collection round over every known backend.
    #[instrument(skip(self), level = "debug")]
    pub async fn tick(&self) {
        let states: Vec<Arc<BackendState>> = self
            .inner
            .backends
            .lock()
            .await
            .values()
            .cloned()
            .collect();

        let mut tasks = JoinSet::new();
        for state in states {
            if state.standby.load(Ordering::SeqCst) {
                debug!(backend = %state.backend.display_name, "skipping standby");
                continue;
            }
            if state.needs_setup.load(Ordering::SeqCst) {
                self.schedule_setup(Arc::clone(&state));
                continue;
            }
            if state.busy.swap(true, Ordering::SeqCst) {
                warn!(
                    backend = %state.backend.display_name,
                    "previous collection still pending, skipping backend this tick"
                );
                let _ = self.inner.metrics.add_counter(
                    TICK_SKIPPED_METRIC,
                    TICK_SKIPPED_HELP,
                    &["backend"],
                    &[state.backend.display_name.as_str()],
                    1.0,
                );
                continue;
            }

            let engine = self.clone();
            tasks.spawn(async move {
                if let Ok(_permit) = Arc::clone(&engine.inner.fanout).acquire_owned().await {
                    engine.collect_backend(&state).await;
                }
                state.busy.store(false, Ordering::SeqCst);
            });
        }

        while tasks.join_next().await.is_some() {}
    }

    /// Cancel the timer, stop discovery, close pools, and shut the scrape
    /// endpoint down.
    pub async fn stop(&self) {
        info!("stopping collection engine");
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().expect("tasks lock");
            tasks.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
        }

        let states: Vec<Arc<BackendState>> = {
            let mut backends = self.inner.backends.lock().await;
            backends.drain().map(|(_, state)| state).collect()
        };
        for state in states {
            state.pool.stop().await;
        }
    }

    pub async fn backend_count(&self) -> usize {
        self.inner.backends.lock().await.len()
    }

    pub async fn backend(&self, key: &str) -> Option<Arc<BackendState>> {
        self.inner.backends.lock().await.get(key).cloned()
    }

    fn schedule_setup(&self, state: Arc<BackendState>) {
        if state.setting_up.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move { engine.setup_backend(state).await });
    }

    async fn setup_backend(&self, state: Arc<BackendState>) {
        let backend = state.backend.display_name.clone();
        match bootstrap::setup(&self.inner.config, &state.backend).await {
            Ok(server_version) => {
                match self
                    .inner
                    .catalog
                    .get_applicable_queries(server_version, self.inner.config.interval)
                {
                    Ok(queries) => {
                        info!(
                            backend = %backend,
                            server_version,
                            queries = queries.len(),
                            "backend ready for collection"
                        );
                        *state.queries.write().expect("queries lock") = Arc::new(queries);
                        state.needs_setup.store(false, Ordering::SeqCst);
                    }
                    Err(error) => {
                        error!(backend = %backend, %error, "catalog resolution failed");
                    }
                }
            }
            Err(Error::PostgresInRecovery { .. }) => {
                warn!(
                    backend = %backend,
                    "backend is a standby; collection disabled until it is re-discovered"
                );
                state.standby.store(true, Ordering::SeqCst);
                state.needs_setup.store(false, Ordering::SeqCst);
            }
            Err(error) => {
                warn!(backend = %backend, %error, "backend setup failed, will retry next tick");
            }
        }
        state.setting_up.store(false, Ordering::SeqCst);
    }

    async fn collect_backend(&self, state: &Arc<BackendState>) {
        let backend = state.backend.display_name.as_str();

        let mut handle = match state
            .pool
            .claim(self.inner.config.connect_timeout())
            .await
        {
            Ok(handle) => handle,
            Err(error) => {
                if matches!(error, Error::PoolStopping { .. }) {
                    debug!(backend, %error, "pool stopping, skipping collection");
                } else {
                    warn!(backend, %error, "could not claim connection");
                }
                if error.is_claim_failure() {
                    let _ = self.inner.metrics.add_counter(
                        CONNECT_ERROR_METRIC,
                        CONNECT_ERROR_HELP,
                        &["backend"],
                        &[backend],
                        1.0,
                    );
                }
                return;
            }
        };

        let queries = state.queries.read().expect("queries lock").clone();
        let mut timed_out = false;
        for query in queries.iter() {
            match self.run_query(state, handle.client(), query).await {
                QueryOutcome::Done => {}
                QueryOutcome::Timeout => {
                    timed_out = true;
                    debug!(backend, "abandoning remaining queries after timeout");
                    break;
                }
                QueryOutcome::Failed => {
                    if handle.client().had_error() {
                        warn!(backend, "connection unusable, abandoning remaining queries");
                        break;
                    }
                }
            }
        }

        if timed_out || handle.client().had_error() {
            // Do not release a connection that blew its deadline; the pool
            // reconnects on the next claim.
            handle.close().await;
        }
    }

    async fn run_query(
        &self,
        state: &BackendState,
        client: &mut PgClient,
        query: &Query,
    ) -> QueryOutcome {
        let backend = state.backend.display_name.as_str();

        state
            .in_flight
            .lock()
            .expect("in_flight lock")
            .insert(query.name, Instant::now());
        let _ = self.inner.metrics.add_counter(
            QUERY_COUNT_METRIC,
            QUERY_COUNT_HELP,
            &["backend"],
            &[backend],
            1.0,
        );
        debug!(backend, query = query.name, "query start");

        let started = Instant::now();
        let result = client
            .query(query.name, &query.sql, self.inner.config.query_timeout())
            .await;
        state
            .in_flight
            .lock()
            .expect("in_flight lock")
            .remove(query.name);

        match result {
            Ok(rows) => {
                if client.is_destroyed() {
                    debug!(backend, query = query.name, "client destroyed, discarding rows");
                    return QueryOutcome::Failed;
                }
                {
                    let mut last_rows = state.last_rows.lock().expect("last_rows lock");
                    let entry = last_rows.entry(query.name).or_default();
                    recorder::record(&self.inner.metrics, backend, query, rows, entry);
                }
                let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
                if let Err(error) = self.inner.metrics.observe(
                    &query.querytime_metric(),
                    "Query wall-clock time in milliseconds",
                    &["backend"],
                    &[backend],
                    elapsed_ms,
                ) {
                    warn!(backend, query = query.name, %error, "failed to observe query time");
                }
                QueryOutcome::Done
            }
            Err(error @ Error::QueryTimeout { .. }) => {
                warn!(backend, query = query.name, %error, "query timed out");
                let _ = self.inner.metrics.add_counter(
                    QUERY_TIMEOUT_METRIC,
                    QUERY_TIMEOUT_HELP,
                    &["backend", "query"],
                    &[backend, query.name],
                    1.0,
                );
                QueryOutcome::Timeout
            }
            Err(error) => {
                warn!(backend, query = query.name, %error, "query failed");
                let _ = self.inner.metrics.add_counter(
                    QUERY_ERROR_METRIC,
                    QUERY_ERROR_HELP,
                    &["backend", "query"],
                    &[backend, query.name],
                    1.0,
                );
                QueryOutcome::Failed
            }
        }
    }

    async fn teardown(state: Arc<BackendState>) {
        let mut delay = Duration::from_secs(1);
        for _ in 0..2 {
            if state
                .in_flight
                .lock()
                .expect("in_flight lock")
                .is_empty()
            {
                break;
            }
            debug!(
                backend = %state.backend.display_name,
                "waiting for in-flight queries before teardown"
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
        if !state
            .in_flight
            .lock()
            .expect("in_flight lock")
            .is_empty()
        {
            warn!(
                backend = %state.backend.display_name,
                "tearing down with queries still in flight; results discarded"
            );
        }
        state.pool.stop().await;
    }
}
