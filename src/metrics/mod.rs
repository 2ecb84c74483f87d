//! In-memory metric model feeding the scrape endpoint.
//!
//! Families are created on first use, keyed by metric name, and registered
//! with a single prometheus `Registry` owned by this value. The exposer
//! only ever reads; worker tasks only ever write. Gauges may carry an
//! expiry: series not refreshed within their period are evicted before the
//! next render.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub mod exposer;

/// Prometheus text exposition format, version 0.0.4.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

enum Family {
    Counter {
        vec: CounterVec,
        labels: Vec<String>,
    },
    Gauge {
        vec: GaugeVec,
        labels: Vec<String>,
        expiry: Option<Duration>,
        last_set: HashMap<Vec<String>, Instant>,
    },
    Histogram {
        vec: HistogramVec,
        labels: Vec<String>,
    },
}

impl Family {
    fn kind(&self) -> &'static str {
        match self {
            Family::Counter { .. } => "counter",
            Family::Gauge { .. } => "gauge",
            Family::Histogram { .. } => "histogram",
        }
    }

    fn labels(&self) -> &[String] {
        match self {
            Family::Counter { labels, .. }
            | Family::Gauge { labels, .. }
            | Family::Histogram { labels, .. } => labels,
        }
    }
}

pub struct MetricRegistry {
    registry: Registry,
    const_labels: HashMap<String, String>,
    families: Mutex<HashMap<String, Family>>,
}

impl MetricRegistry {
    /// `fixed_labels` are applied to every series as prometheus const
    /// labels.
    pub fn new(fixed_labels: &BTreeMap<String, String>) -> Self {
        Self {
            registry: Registry::new(),
            const_labels: fixed_labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            families: Mutex::new(HashMap::new()),
        }
    }

    fn opts(&self, name: &str, help: &str) -> Opts {
        Opts::new(name, help).const_labels(self.const_labels.clone())
    }

    fn check(family: &Family, kind: &'static str, label_names: &[&str]) -> Result<()> {
        if family.kind() != kind {
            return Err(Error::Config(format!(
                "metric registered as {} cannot be used as {kind}",
                family.kind()
            )));
        }
        if family.labels() != label_names {
            return Err(Error::Config(format!(
                "metric label set {:?} does not match registered {:?}",
                label_names,
                family.labels()
            )));
        }
        Ok(())
    }

    /// Create the counter family if it does not exist yet, so built-in
    /// series are present from startup.
    pub fn ensure_counter(&self, name: &str, help: &str, label_names: &[&str]) -> Result<()> {
        let mut families = self.families.lock().expect("metric registry lock");
        if let Some(family) = families.get(name) {
            return Self::check(family, "counter", label_names);
        }
        let vec = CounterVec::new(self.opts(name, help), label_names)
            .map_err(|e| Error::Config(format!("counter {name}: {e}")))?;
        self.registry
            .register(Box::new(vec.clone()))
            .map_err(|e| Error::Config(format!("counter {name}: {e}")))?;
        families.insert(
            name.to_string(),
            Family::Counter {
                vec,
                labels: label_names.iter().map(|s| (*s).to_string()).collect(),
            },
        );
        Ok(())
    }

    pub fn ensure_histogram(&self, name: &str, help: &str, label_names: &[&str]) -> Result<()> {
        let mut families = self.families.lock().expect("metric registry lock");
        if let Some(family) = families.get(name) {
            return Self::check(family, "histogram", label_names);
        }
        let opts = HistogramOpts::new(name, help).const_labels(self.const_labels.clone());
        let vec = HistogramVec::new(opts, label_names)
            .map_err(|e| Error::Config(format!("histogram {name}: {e}")))?;
        self.registry
            .register(Box::new(vec.clone()))
            .map_err(|e| Error::Config(format!("histogram {name}: {e}")))?;
        families.insert(
            name.to_string(),
            Family::Histogram {
                vec,
                labels: label_names.iter().map(|s| (*s).to_string()).collect(),
            },
        );
        Ok(())
    }

    /// Add a strictly non-negative delta to a counter series.
    pub fn add_counter(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        label_values: &[&str],
        delta: f64,
    ) -> Result<()> {
        if delta < 0.0 || delta.is_nan() {
            warn!(metric = name, delta, "refusing negative or NaN counter delta");
            return Ok(());
        }
        self.ensure_counter(name, help, label_names)?;
        let families = self.families.lock().expect("metric registry lock");
        if let Some(Family::Counter { vec, .. }) = families.get(name) {
            vec.with_label_values(label_values).inc_by(delta);
        }
        Ok(())
    }

    /// Set a gauge series, optionally arming expiry: the series is evicted
    /// if not set again within `expiry`.
    pub fn set_gauge(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        label_values: &[&str],
        value: f64,
        expiry: Option<Duration>,
    ) -> Result<()> {
        let mut families = self.families.lock().expect("metric registry lock");
        if let Some(family) = families.get(name) {
            Self::check(family, "gauge", label_names)?;
        } else {
            let vec = GaugeVec::new(self.opts(name, help), label_names)
                .map_err(|e| Error::Config(format!("gauge {name}: {e}")))?;
            self.registry
                .register(Box::new(vec.clone()))
                .map_err(|e| Error::Config(format!("gauge {name}: {e}")))?;
            families.insert(
                name.to_string(),
                Family::Gauge {
                    vec,
                    labels: label_names.iter().map(|s| (*s).to_string()).collect(),
                    expiry,
                    last_set: HashMap::new(),
                },
            );
        }

        if let Some(Family::Gauge { vec, last_set, expiry, .. }) = families.get_mut(name) {
            vec.with_label_values(label_values).set(value);
            if expiry.is_some() {
                let key: Vec<String> = label_values.iter().map(|s| (*s).to_string()).collect();
                last_set.insert(key, Instant::now());
            }
        }
        Ok(())
    }

    /// Record a histogram observation (milliseconds on the wire for query
    /// timings; the default bucket layout is kept).
    pub fn observe(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        label_values: &[&str],
        value: f64,
    ) -> Result<()> {
        self.ensure_histogram(name, help, label_names)?;
        let families = self.families.lock().expect("metric registry lock");
        if let Some(Family::Histogram { vec, .. }) = families.get(name) {
            vec.with_label_values(label_values).observe(value);
        }
        Ok(())
    }

    /// Evict gauge series that have outlived their expiry period.
    pub fn sweep_expired(&self) {
        let mut families = self.families.lock().expect("metric registry lock");
        let now = Instant::now();
        for (name, family) in families.iter_mut() {
            let Family::Gauge {
                vec,
                expiry: Some(expiry),
                last_set,
                ..
            } = family
            else {
                continue;
            };
            let expiry = *expiry;
            last_set.retain(|values, set_at| {
                if now.duration_since(*set_at) <= expiry {
                    return true;
                }
                let refs: Vec<&str> = values.iter().map(String::as_str).collect();
                if let Err(error) = vec.remove_label_values(&refs) {
                    debug!(metric = %name, %error, "expired series already gone");
                }
                debug!(metric = %name, ?values, "expired gauge series");
                false
            });
        }
    }

    /// Render the current state in Prometheus text format. Read-only apart
    /// from the expiry sweep: rendering never triggers collection.
    pub fn render(&self) -> Result<String> {
        self.sweep_expired();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| Error::Config(format!("failed to encode metrics: {e}")))?;
        String::from_utf8(buffer).map_err(|e| Error::Config(format!("metrics not UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MetricRegistry {
        let mut fixed = BTreeMap::new();
        fixed.insert("datacenter".to_string(), "dc1".to_string());
        MetricRegistry::new(&fixed)
    }

    #[test]
    fn test_counter_accumulates() {
        let metrics = registry();
        metrics
            .add_counter("pg_test_total", "help", &["backend"], &["b1"], 2.0)
            .unwrap();
        metrics
            .add_counter("pg_test_total", "help", &["backend"], &["b1"], 3.0)
            .unwrap();

        let body = metrics.render().unwrap();
        assert!(body.contains("# TYPE pg_test_total counter"));
        assert!(body.contains(r#"pg_test_total{backend="b1",datacenter="dc1"} 5"#));
    }

    #[test]
    fn test_negative_delta_ignored() {
        let metrics = registry();
        metrics
            .add_counter("pg_test_total", "help", &["backend"], &["b1"], 1.0)
            .unwrap();
        metrics
            .add_counter("pg_test_total", "help", &["backend"], &["b1"], -4.0)
            .unwrap();

        let body = metrics.render().unwrap();
        assert!(body.contains(r#"pg_test_total{backend="b1",datacenter="dc1"} 1"#));
    }

    #[test]
    fn test_gauge_sets_latest_value() {
        let metrics = registry();
        metrics
            .set_gauge("pg_live", "help", &["backend"], &["b1"], 7.0, None)
            .unwrap();
        metrics
            .set_gauge("pg_live", "help", &["backend"], &["b1"], 4.0, None)
            .unwrap();

        let body = metrics.render().unwrap();
        assert!(body.contains(r#"pg_live{backend="b1",datacenter="dc1"} 4"#));
    }

    #[test]
    fn test_kind_conflict_rejected() {
        let metrics = registry();
        metrics
            .add_counter("pg_thing", "help", &["backend"], &["b1"], 1.0)
            .unwrap();
        let err = metrics
            .set_gauge("pg_thing", "help", &["backend"], &["b1"], 1.0, None)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_label_mismatch_rejected() {
        let metrics = registry();
        metrics
            .add_counter("pg_thing", "help", &["backend"], &["b1"], 1.0)
            .unwrap();
        let err = metrics
            .add_counter("pg_thing", "help", &["backend", "query"], &["b1", "q"], 1.0)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_expiring_gauge_is_evicted() {
        let metrics = registry();
        metrics
            .set_gauge(
                "pg_vacuum_progress",
                "help",
                &["backend"],
                &["b1"],
                1.0,
                Some(Duration::from_millis(0)),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let body = metrics.render().unwrap();
        assert!(!body.contains(r#"pg_vacuum_progress{"#));
    }

    #[test]
    fn test_non_expiring_gauge_survives_sweep() {
        let metrics = registry();
        metrics
            .set_gauge("pg_live", "help", &["backend"], &["b1"], 1.0, None)
            .unwrap();
        metrics.sweep_expired();

        let body = metrics.render().unwrap();
        assert!(body.contains("pg_live{"));
    }

    #[test]
    fn test_histogram_renders_buckets() {
        let metrics = registry();
        metrics
            .observe("pg_q_querytime_ms", "help", &["backend"], &["b1"], 12.0)
            .unwrap();

        let body = metrics.render().unwrap();
        assert!(body.contains("# TYPE pg_q_querytime_ms histogram"));
        assert!(body.contains("pg_q_querytime_ms_bucket"));
        assert!(body.contains("pg_q_querytime_ms_count"));
    }

    #[test]
    fn test_render_is_stable_without_updates() {
        let metrics = registry();
        metrics
            .set_gauge("pg_live", "help", &["backend"], &["b1"], 3.0, None)
            .unwrap();

        let first = metrics.render().unwrap();
        let second = metrics.render().unwrap();
        assert_eq!(first, second);
    }
}
