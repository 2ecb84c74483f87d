//! Declarative catalog of introspection queries.
//!
//! The catalog is a data literal (`queries.rs`) validated against the query
//! schema on every resolution, plus a pure version-dispatch step that picks
//! the SQL variant applicable to a backend's `server_version_num`.

use std::collections::HashSet;
use std::time::Duration;

use tracing::debug;

use crate::config::is_valid_label_name;
use crate::error::{Error, Result};

mod queries;

/// Extra slack added to the poll interval before a transient gauge expires.
const EXPIRY_SLACK_MS: u64 = 30_000;

/// One counter or gauge derived from a result-row column.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    /// Result column holding the numeric value.
    pub attr: &'static str,
    pub help: &'static str,
    pub unit: Option<&'static str>,
    /// Transient series: evicted when not refreshed within the expiry period.
    pub expires: bool,
}

impl MetricDef {
    pub const fn new(attr: &'static str, help: &'static str) -> Self {
        Self {
            attr,
            help,
            unit: None,
            expires: false,
        }
    }

    pub const fn with_unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    pub const fn expiring(mut self) -> Self {
        self.expires = true;
        self
    }
}

/// SQL for a query: one statement for every version, or a table of
/// `(min_version_num, sql)` variants.
#[derive(Debug, Clone)]
pub enum VersionedSql {
    All(String),
    Versioned(Vec<(u32, String)>),
}

/// A catalog entry before version resolution.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub name: &'static str,
    /// Column whose value identifies a row across ticks. When absent the
    /// query yields exactly one synthetic row keyed by the query name.
    pub statkey: Option<&'static str>,
    /// Result columns copied into metric labels.
    pub metadata_columns: &'static [&'static str],
    pub sql: VersionedSql,
    pub counters: &'static [MetricDef],
    pub gauges: &'static [MetricDef],
}

/// A version-resolved query ready to run against one backend.
#[derive(Debug, Clone)]
pub struct Query {
    pub name: &'static str,
    pub statkey: Option<&'static str>,
    pub metadata_columns: &'static [&'static str],
    pub sql: String,
    pub counters: &'static [MetricDef],
    pub gauges: &'static [MetricDef],
    /// Eviction period for gauges marked `expires`.
    pub gauge_expiry: Duration,
}

impl Query {
    /// `<query.name>_<attr>[_<unit>]`
    pub fn metric_name(&self, def: &MetricDef) -> String {
        match def.unit {
            Some(unit) => format!("{}_{}_{}", self.name, def.attr, unit),
            None => format!("{}_{}", self.name, def.attr),
        }
    }

    /// Histogram of query wall-clock time, observed in milliseconds.
    pub fn querytime_metric(&self) -> String {
        format!("{}_querytime_ms", self.name)
    }
}

/// The canonical list of statistics pgstatsmon knows how to derive.
#[derive(Debug, Clone)]
pub struct Catalog {
    specs: Vec<QuerySpec>,
}

impl Catalog {
    /// Build the catalog. `schemata` is the schema allow-list for the
    /// relation size query.
    pub fn new(schemata: &[String]) -> Self {
        Self {
            specs: queries::specs(schemata),
        }
    }

    /// Resolve the queries applicable to a backend reporting
    /// `server_version_num`, with transient-gauge expiry derived from the
    /// poll interval.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the catalog violates the query schema.
    pub fn get_applicable_queries(
        &self,
        server_version_num: u32,
        poll_interval_ms: u64,
    ) -> Result<Vec<Query>> {
        self.validate()?;

        let gauge_expiry = Duration::from_millis(poll_interval_ms + EXPIRY_SLACK_MS);
        let mut out = Vec::with_capacity(self.specs.len());

        for spec in &self.specs {
            let sql = match &spec.sql {
                VersionedSql::All(sql) => Some(sql.clone()),
                VersionedSql::Versioned(variants) => variants
                    .iter()
                    .filter(|(min, _)| *min <= server_version_num)
                    .max_by_key(|(min, _)| *min)
                    .map(|(_, sql)| sql.clone()),
            };

            match sql {
                Some(sql) => out.push(Query {
                    name: spec.name,
                    statkey: spec.statkey,
                    metadata_columns: spec.metadata_columns,
                    sql,
                    counters: spec.counters,
                    gauges: spec.gauges,
                    gauge_expiry,
                }),
                None => {
                    debug!(
                        query = spec.name,
                        server_version_num, "no SQL variant applicable, skipping query"
                    );
                }
            }
        }

        Ok(out)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for spec in &self.specs {
            if spec.name.is_empty() {
                return Err(Error::Config("catalog query with empty name".into()));
            }
            if !names.insert(spec.name) {
                return Err(Error::Config(format!(
                    "duplicate catalog query name {:?}",
                    spec.name
                )));
            }

            match &spec.sql {
                VersionedSql::All(sql) => {
                    if sql.trim().is_empty() {
                        return Err(Error::Config(format!("query {} has empty SQL", spec.name)));
                    }
                }
                VersionedSql::Versioned(variants) => {
                    if variants.is_empty() {
                        return Err(Error::Config(format!(
                            "query {} has no SQL variants",
                            spec.name
                        )));
                    }
                    let mut versions = HashSet::new();
                    for (min, sql) in variants {
                        if !versions.insert(*min) {
                            return Err(Error::Config(format!(
                                "query {} repeats version threshold {min}",
                                spec.name
                            )));
                        }
                        if sql.trim().is_empty() {
                            return Err(Error::Config(format!(
                                "query {} has empty SQL at version {min}",
                                spec.name
                            )));
                        }
                    }
                }
            }

            let mut attrs = HashSet::new();
            for def in spec.counters.iter().chain(spec.gauges) {
                if !attrs.insert(def.attr) {
                    return Err(Error::Config(format!(
                        "query {} defines attr {:?} twice",
                        spec.name, def.attr
                    )));
                }
                let metric = match def.unit {
                    Some(unit) => format!("{}_{}_{}", spec.name, def.attr, unit),
                    None => format!("{}_{}", spec.name, def.attr),
                };
                if !is_valid_metric_name(&metric) {
                    return Err(Error::Config(format!(
                        "query {} yields invalid metric name {metric:?}",
                        spec.name
                    )));
                }
            }
            for def in spec.counters {
                if def.expires {
                    return Err(Error::Config(format!(
                        "query {} marks counter {:?} as expiring; only gauges expire",
                        spec.name, def.attr
                    )));
                }
            }

            let mut labels = HashSet::new();
            for column in spec.metadata_columns {
                if !labels.insert(*column) {
                    return Err(Error::Config(format!(
                        "query {} repeats metadata column {column:?}",
                        spec.name
                    )));
                }
                if !is_valid_label_name(column) {
                    return Err(Error::Config(format!(
                        "query {} metadata column {column:?} is not a valid label name",
                        spec.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
