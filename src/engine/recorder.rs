//! Delta recorder: turns buffered result rows into metric updates.
//!
//! Counters are recorded as deltas between successive observations of the
//! same row, so a row must be seen twice before its counters move. A
//! backwards step or a bumped `stats_reset` column marks a statistics
//! reset and the observation is skipped rather than recorded as a negative
//! delta. Gauges always reflect the latest observation.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::backend::client::{Cell, StatRow};
use crate::catalog::Query;
use crate::error::Error;
use crate::metrics::MetricRegistry;

pub(crate) const NAN_ERROR_METRIC: &str = "pg_NaN_error";
pub(crate) const NAN_ERROR_HELP: &str = "Number of samples that could not be parsed as a number";

/// Pull one numeric sample out of a row. NULL and unparseable cells come
/// back as the matching taxonomy error so callers can apply the right
/// emission policy.
fn sample(query: &str, row: &StatRow, attr: &str) -> Result<f64, Error> {
    let nan = || Error::NaNValue {
        query: query.to_string(),
        column: attr.to_string(),
    };
    match row.get(attr) {
        None => {
            // The catalog promised this column; the SQL did not deliver it.
            warn!(query, column = attr, "expected column missing from result row");
            Err(nan())
        }
        Some(Cell::Null) => Err(Error::NullValue {
            query: query.to_string(),
            column: attr.to_string(),
        }),
        Some(Cell::Number(v)) if v.is_nan() => Err(nan()),
        Some(Cell::Number(v)) => Ok(*v),
        Some(Cell::Text(s)) => match s.trim().parse::<f64>() {
            Ok(v) if !v.is_nan() => Ok(v),
            _ => Err(nan()),
        },
    }
}

/// Record one query's rows for one backend, replacing `prev_rows` with the
/// new observation.
pub fn record(
    metrics: &MetricRegistry,
    backend: &str,
    query: &Query,
    rows: Vec<StatRow>,
    prev_rows: &mut HashMap<String, StatRow>,
) {
    let mut new_rows = HashMap::with_capacity(rows.len());
    for row in rows {
        let key = match query.statkey {
            Some(statkey) => {
                let key = row.label(statkey);
                if key.is_empty() {
                    warn!(
                        query = query.name,
                        statkey, "row has no statkey value, dropping"
                    );
                    continue;
                }
                key
            }
            None => query.name.to_string(),
        };
        new_rows.insert(key, row);
    }

    let prev = std::mem::replace(prev_rows, new_rows);

    let mut label_names: Vec<&str> = query.metadata_columns.to_vec();
    label_names.push("backend");

    for (key, row) in prev_rows.iter() {
        let old_row = prev.get(key);

        if let Some(old_row) = old_row {
            if let (Some(new_reset), Some(old_reset)) =
                (row.number("stats_reset"), old_row.number("stats_reset"))
            {
                if new_reset > old_reset {
                    info!(
                        query = query.name,
                        row = %key,
                        backend,
                        "stats reset detected, skipping row this tick"
                    );
                    continue;
                }
            }
        } else {
            debug!(query = query.name, row = %key, backend, "row detected");
        }

        let mut label_values: Vec<String> = query
            .metadata_columns
            .iter()
            .map(|column| row.label(column))
            .collect();
        label_values.push(backend.to_string());
        let values: Vec<&str> = label_values.iter().map(String::as_str).collect();

        // Counters need a prior datum to diff against.
        if let Some(old_row) = old_row {
            for def in query.counters {
                let name = query.metric_name(def);
                match sample(query.name, row, def.attr) {
                    Ok(new) => match sample(query.name, old_row, def.attr) {
                        Ok(old) if old > new => {
                            info!(
                                metric = %name,
                                row = %key,
                                backend,
                                old,
                                new,
                                "counter went backwards, skipping (reset)"
                            );
                        }
                        Ok(old) => {
                            if let Err(error) = metrics.add_counter(
                                &name,
                                def.help,
                                &label_names,
                                &values,
                                new - old,
                            ) {
                                warn!(metric = %name, %error, "failed to record counter");
                            }
                        }
                        Err(error) => {
                            debug!(metric = %name, row = %key, %error, "no previous sample, skipping");
                        }
                    },
                    Err(error @ Error::NaNValue { .. }) => {
                        debug!(metric = %name, row = %key, backend, %error, "skipping sample");
                        record_nan(metrics, backend, query.name, &name);
                    }
                    Err(error) => {
                        debug!(metric = %name, row = %key, backend, %error, "skipping sample");
                    }
                }
            }
        }

        for def in query.gauges {
            let name = query.metric_name(def);
            match sample(query.name, row, def.attr) {
                Ok(value) => {
                    let expiry = def.expires.then_some(query.gauge_expiry);
                    if let Err(error) =
                        metrics.set_gauge(&name, def.help, &label_names, &values, value, expiry)
                    {
                        warn!(metric = %name, %error, "failed to record gauge");
                    }
                }
                Err(error @ Error::NaNValue { .. }) => {
                    debug!(metric = %name, row = %key, backend, %error, "skipping sample");
                    record_nan(metrics, backend, query.name, &name);
                }
                Err(error) => {
                    debug!(metric = %name, row = %key, backend, %error, "skipping sample");
                }
            }
        }
    }
}

fn record_nan(metrics: &MetricRegistry, backend: &str, query: &str, metric: &str) {
    if let Err(error) = metrics.add_counter(
        NAN_ERROR_METRIC,
        NAN_ERROR_HELP,
        &["backend", "query", "name"],
        &[backend, query, metric],
        1.0,
    ) {
        warn!(%error, "failed to record NaN error");
    }
}
