//! Single-connection Postgres client.
//!
//! One `PgClient` owns one connection and runs one query at a time; the
//! `&mut self` receiver enforces the single-request discipline at compile
//! time. A query that outlives its deadline poisons the client: the stream
//! is dropped mid-protocol, so the pool must destroy rather than reuse it.

use std::collections::HashMap;
use std::time::Duration;

use futures::TryStreamExt;
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::{Column, ConnectOptions, Connection, Executor, PgConnection, Row, TypeInfo};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// One decoded result cell. Numeric columns are cast in catalog SQL, so
/// anything that is not a number or text here is surfaced as `Null`.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Number(f64),
    Text(String),
}

/// A buffered result row, keyed by column name.
#[derive(Debug, Clone, Default)]
pub struct StatRow {
    cells: HashMap<String, Cell>,
}

impl StatRow {
    pub fn from_cells<I>(cells: I) -> Self
    where
        I: IntoIterator<Item = (String, Cell)>,
    {
        Self {
            cells: cells.into_iter().collect(),
        }
    }

    fn decode(row: &PgRow) -> Self {
        let mut cells = HashMap::with_capacity(row.columns().len());
        for column in row.columns() {
            let ordinal = column.ordinal();
            let cell = match column.type_info().name() {
                "INT2" => row
                    .try_get::<Option<i16>, _>(ordinal)
                    .ok()
                    .flatten()
                    .map(|v| Cell::Number(f64::from(v))),
                "INT4" => row
                    .try_get::<Option<i32>, _>(ordinal)
                    .ok()
                    .flatten()
                    .map(|v| Cell::Number(f64::from(v))),
                "INT8" => row
                    .try_get::<Option<i64>, _>(ordinal)
                    .ok()
                    .flatten()
                    .map(|v| Cell::Number(v as f64)),
                "FLOAT4" => row
                    .try_get::<Option<f32>, _>(ordinal)
                    .ok()
                    .flatten()
                    .map(|v| Cell::Number(f64::from(v))),
                "FLOAT8" => row
                    .try_get::<Option<f64>, _>(ordinal)
                    .ok()
                    .flatten()
                    .map(Cell::Number),
                "BOOL" => row
                    .try_get::<Option<bool>, _>(ordinal)
                    .ok()
                    .flatten()
                    .map(|v| Cell::Number(if v { 1.0 } else { 0.0 })),
                "TEXT" | "VARCHAR" | "NAME" | "BPCHAR" | "CHAR" | "UNKNOWN" => row
                    .try_get::<Option<String>, _>(ordinal)
                    .ok()
                    .flatten()
                    .map(Cell::Text),
                other => {
                    trace!(column = column.name(), ty = other, "undecodable column type");
                    None
                }
            };
            cells.insert(column.name().to_string(), cell.unwrap_or(Cell::Null));
        }
        Self { cells }
    }

    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.cells.get(column)
    }

    /// The cell as a number, if it is one.
    pub fn number(&self, column: &str) -> Option<f64> {
        match self.cells.get(column) {
            Some(Cell::Number(v)) => Some(*v),
            _ => None,
        }
    }

    /// The cell rendered as a label value. NULL renders empty.
    pub fn label(&self, column: &str) -> String {
        match self.cells.get(column) {
            Some(Cell::Text(s)) => s.clone(),
            Some(Cell::Number(v)) => {
                if v.fract() == 0.0 && v.abs() < 9.007_199_254_740_992e15 {
                    format!("{}", *v as i64)
                } else {
                    format!("{v}")
                }
            }
            Some(Cell::Null) | None => String::new(),
        }
    }
}

/// Collapse whitespace runs so equal queries trace identically across
/// backends.
pub fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug)]
pub struct PgClient {
    conn: Option<PgConnection>,
    backend: String,
    had_error: bool,
}

impl PgClient {
    /// Establish the TCP + startup handshake.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connect` if the transport or handshake fails or the
    /// deadline passes first.
    pub async fn connect(
        backend: &str,
        opts: &PgConnectOptions,
        timeout: Duration,
    ) -> Result<Self> {
        let conn = match tokio::time::timeout(timeout, opts.connect()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(source)) => {
                return Err(Error::Connect {
                    backend: backend.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(Error::Connect {
                    backend: backend.to_string(),
                    source: sqlx::Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    )),
                });
            }
        };

        debug!(backend, "connected");
        Ok(Self {
            conn: Some(conn),
            backend: backend.to_string(),
            had_error: false,
        })
    }

    /// Run one statement and buffer its rows. Exactly one terminal outcome:
    /// the row vector, `Error::QueryTimeout` past the deadline, or
    /// `Error::Query` for anything the server or transport reports.
    pub async fn query(&mut self, name: &str, sql: &str, timeout: Duration) -> Result<Vec<StatRow>> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::PoolFailed {
                backend: self.backend.clone(),
                reason: "client destroyed".into(),
            });
        };

        let normalized = normalize_sql(sql);
        let fetch = async {
            let mut rows = Vec::new();
            let mut stream = conn.fetch(normalized.as_str());
            while let Some(row) = stream.try_next().await? {
                rows.push(StatRow::decode(&row));
            }
            Ok::<_, sqlx::Error>(rows)
        };
        let result = tokio::time::timeout(timeout, fetch).await;

        match result {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(source)) => {
                // SQL-level errors leave the protocol usable; everything
                // else means the connection can no longer be trusted.
                if !matches!(source, sqlx::Error::Database(_)) {
                    self.had_error = true;
                }
                Err(Error::Query {
                    backend: self.backend.clone(),
                    query: name.to_string(),
                    source,
                })
            }
            Err(_) => {
                self.had_error = true;
                Err(Error::QueryTimeout {
                    backend: self.backend.clone(),
                    query: name.to_string(),
                    timeout,
                })
            }
        }
    }

    pub fn had_error(&self) -> bool {
        self.had_error
    }

    pub fn is_destroyed(&self) -> bool {
        self.conn.is_none()
    }

    pub async fn destroy(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(error) = conn.close().await {
                debug!(backend = %self.backend, %error, "error closing connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_sql() {
        let sql = "SELECT\n    a,\n    b\nFROM t\n";
        assert_eq!(normalize_sql(sql), "SELECT a, b FROM t");
    }

    #[test]
    fn test_statrow_accessors() {
        let row = StatRow::from_cells([
            ("relname".to_string(), Cell::Text("t".to_string())),
            ("n_tup_ins".to_string(), Cell::Number(42.0)),
            ("idx_scan".to_string(), Cell::Null),
        ]);

        assert_eq!(row.number("n_tup_ins"), Some(42.0));
        assert_eq!(row.number("relname"), None);
        assert_eq!(row.number("idx_scan"), None);
        assert_eq!(row.label("relname"), "t");
        assert_eq!(row.label("n_tup_ins"), "42");
        assert_eq!(row.label("idx_scan"), "");
        assert_eq!(row.label("missing"), "");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Nothing listens on this port; the handshake must fail, not hang.
        let opts = PgConnectOptions::new()
            .host("127.0.0.1")
            .port(9)
            .username("nobody")
            .database("none");

        let err = PgClient::connect("test", &opts, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connect { .. }));
    }
}
