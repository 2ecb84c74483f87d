//! The query catalog data.
//!
//! Every numeric column is cast in SQL (`::bigint`, `::float8`,
//! `EXTRACT(EPOCH ...)`) so row decoding never has to guess at Postgres
//! numeric types. The `get_stat_activity()`, `get_stat_replication()` and
//! `get_stat_progress_vacuum()` helpers are SECURITY DEFINER functions the
//! bootstrapper installs on each primary.

use super::{MetricDef, QuerySpec, VersionedSql};

const STAT_USER_TABLES_COUNTERS: &[MetricDef] = &[
    MetricDef::new("seq_scan", "Number of sequential scans initiated on this table"),
    MetricDef::new("seq_tup_read", "Number of live rows fetched by sequential scans"),
    MetricDef::new("idx_scan", "Number of index scans initiated on this table"),
    MetricDef::new("idx_tup_fetch", "Number of live rows fetched by index scans"),
    MetricDef::new("n_tup_ins", "Number of rows inserted"),
    MetricDef::new("n_tup_upd", "Number of rows updated"),
    MetricDef::new("n_tup_del", "Number of rows deleted"),
    MetricDef::new("n_tup_hot_upd", "Number of rows HOT updated"),
    MetricDef::new("vacuum_count", "Number of times this table has been manually vacuumed"),
    MetricDef::new("autovacuum_count", "Number of times this table has been vacuumed by autovacuum"),
    MetricDef::new("analyze_count", "Number of times this table has been manually analyzed"),
    MetricDef::new("autoanalyze_count", "Number of times this table has been analyzed by autovacuum"),
];

const STAT_USER_TABLES_GAUGES: &[MetricDef] = &[
    MetricDef::new("n_live_tup", "Estimated number of live rows"),
    MetricDef::new("n_dead_tup", "Estimated number of dead rows"),
];

const STATIO_USER_TABLES_COUNTERS: &[MetricDef] = &[
    MetricDef::new("heap_blks_read", "Number of disk blocks read from this table"),
    MetricDef::new("heap_blks_hit", "Number of buffer hits in this table"),
    MetricDef::new("idx_blks_read", "Number of disk blocks read from all indexes on this table"),
    MetricDef::new("idx_blks_hit", "Number of buffer hits in all indexes on this table"),
    MetricDef::new("toast_blks_read", "Number of disk blocks read from this table's TOAST table"),
    MetricDef::new("toast_blks_hit", "Number of buffer hits in this table's TOAST table"),
    MetricDef::new("tidx_blks_read", "Number of disk blocks read from this table's TOAST indexes"),
    MetricDef::new("tidx_blks_hit", "Number of buffer hits in this table's TOAST indexes"),
];

const STATIO_USER_INDEXES_COUNTERS: &[MetricDef] = &[
    MetricDef::new("idx_blks_read", "Number of disk blocks read from this index"),
    MetricDef::new("idx_blks_hit", "Number of buffer hits in this index"),
];

const STAT_REPLICATION_GAUGES: &[MetricDef] = &[
    MetricDef::new("wal_sent", "WAL position sent to this peer").with_unit("bytes"),
    MetricDef::new("replica_wal_written", "WAL position written by this peer").with_unit("bytes"),
    MetricDef::new("replica_wal_flushed", "WAL position flushed by this peer").with_unit("bytes"),
    MetricDef::new("replica_wal_replayed", "WAL position replayed by this peer").with_unit("bytes"),
];

const RECOVERY_GAUGES: &[MetricDef] = &[
    MetricDef::new("wal_insert", "Current WAL insert position").with_unit("bytes"),
    MetricDef::new("wal_flush", "Current WAL flush position").with_unit("bytes"),
    MetricDef::new("wal_replay", "Last WAL position replayed during recovery").with_unit("bytes"),
    MetricDef::new("wal_receive", "Last WAL position received during recovery").with_unit("bytes"),
];

const STAT_ACTIVITY_GAUGES: &[MetricDef] =
    &[MetricDef::new("connections", "Number of connections by database and state")];

const STAT_DATABASE_COUNTERS: &[MetricDef] = &[
    MetricDef::new("xact_commit", "Number of transactions committed"),
    MetricDef::new("xact_rollback", "Number of transactions rolled back"),
    MetricDef::new("blks_read", "Number of disk blocks read"),
    MetricDef::new("blks_hit", "Number of buffer hits"),
    MetricDef::new("tup_returned", "Number of rows returned by queries"),
    MetricDef::new("tup_fetched", "Number of rows fetched by queries"),
    MetricDef::new("tup_inserted", "Number of rows inserted"),
    MetricDef::new("tup_updated", "Number of rows updated"),
    MetricDef::new("tup_deleted", "Number of rows deleted"),
    MetricDef::new("temp_files", "Number of temporary files created"),
    MetricDef::new("temp_bytes", "Bytes written to temporary files"),
    MetricDef::new("deadlocks", "Number of deadlocks detected"),
];

const STAT_DATABASE_GAUGES: &[MetricDef] =
    &[MetricDef::new("connections", "Number of backends connected to this database")];

const RELATION_SIZE_GAUGES: &[MetricDef] = &[
    MetricDef::new("row_estimate", "Estimated number of rows"),
    MetricDef::new("total_bytes", "Total size of this relation including indexes and TOAST"),
    MetricDef::new("index_bytes", "Size of all indexes on this relation"),
    MetricDef::new("toast_bytes", "Size of this relation's TOAST data"),
];

const STAT_BGWRITER_COUNTERS: &[MetricDef] = &[
    MetricDef::new("checkpoints_timed", "Number of scheduled checkpoints performed"),
    MetricDef::new("checkpoints_req", "Number of requested checkpoints performed"),
    MetricDef::new("checkpoint_write_time", "Time spent writing checkpoint files to disk").with_unit("ms"),
    MetricDef::new("checkpoint_sync_time", "Time spent synchronizing checkpoint files to disk").with_unit("ms"),
    MetricDef::new("buffers_checkpoint", "Number of buffers written during checkpoints"),
    MetricDef::new("buffers_clean", "Number of buffers written by the background writer"),
    MetricDef::new("maxwritten_clean", "Number of times the background writer stopped a cleaning scan"),
    MetricDef::new("buffers_backend", "Number of buffers written directly by backends"),
    MetricDef::new("buffers_backend_fsync", "Number of fsync calls executed by backends"),
    MetricDef::new("buffers_alloc", "Number of buffers allocated"),
];

const VACUUM_GAUGES: &[MetricDef] = &[
    MetricDef::new("xid_age", "Age of this relation's frozen transaction ID"),
    MetricDef::new(
        "tx_until_wraparound_autovacuum",
        "Transactions until a wraparound autovacuum is forced on this relation",
    ),
];

const PROGRESS_VACUUM_GAUGES: &[MetricDef] = &[
    MetricDef::new("heap_blks_total", "Total heap blocks in the relation being vacuumed").expiring(),
    MetricDef::new("heap_blks_scanned", "Heap blocks scanned so far").expiring(),
    MetricDef::new("heap_blks_vacuumed", "Heap blocks vacuumed so far").expiring(),
    MetricDef::new("index_vacuum_count", "Number of completed index vacuum cycles").expiring(),
    MetricDef::new("max_dead_tuples", "Dead tuples the vacuum can store before an index cycle").expiring(),
    MetricDef::new("num_dead_tuples", "Dead tuples collected since the last index cycle").expiring(),
];

const STAT_USER_TABLES_SQL: &str = r#"
    SELECT
        schemaname,
        relname,
        seq_scan::bigint,
        seq_tup_read::bigint,
        idx_scan::bigint,
        idx_tup_fetch::bigint,
        n_tup_ins::bigint,
        n_tup_upd::bigint,
        n_tup_del::bigint,
        n_tup_hot_upd::bigint,
        n_live_tup::bigint,
        n_dead_tup::bigint,
        vacuum_count::bigint,
        autovacuum_count::bigint,
        analyze_count::bigint,
        autoanalyze_count::bigint
    FROM pg_stat_user_tables
"#;

const STATIO_USER_TABLES_SQL: &str = r#"
    SELECT
        schemaname,
        relname,
        heap_blks_read::bigint,
        heap_blks_hit::bigint,
        idx_blks_read::bigint,
        idx_blks_hit::bigint,
        toast_blks_read::bigint,
        toast_blks_hit::bigint,
        tidx_blks_read::bigint,
        tidx_blks_hit::bigint
    FROM pg_statio_user_tables
"#;

const STATIO_USER_INDEXES_SQL: &str = r#"
    SELECT
        schemaname,
        relname,
        indexrelname,
        idx_blks_read::bigint,
        idx_blks_hit::bigint
    FROM pg_statio_user_indexes
"#;

// 9.4 through 9.6 report WAL positions in *_location columns.
const STAT_REPLICATION_SQL_94: &str = r#"
    SELECT
        sync_state,
        (sent_location - '0/0'::pg_lsn)::bigint AS wal_sent,
        (write_location - '0/0'::pg_lsn)::bigint AS replica_wal_written,
        (flush_location - '0/0'::pg_lsn)::bigint AS replica_wal_flushed,
        (replay_location - '0/0'::pg_lsn)::bigint AS replica_wal_replayed
    FROM get_stat_replication()
"#;

// 10 renamed the columns to *_lsn.
const STAT_REPLICATION_SQL_10: &str = r#"
    SELECT
        sync_state,
        (sent_lsn - '0/0'::pg_lsn)::bigint AS wal_sent,
        (write_lsn - '0/0'::pg_lsn)::bigint AS replica_wal_written,
        (flush_lsn - '0/0'::pg_lsn)::bigint AS replica_wal_flushed,
        (replay_lsn - '0/0'::pg_lsn)::bigint AS replica_wal_replayed
    FROM get_stat_replication()
"#;

// Branches that do not apply to the server's role are NULL on purpose.
const RECOVERY_SQL_94: &str = r#"
    SELECT
        CASE WHEN pg_is_in_recovery() THEN NULL
             ELSE (pg_current_xlog_insert_location() - '0/0'::pg_lsn)::bigint END AS wal_insert,
        CASE WHEN pg_is_in_recovery() THEN NULL
             ELSE (pg_current_xlog_location() - '0/0'::pg_lsn)::bigint END AS wal_flush,
        CASE WHEN pg_is_in_recovery()
             THEN (pg_last_xlog_replay_location() - '0/0'::pg_lsn)::bigint
             ELSE NULL END AS wal_replay,
        CASE WHEN pg_is_in_recovery()
             THEN (pg_last_xlog_receive_location() - '0/0'::pg_lsn)::bigint
             ELSE NULL END AS wal_receive
"#;

const RECOVERY_SQL_10: &str = r#"
    SELECT
        CASE WHEN pg_is_in_recovery() THEN NULL
             ELSE (pg_current_wal_insert_lsn() - '0/0'::pg_lsn)::bigint END AS wal_insert,
        CASE WHEN pg_is_in_recovery() THEN NULL
             ELSE (pg_current_wal_flush_lsn() - '0/0'::pg_lsn)::bigint END AS wal_flush,
        CASE WHEN pg_is_in_recovery()
             THEN (pg_last_wal_replay_lsn() - '0/0'::pg_lsn)::bigint
             ELSE NULL END AS wal_replay,
        CASE WHEN pg_is_in_recovery()
             THEN (pg_last_wal_receive_lsn() - '0/0'::pg_lsn)::bigint
             ELSE NULL END AS wal_receive
"#;

// Cross join a fixed enumeration of states with pg_database so every
// (database, state) pair is reported, zero when no such connection exists.
const STAT_ACTIVITY_SQL: &str = r#"
    SELECT
        d.datname || '/' || s.state AS datstate,
        d.datname,
        s.state,
        COALESCE(a.count, 0)::bigint AS connections
    FROM pg_database d
    CROSS JOIN unnest(ARRAY[
        'active',
        'idle',
        'idle in transaction',
        'idle in transaction (aborted)',
        'fastpath function call',
        'disabled'
    ]) AS s(state)
    LEFT JOIN (
        SELECT datname, state, count(*) AS count
        FROM get_stat_activity()
        GROUP BY datname, state
    ) a ON a.datname = d.datname AND a.state = s.state
    WHERE d.datname NOT LIKE 'template%'
"#;

const STAT_DATABASE_SQL: &str = r#"
    SELECT
        datname,
        numbackends::bigint AS connections,
        xact_commit::bigint,
        xact_rollback::bigint,
        blks_read::bigint,
        blks_hit::bigint,
        tup_returned::bigint,
        tup_fetched::bigint,
        tup_inserted::bigint,
        tup_updated::bigint,
        tup_deleted::bigint,
        temp_files::bigint,
        temp_bytes::bigint,
        deadlocks::bigint,
        EXTRACT(EPOCH FROM stats_reset)::float8 AS stats_reset
    FROM pg_stat_database
    WHERE datname NOT LIKE 'template%' AND datname <> 'postgres'
"#;

const STAT_BGWRITER_SQL: &str = r#"
    SELECT
        checkpoints_timed::bigint,
        checkpoints_req::bigint,
        checkpoint_write_time::float8,
        checkpoint_sync_time::float8,
        buffers_checkpoint::bigint,
        buffers_clean::bigint,
        maxwritten_clean::bigint,
        buffers_backend::bigint,
        buffers_backend_fsync::bigint,
        buffers_alloc::bigint,
        EXTRACT(EPOCH FROM stats_reset)::float8 AS stats_reset
    FROM pg_stat_bgwriter
"#;

const VACUUM_SQL: &str = r#"
    SELECT
        c.relname,
        age(c.relfrozenxid)::bigint AS xid_age,
        (current_setting('autovacuum_freeze_max_age')::bigint
            - age(c.relfrozenxid))::bigint AS tx_until_wraparound_autovacuum
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE c.relkind = 'r'
      AND n.nspname <> 'information_schema'
      AND n.nspname NOT LIKE 'pg_%'
"#;

const PROGRESS_VACUUM_SQL: &str = r#"
    SELECT
        COALESCE(c.relname, p.relid::text) AS relname,
        p.phase,
        p.heap_blks_total::bigint,
        p.heap_blks_scanned::bigint,
        p.heap_blks_vacuumed::bigint,
        p.index_vacuum_count::bigint,
        p.max_dead_tuples::bigint,
        p.num_dead_tuples::bigint
    FROM get_stat_progress_vacuum() p
    LEFT JOIN pg_class c ON c.oid = p.relid
"#;

fn relation_size_sql(schemata: &[String]) -> String {
    let allow_list = schemata
        .iter()
        .map(|s| quote_literal(s))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"
    SELECT
        n.nspname AS schemaname,
        c.relname,
        c.reltuples::bigint AS row_estimate,
        pg_total_relation_size(c.oid)::bigint AS total_bytes,
        pg_indexes_size(c.oid)::bigint AS index_bytes,
        COALESCE(pg_total_relation_size(c.reltoastrelid), 0)::bigint AS toast_bytes
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE c.relkind = 'r' AND n.nspname IN ({allow_list})
"#
    )
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub(crate) fn specs(schemata: &[String]) -> Vec<QuerySpec> {
    vec![
        QuerySpec {
            name: "pg_stat_user_tables",
            statkey: Some("relname"),
            metadata_columns: &["schemaname", "relname"],
            sql: VersionedSql::All(STAT_USER_TABLES_SQL.to_string()),
            counters: STAT_USER_TABLES_COUNTERS,
            gauges: STAT_USER_TABLES_GAUGES,
        },
        QuerySpec {
            name: "pg_statio_user_tables",
            statkey: Some("relname"),
            metadata_columns: &["schemaname", "relname"],
            sql: VersionedSql::All(STATIO_USER_TABLES_SQL.to_string()),
            counters: STATIO_USER_TABLES_COUNTERS,
            gauges: &[],
        },
        QuerySpec {
            name: "pg_statio_user_indexes",
            statkey: Some("indexrelname"),
            metadata_columns: &["schemaname", "relname", "indexrelname"],
            sql: VersionedSql::All(STATIO_USER_INDEXES_SQL.to_string()),
            counters: STATIO_USER_INDEXES_COUNTERS,
            gauges: &[],
        },
        QuerySpec {
            name: "pg_stat_replication",
            statkey: Some("sync_state"),
            metadata_columns: &["sync_state"],
            sql: VersionedSql::Versioned(vec![
                (90_400, STAT_REPLICATION_SQL_94.to_string()),
                (100_000, STAT_REPLICATION_SQL_10.to_string()),
            ]),
            counters: &[],
            gauges: STAT_REPLICATION_GAUGES,
        },
        QuerySpec {
            name: "pg_recovery",
            statkey: None,
            metadata_columns: &[],
            sql: VersionedSql::Versioned(vec![
                (90_400, RECOVERY_SQL_94.to_string()),
                (100_000, RECOVERY_SQL_10.to_string()),
            ]),
            counters: &[],
            gauges: RECOVERY_GAUGES,
        },
        QuerySpec {
            name: "pg_stat_activity",
            statkey: Some("datstate"),
            metadata_columns: &["datname", "state"],
            sql: VersionedSql::All(STAT_ACTIVITY_SQL.to_string()),
            counters: &[],
            gauges: STAT_ACTIVITY_GAUGES,
        },
        QuerySpec {
            name: "pg_stat_database",
            statkey: Some("datname"),
            metadata_columns: &["datname"],
            sql: VersionedSql::All(STAT_DATABASE_SQL.to_string()),
            counters: STAT_DATABASE_COUNTERS,
            gauges: STAT_DATABASE_GAUGES,
        },
        QuerySpec {
            name: "pg_relation_size",
            statkey: Some("relname"),
            metadata_columns: &["schemaname", "relname"],
            sql: VersionedSql::All(relation_size_sql(schemata)),
            counters: &[],
            gauges: RELATION_SIZE_GAUGES,
        },
        QuerySpec {
            name: "pg_stat_bgwriter",
            statkey: None,
            metadata_columns: &[],
            sql: VersionedSql::All(STAT_BGWRITER_SQL.to_string()),
            counters: STAT_BGWRITER_COUNTERS,
            gauges: &[],
        },
        QuerySpec {
            name: "pg_vacuum",
            statkey: Some("relname"),
            metadata_columns: &["relname"],
            sql: VersionedSql::All(VACUUM_SQL.to_string()),
            counters: &[],
            gauges: VACUUM_GAUGES,
        },
        QuerySpec {
            name: "pg_stat_progress_vacuum",
            statkey: Some("relname"),
            metadata_columns: &["relname", "phase"],
            sql: VersionedSql::Versioned(vec![(90_600, PROGRESS_VACUUM_SQL.to_string())]),
            counters: &[],
            gauges: PROGRESS_VACUUM_GAUGES,
        },
    ]
}
