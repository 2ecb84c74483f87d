use pgstatsmon::catalog::Catalog;
use std::time::Duration;

fn catalog() -> Catalog {
    Catalog::new(&["public".to_string()])
}

#[test]
fn test_applicable_queries_by_version() {
    let catalog = catalog();

    // 9.2 predates pg_stat_replication helpers, recovery byte positions,
    // and pg_stat_progress_vacuum.
    let v92 = catalog.get_applicable_queries(90_200, 100).unwrap();
    assert_eq!(v92.len(), 8);
    assert!(!v92.iter().any(|q| q.name == "pg_stat_replication"));
    assert!(!v92.iter().any(|q| q.name == "pg_recovery"));
    assert!(!v92.iter().any(|q| q.name == "pg_stat_progress_vacuum"));

    // 9.5 gains replication and recovery; vacuum progress still missing.
    let v95 = catalog.get_applicable_queries(90_500, 100).unwrap();
    assert_eq!(v95.len(), 10);
    assert!(v95.iter().any(|q| q.name == "pg_stat_replication"));
    assert!(!v95.iter().any(|q| q.name == "pg_stat_progress_vacuum"));

    // 9.6 has the whole catalog.
    let v96 = catalog.get_applicable_queries(90_600, 100).unwrap();
    assert_eq!(v96.len(), 11);
}

#[test]
fn test_version_dispatch_picks_largest_applicable_threshold() {
    let catalog = catalog();

    for version in [90_400, 90_600, 99_999] {
        let queries = catalog.get_applicable_queries(version, 100).unwrap();
        let repl = queries
            .iter()
            .find(|q| q.name == "pg_stat_replication")
            .unwrap();
        assert!(repl.sql.contains("sent_location"), "version {version}");
    }

    for version in [100_000, 120_000, 170_000] {
        let queries = catalog.get_applicable_queries(version, 100).unwrap();
        let repl = queries
            .iter()
            .find(|q| q.name == "pg_stat_replication")
            .unwrap();
        assert!(repl.sql.contains("sent_lsn"), "version {version}");
    }
}

#[test]
fn test_recovery_query_branches_on_role() {
    let catalog = catalog();
    let queries = catalog.get_applicable_queries(110_000, 100).unwrap();
    let recovery = queries.iter().find(|q| q.name == "pg_recovery").unwrap();

    assert!(recovery.statkey.is_none());
    assert!(recovery.sql.contains("pg_is_in_recovery()"));
    assert!(recovery.sql.contains("pg_current_wal_insert_lsn()"));
    assert!(recovery.sql.contains("pg_last_wal_replay_lsn()"));
}

#[test]
fn test_transient_gauge_expiry_tracks_interval() {
    let catalog = catalog();

    let queries = catalog.get_applicable_queries(100_000, 5_000).unwrap();
    let progress = queries
        .iter()
        .find(|q| q.name == "pg_stat_progress_vacuum")
        .unwrap();
    assert_eq!(progress.gauge_expiry, Duration::from_millis(35_000));
    assert!(progress.gauges.iter().all(|g| g.expires));

    // Non-transient queries carry the same period but never arm it.
    let tables = queries
        .iter()
        .find(|q| q.name == "pg_stat_user_tables")
        .unwrap();
    assert!(tables.gauges.iter().all(|g| !g.expires));
}

#[test]
fn test_activity_query_enumerates_states() {
    let catalog = catalog();
    let queries = catalog.get_applicable_queries(110_000, 100).unwrap();
    let activity = queries
        .iter()
        .find(|q| q.name == "pg_stat_activity")
        .unwrap();

    for state in [
        "active",
        "idle in transaction (aborted)",
        "fastpath function call",
        "disabled",
    ] {
        assert!(activity.sql.contains(state), "missing state {state:?}");
    }
    assert!(activity.sql.contains("template%"));
    assert_eq!(activity.metadata_columns, ["datname", "state"]);
}

#[test]
fn test_stat_database_excludes_system_databases() {
    let catalog = catalog();
    let queries = catalog.get_applicable_queries(110_000, 100).unwrap();
    let database = queries
        .iter()
        .find(|q| q.name == "pg_stat_database")
        .unwrap();

    assert!(database.sql.contains("NOT LIKE 'template%'"));
    assert!(database.sql.contains("<> 'postgres'"));
    assert!(database.sql.contains("stats_reset"));
}

#[test]
fn test_metric_names_follow_convention() {
    let catalog = catalog();
    let queries = catalog.get_applicable_queries(110_000, 100).unwrap();

    let mut names = Vec::new();
    for query in &queries {
        for def in query.counters.iter().chain(query.gauges) {
            names.push(query.metric_name(def));
        }
    }

    assert!(names.contains(&"pg_stat_user_tables_n_tup_ins".to_string()));
    assert!(names.contains(&"pg_stat_replication_wal_sent_bytes".to_string()));
    assert!(names.contains(&"pg_stat_bgwriter_checkpoint_write_time_ms".to_string()));
    assert!(names.contains(&"pg_stat_activity_connections".to_string()));

    // Names are unique across the catalog except for deliberately shared
    // attr names under different query prefixes.
    let mut sorted = names.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), names.len());
}

#[test]
fn test_schema_allow_list_is_quoted() {
    let catalog = Catalog::new(&["public".to_string(), "odd'name".to_string()]);
    let queries = catalog.get_applicable_queries(110_000, 100).unwrap();
    let size = queries
        .iter()
        .find(|q| q.name == "pg_relation_size")
        .unwrap();

    assert!(size.sql.contains("'public'"));
    assert!(size.sql.contains("'odd''name'"));
}
