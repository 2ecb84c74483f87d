//! First-contact setup for a discovered backend.
//!
//! Runs once per backend as a temporary superuser connection: detects
//! standbys, reads the server version, creates the restricted monitoring
//! role, and installs the SECURITY DEFINER helper functions the catalog
//! SQL relies on. The function and role DDL strings are part of the wire
//! contract; query SQL references them by name.

use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::backend::client::PgClient;
use crate::config::Config;
use crate::error::{Error, Result};

const CREATE_STAT_ACTIVITY_FN: &str = "CREATE OR REPLACE FUNCTION public.get_stat_activity() \
     RETURNS SETOF pg_stat_activity AS \
     'SELECT * FROM pg_catalog.pg_stat_activity;' \
     LANGUAGE SQL VOLATILE SECURITY DEFINER;";

const CREATE_STAT_REPLICATION_FN: &str = "CREATE OR REPLACE FUNCTION public.get_stat_replication() \
     RETURNS SETOF pg_stat_replication AS \
     'SELECT * FROM pg_catalog.pg_stat_replication;' \
     LANGUAGE SQL VOLATILE SECURITY DEFINER;";

const CREATE_PROGRESS_VACUUM_FN: &str =
    "CREATE OR REPLACE FUNCTION public.get_stat_progress_vacuum() \
     RETURNS SETOF pg_stat_progress_vacuum AS \
     'SELECT * FROM pg_catalog.pg_stat_progress_vacuum;' \
     LANGUAGE SQL VOLATILE SECURITY DEFINER;";

/// pg_stat_progress_vacuum exists from 9.6.
const PROGRESS_VACUUM_MIN_VERSION: u32 = 90_600;

/// duplicate_object: the role already exists, which is fine.
const DUPLICATE_OBJECT: &str = "42710";
/// undefined_table: the wrapped view is missing on this server.
const UNDEFINED_TABLE: &str = "42P01";

fn role_ddl(user: &str) -> String {
    format!(
        "CREATE ROLE {user} WITH NOSUPERUSER NOCREATEDB NOCREATEROLE \
         NOINHERIT NOREPLICATION CONNECTION LIMIT 2 LOGIN"
    )
}

/// Prepare `backend` for collection and return its `server_version_num`.
///
/// # Errors
///
/// `Error::PostgresInRecovery` when the backend is a standby (the engine
/// treats setup as complete and skips collection); any other error leaves
/// the backend unprepared and is retried on the next tick.
pub async fn setup(config: &Config, backend: &Backend) -> Result<u32> {
    let opts = backend.superuser_options(&config.bootstrap.user, config.bootstrap.password.as_ref());
    let mut client =
        PgClient::connect(&backend.display_name, &opts, config.connect_timeout()).await?;

    let result = run_steps(config, backend, &mut client).await;
    client.destroy().await;
    result
}

async fn run_steps(config: &Config, backend: &Backend, client: &mut PgClient) -> Result<u32> {
    let timeout = config.query_timeout();

    let rows = client
        .query("pg_is_in_recovery", "SELECT pg_is_in_recovery() AS in_recovery", timeout)
        .await?;
    let in_recovery = rows
        .first()
        .and_then(|r| r.number("in_recovery"))
        .is_some_and(|v| v != 0.0);
    if in_recovery {
        return Err(Error::PostgresInRecovery {
            backend: backend.display_name.clone(),
        });
    }

    let rows = client
        .query("server_version_num", "SHOW server_version_num", timeout)
        .await?;
    let server_version = rows
        .first()
        .map(|r| r.label("server_version_num"))
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| Error::PoolFailed {
            backend: backend.display_name.clone(),
            reason: "could not read server_version_num".into(),
        })?;

    match client
        .query("create_role", &role_ddl(&config.user), timeout)
        .await
    {
        Ok(_) => info!(backend = %backend.display_name, user = %config.user, "created monitoring role"),
        Err(error) if has_sqlstate(&error, DUPLICATE_OBJECT) => {
            debug!(backend = %backend.display_name, user = %config.user, "monitoring role already exists");
        }
        Err(error) => return Err(error),
    }

    client
        .query("create_stat_activity_fn", CREATE_STAT_ACTIVITY_FN, timeout)
        .await?;
    client
        .query("create_stat_replication_fn", CREATE_STAT_REPLICATION_FN, timeout)
        .await?;

    if server_version >= PROGRESS_VACUUM_MIN_VERSION {
        match client
            .query("create_progress_vacuum_fn", CREATE_PROGRESS_VACUUM_FN, timeout)
            .await
        {
            Ok(_) => {}
            Err(error) if has_sqlstate(&error, UNDEFINED_TABLE) => {
                warn!(
                    backend = %backend.display_name,
                    %error,
                    "pg_stat_progress_vacuum missing, skipping helper"
                );
            }
            Err(error) => return Err(error),
        }
    }

    info!(
        backend = %backend.display_name,
        server_version,
        "backend setup complete"
    );
    Ok(server_version)
}

fn has_sqlstate(error: &Error, code: &str) -> bool {
    match error {
        Error::Query {
            source: sqlx::Error::Database(db),
            ..
        } => db.code().as_deref() == Some(code),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ddl_shape() {
        let ddl = role_ddl("pgstatsmon");
        assert!(ddl.starts_with("CREATE ROLE pgstatsmon WITH NOSUPERUSER"));
        assert!(ddl.contains("CONNECTION LIMIT 2"));
        assert!(ddl.ends_with("LOGIN"));
    }

    #[test]
    fn test_helper_fn_ddl_targets_catalog_views() {
        assert!(CREATE_STAT_ACTIVITY_FN.contains("SETOF pg_stat_activity"));
        assert!(CREATE_STAT_ACTIVITY_FN.contains("SECURITY DEFINER"));
        assert!(CREATE_STAT_REPLICATION_FN.contains("pg_catalog.pg_stat_replication"));
        assert!(CREATE_PROGRESS_VACUUM_FN.contains("pg_catalog.pg_stat_progress_vacuum"));
    }
}
