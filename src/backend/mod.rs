use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::PgConnectOptions;

pub mod bootstrap;
pub mod client;
pub mod pool;

/// One Postgres instance being monitored. Identity is `key`, assigned by
/// discovery and stable across polls; `display_name` becomes the `backend`
/// metric label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub key: String,
    pub display_name: String,
    pub address: String,
    pub port: u16,
    pub target_database: String,
}

impl Backend {
    /// Connect options for the monitoring role.
    pub fn connect_options(&self, user: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.address)
            .port(self.port)
            .username(user)
            .database(&self.target_database)
            .application_name("pgstatsmon")
    }

    /// Connect options for the temporary superuser setup connection.
    pub fn superuser_options(&self, user: &str, password: Option<&SecretString>) -> PgConnectOptions {
        let opts = PgConnectOptions::new()
            .host(&self.address)
            .port(self.port)
            .username(user)
            .database(&self.target_database)
            .application_name("pgstatsmon-setup");

        match password {
            Some(password) => opts.password(password.expose_secret()),
            None => opts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options() {
        let backend = Backend {
            key: "b1".into(),
            display_name: "shard1.postgres".into(),
            address: "10.0.0.5".into(),
            port: 5432,
            target_database: "moray".into(),
        };

        let opts = backend.connect_options("pgstatsmon");
        assert_eq!(opts.get_host(), "10.0.0.5");
        assert_eq!(opts.get_port(), 5432);
        assert_eq!(opts.get_database(), Some("moray"));
    }
}
