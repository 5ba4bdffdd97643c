use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::ConnectOptions;
use tracing::debug;
use url::Url;

use crate::error::{EngineError, Result};

pub const SUPPORTED_DRIVER: &str = "postgresql+sqlx";
const SUPPORTED_DIALECTS: &[&str] = &["postgres", "postgresql"];
const ASYNC_DRIVER: &str = "sqlx";

/// A connection URL, either raw text or already parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUrl {
    Text(String),
    Parsed(Url),
}

impl From<&str> for ConnectionUrl {
    fn from(url: &str) -> Self {
        ConnectionUrl::Text(url.to_string())
    }
}

impl From<String> for ConnectionUrl {
    fn from(url: String) -> Self {
        ConnectionUrl::Text(url)
    }
}

impl From<Url> for ConnectionUrl {
    fn from(url: Url) -> Self {
        ConnectionUrl::Parsed(url)
    }
}

impl ConnectionUrl {
    /// Build a URL from components, percent-encoding the credentials.
    pub fn create(
        drivername: &str,
        username: &str,
        password: &str,
        host: &str,
        port: u16,
        database: &str,
    ) -> Result<Self> {
        let encoded_username = urlencoding::encode(username);
        let url = if password.is_empty() {
            format!("{}://{}@{}:{}/{}", drivername, encoded_username, host, port, database)
        } else {
            format!(
                "{}://{}:{}@{}:{}/{}",
                drivername,
                encoded_username,
                urlencoding::encode(password),
                host,
                port,
                database
            )
        };
        Ok(ConnectionUrl::Parsed(Url::parse(&url)?))
    }

    fn to_url(&self) -> Result<Url> {
        match self {
            ConnectionUrl::Parsed(url) => Ok(url.clone()),
            ConnectionUrl::Text(text) => Url::parse(text).map_err(|e| {
                EngineError::validation(format!("Invalid connection URL: {}", e))
            }),
        }
    }

    /// `(dialect, driver)` from a `dialect+driver` scheme.
    pub fn drivername(&self) -> Result<(String, Option<String>)> {
        let url = self.to_url()?;
        let scheme = url.scheme().to_lowercase();
        Ok(match scheme.split_once('+') {
            Some((dialect, driver)) => (dialect.to_string(), Some(driver.to_string())),
            None => (scheme, None),
        })
    }

    /// Checks the dialect and driver and converts to connect options. Performs
    /// no network activity.
    pub fn validate(&self) -> Result<PgConnectOptions> {
        let (dialect, driver) = self.drivername()?;
        let driver_ok = match driver.as_deref() {
            None => true,
            Some(driver) => driver == ASYNC_DRIVER,
        };
        if !SUPPORTED_DIALECTS.contains(&dialect.as_str()) || !driver_ok {
            return Err(EngineError::validation(format!(
                "Driver must be type '{}'",
                SUPPORTED_DRIVER
            )));
        }

        let mut url = self.to_url()?;
        url.set_scheme("postgres").map_err(|_| {
            EngineError::validation(format!("Cannot use scheme '{}'", url.scheme()))
        })?;
        debug!(
            "Validated connection URL for host {}",
            url.host_str().unwrap_or("<none>")
        );
        PgConnectOptions::from_str(url.as_str())
            .map_err(|e| EngineError::validation(format!("Invalid connection URL: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PoolClass {
    QueuePool,
    /// Connections are closed on release instead of being kept idle.
    NullPool,
}

/// Passthrough engine options. Unknown keys are rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineArgs {
    #[serde(default)]
    pub echo: bool,
    pub pool_size: Option<u32>,
    pub min_connections: Option<u32>,
    /// Seconds to wait for a pooled connection.
    pub pool_timeout: Option<f64>,
    /// Maximum connection lifetime in seconds.
    pub pool_recycle: Option<f64>,
    pub idle_timeout: Option<f64>,
    #[serde(default)]
    pub pool_pre_ping: bool,
    pub poolclass: Option<PoolClass>,
    pub application_name: Option<String>,
}

impl EngineArgs {
    pub fn from_value(value: Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        if !value.is_object() {
            return Err(EngineError::UnexpectedArgument(format!(
                "engine options must be an object, got {}",
                value
            )));
        }
        let args: EngineArgs = serde_json::from_value(value)
            .map_err(|e| EngineError::UnexpectedArgument(e.to_string()))?;
        args.validate()?;
        Ok(args)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == Some(0) {
            return Err(EngineError::validation("pool_size must be at least 1"));
        }
        if let (Some(min), Some(max)) = (self.min_connections, self.pool_size) {
            if min > max {
                return Err(EngineError::validation(
                    "min_connections cannot exceed pool_size",
                ));
            }
        }
        for (field, value) in [
            ("pool_timeout", self.pool_timeout),
            ("pool_recycle", self.pool_recycle),
            ("idle_timeout", self.idle_timeout),
        ] {
            if let Some(value) = value {
                seconds(field, value)?;
            }
        }
        Ok(())
    }

    pub(crate) fn pool_options(&self) -> Result<PgPoolOptions> {
        self.validate()?;
        let mut options = PgPoolOptions::new();
        if let Some(size) = self.pool_size {
            options = options.max_connections(size);
        }
        if let Some(min) = self.min_connections {
            options = options.min_connections(min);
        }
        if let Some(timeout) = self.pool_timeout {
            options = options.acquire_timeout(seconds("pool_timeout", timeout)?);
        }
        if let Some(recycle) = self.pool_recycle {
            options = options.max_lifetime(seconds("pool_recycle", recycle)?);
        }
        if let Some(idle) = self.idle_timeout {
            options = options.idle_timeout(seconds("idle_timeout", idle)?);
        }
        options = options.test_before_acquire(self.pool_pre_ping);

        if self.poolclass == Some(PoolClass::NullPool) {
            options = options
                .min_connections(0)
                .after_release(|_conn, _meta| Box::pin(async { Ok::<_, sqlx::Error>(false) }));
        }
        Ok(options)
    }

    pub(crate) fn apply_connect_options(&self, options: PgConnectOptions) -> PgConnectOptions {
        let options = match &self.application_name {
            Some(name) => options.application_name(name),
            None => options,
        };
        if self.echo {
            options
        } else {
            options.disable_statement_logging()
        }
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        EngineError::validation(format!(
            "{} must be a non-negative number of seconds, got {}",
            field, value
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_supported_schemes_validate() {
        for url in [
            "postgresql+sqlx://user:pw@10.0.0.1:5432/db",
            "postgresql://user:pw@10.0.0.1:5432/db",
            "postgres://user@localhost/db",
        ] {
            let options = ConnectionUrl::from(url).validate().unwrap();
            assert_eq!(options.get_database(), Some("db"));
        }
    }

    #[test]
    fn test_unsupported_driver_is_rejected() {
        for url in [
            "postgresql+pg8000://user:pw@10.0.0.1:5432/db",
            "postgresql+psycopg2://user:pw@10.0.0.1:5432/db",
            "mysql://user:pw@10.0.0.1:3306/db",
        ] {
            let err = ConnectionUrl::from(url).validate().unwrap_err();
            assert!(err.is_validation_error(), "{} should be rejected", url);
            assert!(err.to_string().contains(SUPPORTED_DRIVER));
        }
    }

    #[test]
    fn test_create_encodes_credentials() {
        let url = ConnectionUrl::create("postgresql+sqlx", "app user", "p@ss/word", "10.0.0.1", 5432, "db")
            .unwrap();
        let options = url.validate().unwrap();
        assert_eq!(options.get_username(), "app user");
        assert_eq!(options.get_host(), "10.0.0.1");
        assert_eq!(options.get_port(), 5432);

        let rejected = ConnectionUrl::create("postgresql+pg8000", "u", "p", "10.0.0.1", 5432, "db")
            .unwrap()
            .validate()
            .unwrap_err();
        assert!(rejected.is_validation_error());
    }

    #[test]
    fn test_malformed_url_is_a_validation_error() {
        let err = ConnectionUrl::from("not a url").validate().unwrap_err();
        assert!(err.is_validation_error());
    }

    #[test]
    fn test_engine_args_accept_known_options() {
        let args = EngineArgs::from_value(json!({
            "echo": true,
            "pool_size": 4,
            "pool_timeout": 2.5,
            "poolclass": "NullPool"
        }))
        .unwrap();
        assert!(args.echo);
        assert_eq!(args.pool_size, Some(4));
        assert_eq!(args.poolclass, Some(PoolClass::NullPool));
        assert!(args.pool_options().is_ok());

        assert!(EngineArgs::from_value(Value::Null).is_ok());
    }

    #[test]
    fn test_engine_args_reject_unknown_options() {
        let err = EngineArgs::from_value(json!({"random": false})).unwrap_err();
        assert!(matches!(err, EngineError::UnexpectedArgument(_)));
        assert!(err.to_string().contains("random"));

        let err = EngineArgs::from_value(json!(["echo"])).unwrap_err();
        assert!(matches!(err, EngineError::UnexpectedArgument(_)));
    }

    #[test]
    fn test_engine_args_reject_bad_values() {
        assert!(EngineArgs::from_value(json!({"pool_size": 0})).is_err());
        assert!(EngineArgs::from_value(json!({"pool_timeout": -1.0})).is_err());
        assert!(EngineArgs::from_value(json!({"pool_size": 2, "min_connections": 3})).is_err());
    }
}
