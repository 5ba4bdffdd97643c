use std::env;

use dotenv::dotenv;

use crate::core::engine::InstanceOptions;
use crate::error::{EngineError, Result};
use crate::utils::datasource::connection_config::{ConnectionUrl, SUPPORTED_DRIVER};
use crate::utils::datasource::connector::IpType;

/// Instance coordinates and credentials loaded from the environment. The
/// engine never reads the environment itself; callers do it through this.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub project_id: String,
    pub region: String,
    pub instance_id: String,
    pub database_id: String,
    pub db_user: Option<String>,
    pub db_password: Option<String>,
    pub iam_account: Option<String>,
    /// Directly reachable address, used for URL based construction.
    pub ip_address: Option<String>,
    pub cluster_id: Option<String>,
    pub ip_type: IpType,
}

fn get_env_var(key: &str, desc: &str) -> Result<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(EngineError::Config(format!("Must set env var {} to: {}", key, desc))),
    }
}

fn optional_env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

impl InstanceConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let ip_type = match optional_env_var("IP_TYPE") {
            Some(value) => value.parse()?,
            None => IpType::default(),
        };

        Ok(InstanceConfig {
            project_id: get_env_var("PROJECT_ID", "project id for google cloud")?,
            region: get_env_var("REGION", "region for cloud sql instance")?,
            instance_id: get_env_var("INSTANCE_ID", "instance for cloud sql")?,
            database_id: get_env_var("DATABASE_ID", "database name on cloud sql instance")?,
            db_user: optional_env_var("DB_USER"),
            db_password: optional_env_var("DB_PASSWORD"),
            iam_account: optional_env_var("IAM_ACCOUNT"),
            ip_address: optional_env_var("IP_ADDRESS"),
            cluster_id: optional_env_var("CLUSTER_ID"),
            ip_type,
        })
    }

    /// Options for `PostgresEngine::from_instance`. Uses password auth when
    /// both credentials are set, IAM otherwise.
    pub fn instance_options(&self) -> InstanceOptions {
        let mut options = InstanceOptions::new(
            &self.project_id,
            &self.region,
            &self.instance_id,
            &self.database_id,
        )
        .with_ip_type(self.ip_type);

        if let (Some(user), Some(password)) = (&self.db_user, &self.db_password) {
            options = options.with_password(user, password);
        } else if let Some(email) = &self.iam_account {
            options = options.with_iam_account_email(email);
        }
        options
    }

    /// `postgresql+sqlx://` URL pointing at `IP_ADDRESS`.
    pub fn connection_url(&self) -> Result<ConnectionUrl> {
        let host = self
            .ip_address
            .as_deref()
            .ok_or_else(|| EngineError::Config("Must set env var IP_ADDRESS to: instance ip address".to_string()))?;
        let user = self
            .db_user
            .as_deref()
            .ok_or_else(|| EngineError::Config("Must set env var DB_USER to: database user".to_string()))?;
        ConnectionUrl::create(
            SUPPORTED_DRIVER,
            user,
            self.db_password.as_deref().unwrap_or_default(),
            host,
            5432,
            &self.database_id,
        )
    }
}
