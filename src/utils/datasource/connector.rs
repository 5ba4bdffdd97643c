use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::Connection;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::auth::{MetadataTokenSource, TokenSource};
use crate::error::{EngineError, Result};
use crate::utils::runtime::default_runtime;

pub const DEFAULT_ADMIN_API_ENDPOINT: &str = "https://sqladmin.googleapis.com";
pub const USER_AGENT: &str = concat!("cloudsql-pg-engine/", env!("CARGO_PKG_VERSION"));
const POSTGRES_PORT: u16 = 5432;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IpType {
    #[default]
    Public,
    Private,
    Psc,
}

impl FromStr for IpType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "public" | "primary" => Ok(IpType::Public),
            "private" => Ok(IpType::Private),
            "psc" => Ok(IpType::Psc),
            other => Err(EngineError::validation(format!(
                "Unknown ip type '{}', expected one of PUBLIC, PRIVATE, PSC",
                other
            ))),
        }
    }
}

/// `project:region:instance` address of a Cloud SQL instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceConnectionName {
    pub project: String,
    pub region: String,
    pub instance: String,
}

impl InstanceConnectionName {
    pub fn new(
        project: impl Into<String>,
        region: impl Into<String>,
        instance: impl Into<String>,
    ) -> Result<Self> {
        let name = Self {
            project: project.into(),
            region: region.into(),
            instance: instance.into(),
        };
        for (field, value) in [
            ("project_id", &name.project),
            ("region", &name.region),
            ("instance", &name.instance),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::validation(format!("{} cannot be empty", field)));
            }
        }
        Ok(name)
    }
}

impl fmt::Display for InstanceConnectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.project, self.region, self.instance)
    }
}

impl FromStr for InstanceConnectionName {
    type Err = EngineError;

    /// Domain-scoped projects (`example.com:project`) keep their colon.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.rsplitn(3, ':');
        let instance = parts.next().unwrap_or_default();
        let region = parts.next();
        let project = parts.next();
        match (project, region) {
            (Some(project), Some(region)) => Self::new(project, region, instance),
            _ => Err(EngineError::validation(format!(
                "Instance connection name '{}' must be in the form project:region:instance",
                s
            ))),
        }
    }
}

/// How the database session authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum DbAuth {
    Password { user: String, password: String },
    /// IAM database authentication; the access token is the password.
    Iam { user: String },
}

impl DbAuth {
    pub fn user(&self) -> &str {
        match self {
            DbAuth::Password { user, .. } | DbAuth::Iam { user } => user,
        }
    }

    pub fn is_iam(&self) -> bool {
        matches!(self, DbAuth::Iam { .. })
    }
}

impl fmt::Debug for DbAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbAuth::Password { user, .. } => f
                .debug_struct("Password")
                .field("user", user)
                .field("password", &"***")
                .finish(),
            DbAuth::Iam { user } => f.debug_struct("Iam").field("user", user).finish(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpMapping {
    #[serde(rename = "type")]
    kind: String,
    ip_address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectSettings {
    #[serde(default)]
    ip_addresses: Vec<IpMapping>,
    pub region: String,
    pub database_version: Option<String>,
    #[serde(default)]
    pub psc_enabled: bool,
    pub dns_name: Option<String>,
}

impl ConnectSettings {
    pub fn address_for(&self, ip_type: IpType) -> Result<String> {
        let address = match ip_type {
            IpType::Psc => {
                if self.psc_enabled {
                    self.dns_name.clone()
                } else {
                    None
                }
            }
            IpType::Public | IpType::Private => {
                let wanted = if ip_type == IpType::Public { "PRIMARY" } else { "PRIVATE" };
                self.ip_addresses
                    .iter()
                    .find(|mapping| mapping.kind == wanted)
                    .map(|mapping| mapping.ip_address.clone())
            }
        };

        address.ok_or_else(|| {
            EngineError::Connector(format!(
                "Instance does not have an address of type {:?}",
                ip_type
            ))
        })
    }
}

#[derive(Clone)]
pub struct ConnectorOptions {
    pub quota_project: Option<String>,
    pub user_agent: String,
    pub admin_api_endpoint: String,
    pub timeout: Duration,
    pub token_source: Option<Arc<dyn TokenSource>>,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            quota_project: None,
            user_agent: USER_AGENT.to_string(),
            admin_api_endpoint: DEFAULT_ADMIN_API_ENDPOINT.to_string(),
            timeout: Duration::from_secs(30),
            token_source: None,
        }
    }
}

/// Resolves Cloud SQL instances to reachable addresses and builds
/// authenticated connect options for them.
pub struct CloudSqlConnector {
    client: reqwest::Client,
    options: ConnectorOptions,
    token_source: Arc<dyn TokenSource>,
    settings: RwLock<HashMap<InstanceConnectionName, ConnectSettings>>,
    closed: AtomicBool,
}

impl CloudSqlConnector {
    pub fn new(options: ConnectorOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .user_agent(options.user_agent.clone())
            .build()?;
        let token_source: Arc<dyn TokenSource> = match &options.token_source {
            Some(source) => Arc::clone(source),
            None => Arc::new(MetadataTokenSource::new()?),
        };

        Ok(Self {
            client,
            options,
            token_source,
            settings: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn token_source(&self) -> Arc<dyn TokenSource> {
        Arc::clone(&self.token_source)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.settings.write().await.clear();
            debug!("Cloud SQL connector closed");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(EngineError::Connector("connector is closed".to_string()))
        } else {
            Ok(())
        }
    }

    /// Instance metadata, cached per instance for the connector's lifetime.
    pub async fn connect_settings(&self, name: &InstanceConnectionName) -> Result<ConnectSettings> {
        self.ensure_open()?;
        {
            let settings = self.settings.read().await;
            if let Some(found) = settings.get(name) {
                debug!("Using cached connect settings for {}", name);
                return Ok(found.clone());
            }
        }

        let fetched = self.fetch_connect_settings(name).await?;
        let mut settings = self.settings.write().await;
        settings.insert(name.clone(), fetched.clone());
        Ok(fetched)
    }

    async fn fetch_connect_settings(&self, name: &InstanceConnectionName) -> Result<ConnectSettings> {
        let url = format!(
            "{}/sql/v1beta4/projects/{}/instances/{}/connectSettings",
            self.options.admin_api_endpoint.trim_end_matches('/'),
            name.project,
            name.instance
        );
        let token = self.token_source.token().await?;

        info!("Fetching connect settings for {}", name);
        let mut request = self.client.get(&url).bearer_auth(&token.token);
        if let Some(quota_project) = &self.options.quota_project {
            request = request.header("x-goog-user-project", quota_project);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Connector(format!(
                "Admin API returned {} for {}: {}",
                status, name, body
            )));
        }

        let settings: ConnectSettings = response.json().await?;
        if settings.region != name.region {
            return Err(EngineError::Connector(format!(
                "The region specified for the Cloud SQL instance is incorrect. \
                 Expected '{}', got '{}'",
                settings.region, name.region
            )));
        }
        Ok(settings)
    }

    pub async fn resolve(&self, name: &InstanceConnectionName, ip_type: IpType) -> Result<String> {
        let settings = self.connect_settings(name).await?;
        settings.address_for(ip_type)
    }

    /// Connect options with freshly resolved address and credentials. For IAM
    /// auth a new access token is fetched on every call.
    pub async fn connect_options(
        &self,
        name: &InstanceConnectionName,
        database: &str,
        auth: &DbAuth,
        ip_type: IpType,
    ) -> Result<PgConnectOptions> {
        let host = self.resolve(name, ip_type).await?;
        let password = match auth {
            DbAuth::Password { password, .. } => password.clone(),
            DbAuth::Iam { .. } => self.token_source.token().await?.token,
        };

        debug!("Connecting to {} at {} as {}", name, host, auth.user());
        Ok(PgConnectOptions::new()
            .host(&host)
            .port(POSTGRES_PORT)
            .database(database)
            .username(auth.user())
            .password(&password)
            .ssl_mode(PgSslMode::Require))
    }

    pub async fn connect(
        &self,
        name: &InstanceConnectionName,
        database: &str,
        auth: &DbAuth,
        ip_type: IpType,
    ) -> Result<PgConnection> {
        let options = self.connect_options(name, database, auth, ip_type).await?;
        Ok(PgConnection::connect_with(&options).await?)
    }

    /// Blocking twin of [`connect`](Self::connect), run on the shared
    /// background runtime. The connection stays bound to that runtime.
    pub fn connect_blocking(
        self: &Arc<Self>,
        name: &InstanceConnectionName,
        database: &str,
        auth: &DbAuth,
        ip_type: IpType,
    ) -> Result<PgConnection> {
        let connector = Arc::clone(self);
        let name = name.clone();
        let database = database.to_string();
        let auth = auth.clone();
        default_runtime()?
            .block_on(async move { connector.connect(&name, &database, &auth, ip_type).await })?
    }
}

static CONNECTOR: Mutex<Option<Arc<CloudSqlConnector>>> = Mutex::new(None);

/// The process-wide connector, created on first use. Concurrent callers see
/// the same instance; options only matter for the call that creates it.
pub fn shared_connector(options: &ConnectorOptions) -> Result<Arc<CloudSqlConnector>> {
    let mut slot = CONNECTOR
        .lock()
        .map_err(|_| EngineError::Connector("connector lock poisoned".to_string()))?;

    if let Some(connector) = slot.as_ref() {
        if !connector.is_closed() {
            return Ok(Arc::clone(connector));
        }
    }

    info!("Initializing Cloud SQL connector");
    let connector = Arc::new(CloudSqlConnector::new(options.clone())?);
    *slot = Some(Arc::clone(&connector));
    Ok(connector)
}

/// Drops the cached connector so the next construction creates a new one.
pub fn reset_shared_connector() {
    if let Ok(mut slot) = CONNECTOR.lock() {
        if slot.take().is_some() {
            debug!("Cleared cached Cloud SQL connector");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::datasource::auth::StaticTokenSource;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings() -> ConnectSettings {
        serde_json::from_value(json!({
            "kind": "sql#connectSettings",
            "ipAddresses": [
                {"type": "PRIMARY", "ipAddress": "34.1.2.3"},
                {"type": "PRIVATE", "ipAddress": "10.0.0.3"}
            ],
            "region": "us-central1",
            "databaseVersion": "POSTGRES_15",
            "pscEnabled": true,
            "dnsName": "abc.psc.us-central1.sql.goog."
        }))
        .unwrap()
    }

    /// Admin API double answering `connectSettings` for instance `i` in
    /// project `p` exactly once.
    async fn fake_admin_api(body: serde_json::Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sql/v1beta4/projects/p/instances/i/connectSettings"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(&server)
            .await;
        server
    }

    fn test_connector(endpoint: String) -> CloudSqlConnector {
        CloudSqlConnector::new(ConnectorOptions {
            admin_api_endpoint: endpoint,
            token_source: Some(Arc::new(StaticTokenSource::new("test-token"))),
            ..ConnectorOptions::default()
        })
        .unwrap()
    }

    #[test]
    fn test_address_selection_by_ip_type() {
        let settings = settings();
        assert_eq!(settings.address_for(IpType::Public).unwrap(), "34.1.2.3");
        assert_eq!(settings.address_for(IpType::Private).unwrap(), "10.0.0.3");
        assert_eq!(
            settings.address_for(IpType::Psc).unwrap(),
            "abc.psc.us-central1.sql.goog."
        );
    }

    #[test]
    fn test_missing_address_type_is_an_error() {
        let settings: ConnectSettings = serde_json::from_value(json!({
            "ipAddresses": [{"type": "PRIVATE", "ipAddress": "10.0.0.3"}],
            "region": "europe-west1"
        }))
        .unwrap();
        assert!(matches!(
            settings.address_for(IpType::Public),
            Err(EngineError::Connector(_))
        ));
        assert!(settings.address_for(IpType::Psc).is_err());
    }

    #[test]
    fn test_instance_connection_name_parsing() {
        let name: InstanceConnectionName = "my-project:us-central1:my-instance".parse().unwrap();
        assert_eq!(name.project, "my-project");
        assert_eq!(name.region, "us-central1");
        assert_eq!(name.instance, "my-instance");
        assert_eq!(name.to_string(), "my-project:us-central1:my-instance");

        let scoped: InstanceConnectionName = "example.com:proj:us-east1:db".parse().unwrap();
        assert_eq!(scoped.project, "example.com:proj");

        assert!("missing-parts".parse::<InstanceConnectionName>().is_err());
        assert!("p::i".parse::<InstanceConnectionName>().is_err());
    }

    #[test]
    fn test_ip_type_parsing() {
        assert_eq!("PUBLIC".parse::<IpType>().unwrap(), IpType::Public);
        assert_eq!("private".parse::<IpType>().unwrap(), IpType::Private);
        assert_eq!("Psc".parse::<IpType>().unwrap(), IpType::Psc);
        assert!("carrier-pigeon".parse::<IpType>().unwrap_err().is_validation_error());
    }

    #[test]
    fn test_db_auth_debug_hides_password() {
        let auth = DbAuth::Password {
            user: "postgres".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{:?}", auth);
        assert!(rendered.contains("postgres"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_resolve_fetches_once_and_caches() {
        let server = fake_admin_api(
            json!({
                "ipAddresses": [{"type": "PRIMARY", "ipAddress": "34.1.2.3"}],
                "region": "us-central1"
            }),
        )
        .await;
        let connector = test_connector(server.uri());
        let name = InstanceConnectionName::new("p", "us-central1", "i").unwrap();

        assert_eq!(connector.resolve(&name, IpType::Public).await.unwrap(), "34.1.2.3");
        // The mock expects a single request; it verifies on drop.
        assert_eq!(connector.resolve(&name, IpType::Public).await.unwrap(), "34.1.2.3");
    }

    #[tokio::test]
    async fn test_region_mismatch_is_rejected() {
        let server = fake_admin_api(
            json!({
                "ipAddresses": [{"type": "PRIMARY", "ipAddress": "34.1.2.3"}],
                "region": "europe-west1"
            }),
        )
        .await;
        let connector = test_connector(server.uri());
        let name = InstanceConnectionName::new("p", "us-central1", "i").unwrap();

        let err = connector.resolve(&name, IpType::Public).await.unwrap_err();
        assert!(err.to_string().contains("region"));
    }

    #[tokio::test]
    async fn test_connect_options_use_password_auth() {
        let server = fake_admin_api(
            json!({
                "ipAddresses": [{"type": "PRIVATE", "ipAddress": "10.0.0.3"}],
                "region": "us-central1"
            }),
        )
        .await;
        let connector = test_connector(server.uri());
        let name = InstanceConnectionName::new("p", "us-central1", "i").unwrap();
        let auth = DbAuth::Password {
            user: "app".to_string(),
            password: "secret".to_string(),
        };

        let options = connector
            .connect_options(&name, "appdb", &auth, IpType::Private)
            .await
            .unwrap();
        assert_eq!(options.get_host(), "10.0.0.3");
        assert_eq!(options.get_port(), 5432);
        assert_eq!(options.get_username(), "app");
        assert_eq!(options.get_database(), Some("appdb"));
    }

    fn unreachable_instance() -> serde_json::Value {
        json!({
            "ipAddresses": [{"type": "PRIMARY", "ipAddress": "db.invalid"}],
            "region": "us-central1"
        })
    }

    fn password_auth() -> DbAuth {
        DbAuth::Password {
            user: "app".to_string(),
            password: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_connect_surfaces_driver_error() {
        let server = fake_admin_api(unreachable_instance()).await;
        let connector = test_connector(server.uri());
        let name = InstanceConnectionName::new("p", "us-central1", "i").unwrap();

        let err = connector
            .connect(&name, "appdb", &password_auth(), IpType::Public)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Sqlx(_)), "unexpected error: {}", err);
    }

    #[test]
    fn test_connect_blocking_from_plain_thread() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let server = rt.block_on(fake_admin_api(unreachable_instance()));
        let _enter = rt.enter();
        let connector = Arc::new(test_connector(server.uri()));
        let name = InstanceConnectionName::new("p", "us-central1", "i").unwrap();

        let result = std::thread::spawn(move || {
            assert!(tokio::runtime::Handle::try_current().is_err());
            connector.connect_blocking(&name, "appdb", &password_auth(), IpType::Public)
        })
        .join()
        .unwrap();

        let err = result.unwrap_err();
        assert!(matches!(err, EngineError::Sqlx(_)), "unexpected error: {}", err);
        drop(server);
    }

    #[tokio::test]
    async fn test_closed_connector_refuses_work() {
        let connector = test_connector("http://127.0.0.1:9".to_string());
        connector.close().await;
        assert!(connector.is_closed());

        let name = InstanceConnectionName::new("p", "r", "i").unwrap();
        assert!(matches!(
            connector.resolve(&name, IpType::Public).await,
            Err(EngineError::Connector(_))
        ));
    }
}
