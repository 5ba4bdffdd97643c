use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::postgres::PgPool;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::tables::{self, VectorStoreTableOptions};
use crate::error::{EngineError, Result};
use crate::utils::datasource::auth::{iam_database_user, AccessToken, TokenSource};
use crate::utils::datasource::base::{AsyncEngine, RowMapping, POSTGRES_DIALECT};
use crate::utils::datasource::connection_config::{ConnectionUrl, EngineArgs};
use crate::utils::datasource::connector::{
    reset_shared_connector, shared_connector, CloudSqlConnector, ConnectorOptions, DbAuth,
    InstanceConnectionName, IpType,
};
use crate::utils::runtime::{default_runtime, BackgroundRuntime};

/// Token that gates the raw constructor. Only the crate holds the instance
/// that [`PostgresEngine::new`] accepts.
pub struct CreateKey {
    _id: u8,
}

impl CreateKey {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { _id: 0 }
    }
}

static ENGINE_CREATE_KEY: CreateKey = CreateKey { _id: 0 };

/// Never wait less than this between IAM token refreshes.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
/// Used when the token source does not report an expiry.
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(45 * 60);

/// Where and how to reach a Cloud SQL instance.
#[derive(Clone)]
pub struct InstanceOptions {
    pub project_id: String,
    pub region: String,
    pub instance: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ip_type: IpType,
    pub quota_project: Option<String>,
    pub iam_account_email: Option<String>,
    pub token_source: Option<Arc<dyn TokenSource>>,
    pub engine_args: EngineArgs,
}

impl InstanceOptions {
    pub fn new(
        project_id: impl Into<String>,
        region: impl Into<String>,
        instance: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            region: region.into(),
            instance: instance.into(),
            database: database.into(),
            user: None,
            password: None,
            ip_type: IpType::default(),
            quota_project: None,
            iam_account_email: None,
            token_source: None,
            engine_args: EngineArgs::default(),
        }
    }

    pub fn with_password(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_iam_account_email(mut self, email: impl Into<String>) -> Self {
        self.iam_account_email = Some(email.into());
        self
    }

    pub fn with_ip_type(mut self, ip_type: IpType) -> Self {
        self.ip_type = ip_type;
        self
    }

    pub fn with_quota_project(mut self, quota_project: impl Into<String>) -> Self {
        self.quota_project = Some(quota_project.into());
        self
    }

    pub fn with_token_source(mut self, token_source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(token_source);
        self
    }

    pub fn with_engine_args(mut self, engine_args: EngineArgs) -> Self {
        self.engine_args = engine_args;
        self
    }

    pub fn connection_name(&self) -> Result<InstanceConnectionName> {
        InstanceConnectionName::new(&self.project_id, &self.region, &self.instance)
    }

    /// Argument checks that run before any network activity.
    pub fn validate(&self) -> Result<()> {
        self.connection_name()?;
        if self.database.trim().is_empty() {
            return Err(EngineError::validation("database cannot be empty"));
        }
        if self.user.is_some() != self.password.is_some() {
            return Err(EngineError::validation(
                "Only one of 'user' or 'password' were specified. Either both should be \
                 specified to use basic user/password authentication or neither for IAM DB \
                 authentication.",
            ));
        }
        self.engine_args.validate()
    }

    fn connector_options(&self) -> ConnectorOptions {
        ConnectorOptions {
            quota_project: self.quota_project.clone(),
            token_source: self.token_source.clone(),
            ..ConnectorOptions::default()
        }
    }

    async fn resolve_auth(&self, connector: &CloudSqlConnector) -> Result<DbAuth> {
        if let (Some(user), Some(password)) = (&self.user, &self.password) {
            return Ok(DbAuth::Password {
                user: user.clone(),
                password: password.clone(),
            });
        }

        let email = match &self.iam_account_email {
            Some(email) => email.clone(),
            None => connector.token_source().principal_email().await?,
        };
        Ok(DbAuth::Iam {
            user: iam_database_user(&email),
        })
    }
}

impl std::fmt::Debug for InstanceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceOptions")
            .field("project_id", &self.project_id)
            .field("region", &self.region)
            .field("instance", &self.instance)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("ip_type", &self.ip_type)
            .field("quota_project", &self.quota_project)
            .field("iam_account_email", &self.iam_account_email)
            .finish_non_exhaustive()
    }
}

/// Handle around a pooled PostgreSQL engine.
///
/// Build one with [`from_instance`](Self::from_instance),
/// [`from_engine_args`](Self::from_engine_args) or
/// [`from_engine`](Self::from_engine).
pub struct PostgresEngine {
    pool: Arc<dyn AsyncEngine>,
    runtime: Option<Arc<BackgroundRuntime>>,
    connector: Option<Arc<CloudSqlConnector>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PostgresEngine {
    /// Raw constructor. Fails unless called with the crate's own key; use the
    /// factory methods instead.
    pub fn new(
        key: &CreateKey,
        pool: Arc<dyn AsyncEngine>,
        runtime: Option<Arc<BackgroundRuntime>>,
    ) -> Result<Self> {
        if !std::ptr::eq(key, &ENGINE_CREATE_KEY) {
            return Err(EngineError::ConstructorMisuse);
        }
        Ok(Self {
            pool,
            runtime,
            connector: None,
            refresh_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Connects to a Cloud SQL instance through the process-wide connector.
    pub async fn from_instance(options: InstanceOptions) -> Result<Self> {
        options.validate()?;
        let connector = shared_connector(&options.connector_options())?;
        let (pool, refresh_task) = connect_instance(connector, &options).await?;

        let engine = Self::new(&ENGINE_CREATE_KEY, Arc::new(pool), None)?;
        engine.set_refresh_task(refresh_task);
        Ok(engine)
    }

    /// Blocking twin of [`from_instance`](Self::from_instance). Construction
    /// runs on the shared background runtime, which the engine keeps using.
    pub fn from_instance_blocking(options: InstanceOptions) -> Result<Self> {
        options.validate()?;
        let runtime = default_runtime()?;
        let (pool, refresh_task) = runtime.block_on(async move {
            let connector = shared_connector(&options.connector_options())?;
            connect_instance(connector, &options).await
        })??;

        let engine = Self::new(&ENGINE_CREATE_KEY, Arc::new(pool), Some(runtime))?;
        engine.set_refresh_task(refresh_task);
        Ok(engine)
    }

    /// Like [`from_instance`](Self::from_instance) but with a caller-supplied
    /// connector. The engine takes ownership and closes it on `close`.
    pub async fn from_instance_with_connector(
        connector: Arc<CloudSqlConnector>,
        options: InstanceOptions,
    ) -> Result<Self> {
        options.validate()?;
        let (pool, refresh_task) = connect_instance(Arc::clone(&connector), &options).await?;

        let mut engine = Self::new(&ENGINE_CREATE_KEY, Arc::new(pool), None)?;
        engine.connector = Some(connector);
        engine.set_refresh_task(refresh_task);
        Ok(engine)
    }

    /// Builds an engine from a connection URL and free-form engine options.
    /// Nothing connects until the first query.
    pub fn from_engine_args(url: impl Into<ConnectionUrl>, args: serde_json::Value) -> Result<Self> {
        let url = url.into();
        let connect_options = url.validate()?;
        let args = EngineArgs::from_value(args)?;
        Self::lazy_pool(connect_options, &args)
    }

    pub fn from_engine_config(url: impl Into<ConnectionUrl>, args: EngineArgs) -> Result<Self> {
        let url = url.into();
        let connect_options = url.validate()?;
        args.validate()?;
        Self::lazy_pool(connect_options, &args)
    }

    fn lazy_pool(connect_options: sqlx::postgres::PgConnectOptions, args: &EngineArgs) -> Result<Self> {
        let connect_options = args.apply_connect_options(connect_options);
        let pool_options = args.pool_options()?;

        // Pool maintenance tasks need a runtime; borrow the background one
        // when the caller has none.
        match tokio::runtime::Handle::try_current() {
            Ok(_) => {
                let pool = pool_options.connect_lazy_with(connect_options);
                Self::new(&ENGINE_CREATE_KEY, Arc::new(pool), None)
            }
            Err(_) => {
                let runtime = default_runtime()?;
                let pool = {
                    let _guard = runtime.handle().enter();
                    pool_options.connect_lazy_with(connect_options)
                };
                Self::new(&ENGINE_CREATE_KEY, Arc::new(pool), Some(runtime))
            }
        }
    }

    /// Wraps an engine the caller already built, e.g. a pool with a custom
    /// connect routine.
    pub fn from_engine(engine: impl AsyncEngine + 'static) -> Result<Self> {
        Self::from_engine_arc(Arc::new(engine))
    }

    pub fn from_engine_arc(engine: Arc<dyn AsyncEngine>) -> Result<Self> {
        if engine.is_closed() {
            return Err(EngineError::validation("cannot wrap an engine that is already closed"));
        }
        if engine.dialect() != POSTGRES_DIALECT {
            return Err(EngineError::validation(format!(
                "engine dialect must be '{}', got '{}'",
                POSTGRES_DIALECT,
                engine.dialect()
            )));
        }
        Self::new(&ENGINE_CREATE_KEY, engine, None)
    }

    /// Clears the process-wide connector so the next instance construction
    /// creates a fresh one.
    pub fn reset_connector() {
        reset_shared_connector();
    }

    pub fn pool(&self) -> Arc<dyn AsyncEngine> {
        Arc::clone(&self.pool)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Awaits `future` on the engine's background runtime if it has one,
    /// otherwise inline.
    pub async fn run_as_async<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match &self.runtime {
            Some(runtime) => runtime.run(future).await,
            None => Ok(future.await),
        }
    }

    /// Blocks on `future`, using the engine's background runtime or the
    /// shared one.
    pub fn run_as_sync<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match &self.runtime {
            Some(runtime) => runtime.block_on(future),
            None => default_runtime()?.block_on(future),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    pub async fn execute(&self, sql: &str) -> Result<u64> {
        self.ensure_open()?;
        let pool = self.pool();
        let sql = sql.to_string();
        self.run_as_async(async move { pool.execute(&sql).await }).await?
    }

    pub async fn fetch(&self, sql: &str) -> Result<Vec<RowMapping>> {
        self.ensure_open()?;
        let pool = self.pool();
        let sql = sql.to_string();
        self.run_as_async(async move { pool.fetch_all(&sql).await }).await?
    }

    pub fn execute_blocking(&self, sql: &str) -> Result<u64> {
        self.ensure_open()?;
        let pool = self.pool();
        let sql = sql.to_string();
        self.run_as_sync(async move { pool.execute(&sql).await })?
    }

    pub fn fetch_blocking(&self, sql: &str) -> Result<Vec<RowMapping>> {
        self.ensure_open()?;
        let pool = self.pool();
        let sql = sql.to_string();
        self.run_as_sync(async move { pool.fetch_all(&sql).await })?
    }

    async fn execute_all(&self, statements: Vec<String>) -> Result<()> {
        for statement in statements {
            debug!("Executing DDL: {}", statement);
            self.execute(&statement).await?;
        }
        Ok(())
    }

    pub async fn init_vector_store_table(&self, options: VectorStoreTableOptions) -> Result<()> {
        let statements = tables::vector_store_table_ddl(&options)?;
        self.execute_all(statements).await?;
        info!("Initialized vector store table {}", options.table_name);
        Ok(())
    }

    pub async fn init_doc_store_table(
        &self,
        table_name: &str,
        schema_name: &str,
        overwrite_existing: bool,
    ) -> Result<()> {
        let statements = tables::doc_store_table_ddl(table_name, schema_name, overwrite_existing)?;
        self.execute_all(statements).await
    }

    pub async fn init_index_store_table(
        &self,
        table_name: &str,
        schema_name: &str,
        overwrite_existing: bool,
    ) -> Result<()> {
        let statements = tables::index_store_table_ddl(table_name, schema_name, overwrite_existing)?;
        self.execute_all(statements).await
    }

    pub async fn init_chat_store_table(
        &self,
        table_name: &str,
        schema_name: &str,
        overwrite_existing: bool,
    ) -> Result<()> {
        let statements = tables::chat_store_table_ddl(table_name, schema_name, overwrite_existing)?;
        self.execute_all(statements).await
    }

    /// Releases the pool and any owned connector. Closing again is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.abort_refresh_task();

        let pool = self.pool();
        let connector = self.connector.clone();
        self.run_as_async(async move {
            pool.close().await;
            if let Some(connector) = connector {
                connector.close().await;
            }
        })
        .await?;
        info!("PostgresEngine closed");
        Ok(())
    }

    pub fn close_blocking(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.abort_refresh_task();

        let pool = self.pool();
        let connector = self.connector.clone();
        self.run_as_sync(async move {
            pool.close().await;
            if let Some(connector) = connector {
                connector.close().await;
            }
        })?;
        info!("PostgresEngine closed");
        Ok(())
    }

    fn set_refresh_task(&self, task: Option<JoinHandle<()>>) {
        if let Ok(mut slot) = self.refresh_task.lock() {
            *slot = task;
        }
    }

    fn abort_refresh_task(&self) {
        if let Ok(mut slot) = self.refresh_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for PostgresEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresEngine")
            .field("dialect", &self.pool.dialect())
            .field("background_runtime", &self.runtime.is_some())
            .field("owns_connector", &self.connector.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for PostgresEngine {
    fn drop(&mut self) {
        self.abort_refresh_task();
    }
}

/// Resolves credentials and the instance address, then opens the pool. For
/// IAM auth a background task keeps the pool's token fresh.
async fn connect_instance(
    connector: Arc<CloudSqlConnector>,
    options: &InstanceOptions,
) -> Result<(PgPool, Option<JoinHandle<()>>)> {
    let name = options.connection_name()?;
    let auth = options.resolve_auth(&connector).await?;
    info!(
        "Creating engine for {} (database: {}, iam: {})",
        name,
        options.database,
        auth.is_iam()
    );

    let connect_options = connector
        .connect_options(&name, &options.database, &auth, options.ip_type)
        .await?;
    let connect_options = options.engine_args.apply_connect_options(connect_options);
    let pool = options
        .engine_args
        .pool_options()?
        .connect_with(connect_options)
        .await?;

    let refresh_task = if auth.is_iam() {
        Some(tokio::spawn(refresh_iam_token(
            connector,
            pool.clone(),
            name,
            options.clone(),
            auth,
        )))
    } else {
        None
    };

    Ok((pool, refresh_task))
}

/// How long to wait before the next refresh, given the current token or
/// `None` when it could not be read.
fn next_refresh_delay(token: Option<&AccessToken>) -> Duration {
    match token {
        Some(token) => token
            .refresh_in()
            .unwrap_or(DEFAULT_REFRESH_INTERVAL)
            .max(MIN_REFRESH_INTERVAL),
        None => MIN_REFRESH_INTERVAL,
    }
}

/// Points new pool connections at freshly resolved options, which carry a
/// current access token.
async fn refresh_connect_options(
    connector: &CloudSqlConnector,
    pool: &PgPool,
    name: &InstanceConnectionName,
    options: &InstanceOptions,
    auth: &DbAuth,
) -> Result<()> {
    let connect_options = connector
        .connect_options(name, &options.database, auth, options.ip_type)
        .await?;
    pool.set_connect_options(options.engine_args.apply_connect_options(connect_options));
    Ok(())
}

async fn refresh_iam_token(
    connector: Arc<CloudSqlConnector>,
    pool: PgPool,
    name: InstanceConnectionName,
    options: InstanceOptions,
    auth: DbAuth,
) {
    loop {
        let wait = match connector.token_source().token().await {
            Ok(token) => next_refresh_delay(Some(&token)),
            Err(e) => {
                warn!("Failed to read IAM token expiry for {}: {}", name, e);
                next_refresh_delay(None)
            }
        };
        tokio::time::sleep(wait).await;

        if pool.is_closed() || connector.is_closed() {
            break;
        }
        match refresh_connect_options(&connector, &pool, &name, &options, &auth).await {
            Ok(()) => debug!("Refreshed IAM token for {}", name),
            Err(e) => warn!("Failed to refresh IAM token for {}: {}", name, e),
        }
    }
}
