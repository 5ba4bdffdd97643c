//! Live tests against a Cloud SQL instance. Configure through the
//! environment (see `InstanceConfig::from_env`) and run with `--ignored`.

use cloudsql_pg_engine::utils::datasource::connection_config::SUPPORTED_DRIVER;
use cloudsql_pg_engine::{ConnectionUrl, InstanceConfig, PostgresEngine};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;

fn config() -> InstanceConfig {
    InstanceConfig::from_env().expect("instance environment must be configured")
}

#[tokio::test]
#[ignore]
async fn test_password_auth() {
    let config = config();
    let engine = PostgresEngine::from_instance(config.instance_options())
        .await
        .unwrap();

    let rows = engine.fetch("SELECT 1").await.unwrap();
    assert_eq!(rows.len(), 1);
    engine.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_iam_account_override() {
    let config = config();
    let mut options = config.instance_options();
    options.user = None;
    options.password = None;
    options.iam_account_email = config.iam_account.clone();

    let engine = PostgresEngine::from_instance(options).await.unwrap();
    engine.execute("SELECT 1").await.unwrap();
    engine.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_from_engine_with_prebuilt_pool() {
    let config = config();
    let options = ConnectionUrl::create(
        "postgresql",
        config.db_user.as_deref().unwrap(),
        config.db_password.as_deref().unwrap_or_default(),
        config.ip_address.as_deref().unwrap(),
        5432,
        &config.database_id,
    )
    .unwrap()
    .validate()
    .unwrap();
    let pool = PgPoolOptions::new().connect_with(options).await.unwrap();

    let engine = PostgresEngine::from_engine(pool).unwrap();
    engine.execute("SELECT 1").await.unwrap();
    engine.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_from_connection_string() {
    let config = config();
    let url = config.connection_url().unwrap();
    let engine = PostgresEngine::from_engine_args(url, json!({"echo": true, "poolclass": "NullPool"}))
        .unwrap();

    engine.execute("SELECT 1").await.unwrap();
    engine.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_from_connection_string_text() {
    let config = config();
    let url = format!(
        "{}://{}:{}@{}:5432/{}",
        SUPPORTED_DRIVER,
        config.db_user.as_deref().unwrap(),
        config.db_password.as_deref().unwrap_or_default(),
        config.ip_address.as_deref().unwrap(),
        config.database_id
    );
    let engine = PostgresEngine::from_engine_args(url, json!({"pool_size": 2})).unwrap();
    engine.fetch("SELECT 1").await.unwrap();
    engine.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_reset_connector_then_reconstruct() {
    let config = config();
    let first = PostgresEngine::from_instance(config.instance_options())
        .await
        .unwrap();
    first.close().await.unwrap();

    PostgresEngine::reset_connector();

    let second = PostgresEngine::from_instance(config.instance_options())
        .await
        .unwrap();
    second.execute("SELECT 1").await.unwrap();
    second.close().await.unwrap();
}

#[test]
#[ignore]
fn test_blocking_password_auth() {
    let config = config();
    let engine = PostgresEngine::from_instance_blocking(config.instance_options()).unwrap();

    let rows = engine.fetch_blocking("SELECT 1").unwrap();
    assert_eq!(rows.len(), 1);
    engine.close_blocking().unwrap();
}

#[test]
#[ignore]
fn test_blocking_from_connection_string() {
    let config = config();
    let engine =
        PostgresEngine::from_engine_args(config.connection_url().unwrap(), json!(null)).unwrap();

    engine.execute_blocking("SELECT 1").unwrap();
    engine.close_blocking().unwrap();
}

#[tokio::test]
#[ignore]
async fn test_fetch_decodes_non_scalar_types() {
    let config = config();
    let engine = PostgresEngine::from_engine_args(config.connection_url().unwrap(), json!(null))
        .unwrap();

    let rows = engine
        .fetch(
            "SELECT 1.5::numeric AS n, ARRAY['a','b']::text[] AS arr, '\\x0102'::bytea AS b, \
             '1 day 2 hours'::interval AS iv, '10.1.2.3'::inet AS ip, ARRAY[1,2]::int8[] AS ids, \
             NULL::numeric AS missing, 1 AS i",
        )
        .await
        .unwrap();
    let row = &rows[0];

    assert_eq!(row["n"], json!("1.5"));
    assert_eq!(row["arr"], json!(["a", "b"]));
    assert_eq!(row["b"], json!("\\x0102"));
    assert_eq!(
        row["iv"],
        json!({"months": 0, "days": 1, "microseconds": 7_200_000_000i64})
    );
    assert_eq!(row["ip"], json!("10.1.2.3"));
    assert_eq!(row["ids"], json!([1, 2]));
    assert!(row["missing"].is_null());
    assert_eq!(row["i"], json!(1));
    engine.close().await.unwrap();
}
