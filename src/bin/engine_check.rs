use anyhow::{Context, Result};
use dotenv::dotenv;
use tracing::info;

use cloudsql_pg_engine::{InstanceConfig, PostgresEngine};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cloudsql_pg_engine=info".parse()?)
                .add_directive("engine_check=info".parse()?)
                .add_directive("sqlx=warn".parse()?),
        )
        .init();

    let config = InstanceConfig::from_env().context("loading instance configuration")?;

    // With IP_ADDRESS set, skip the connector and go straight to the URL.
    let engine = if config.ip_address.is_some() {
        info!("Connecting by URL to {:?}", config.ip_address);
        PostgresEngine::from_engine_args(config.connection_url()?, serde_json::Value::Null)?
    } else {
        info!(
            "Connecting to {}:{}:{}",
            config.project_id, config.region, config.instance_id
        );
        PostgresEngine::from_instance(config.instance_options()).await?
    };

    let rows = engine.fetch("SELECT 1").await?;
    for row in &rows {
        println!("{}", serde_json::to_string(row)?);
    }

    engine.close().await?;
    info!("Engine check passed");
    Ok(())
}
