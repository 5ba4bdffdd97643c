// Cloud SQL for PostgreSQL engine library
// Builds pooled engines for Cloud SQL instances and validates table columns

pub mod config;
pub mod core;
pub mod error;
pub mod utils;

// Re-export commonly used types for convenience
pub use crate::core::column::Column;
pub use crate::core::engine::{CreateKey, InstanceOptions, PostgresEngine};
pub use crate::core::tables::VectorStoreTableOptions;
pub use config::InstanceConfig;
pub use error::{EngineError, Result};
pub use utils::datasource::{
    AsyncEngine, ConnectionUrl, EngineArgs, IpType, RowMapping, StaticTokenSource, TokenSource,
};
