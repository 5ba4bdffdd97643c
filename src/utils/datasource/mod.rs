pub mod auth;
pub mod base;
pub mod connection_config;
pub mod connector;

pub use auth::{AccessToken, MetadataTokenSource, StaticTokenSource, TokenSource};
pub use base::{AsyncEngine, RowMapping};
pub use connection_config::{ConnectionUrl, EngineArgs, PoolClass};
pub use connector::{CloudSqlConnector, ConnectorOptions, InstanceConnectionName, IpType};
