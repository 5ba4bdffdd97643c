pub mod datasource;
pub mod runtime;
