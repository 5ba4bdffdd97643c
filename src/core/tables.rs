//! DDL for the tables backing the vector, document, index and chat stores.
//!
//! Builders only produce statements; `PostgresEngine` executes them.

use super::column::{quote_identifier, Column};
use crate::error::{EngineError, Result};

pub const DEFAULT_SCHEMA: &str = "public";

#[derive(Debug, Clone)]
pub struct VectorStoreTableOptions {
    pub table_name: String,
    pub vector_size: u32,
    pub schema_name: String,
    pub id_column: String,
    pub text_column: String,
    pub embedding_column: String,
    pub metadata_json_column: String,
    pub metadata_columns: Vec<Column>,
    pub ref_doc_id_column: String,
    pub node_column: String,
    pub stores_text: bool,
    pub overwrite_existing: bool,
}

impl VectorStoreTableOptions {
    pub fn new(table_name: impl Into<String>, vector_size: u32) -> Self {
        Self {
            table_name: table_name.into(),
            vector_size,
            schema_name: DEFAULT_SCHEMA.to_string(),
            id_column: "node_id".to_string(),
            text_column: "text".to_string(),
            embedding_column: "embedding".to_string(),
            metadata_json_column: "li_metadata".to_string(),
            metadata_columns: Vec::new(),
            ref_doc_id_column: "ref_doc_id".to_string(),
            node_column: "node_data".to_string(),
            stores_text: true,
            overwrite_existing: false,
        }
    }

    pub fn schema_name(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = schema_name.into();
        self
    }

    pub fn metadata_columns(mut self, columns: Vec<Column>) -> Self {
        self.metadata_columns = columns;
        self
    }

    pub fn stores_text(mut self, stores_text: bool) -> Self {
        self.stores_text = stores_text;
        self
    }

    pub fn overwrite_existing(mut self, overwrite_existing: bool) -> Self {
        self.overwrite_existing = overwrite_existing;
        self
    }
}

fn require_identifier(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EngineError::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

fn qualified(schema_name: &str, table_name: &str) -> Result<String> {
    require_identifier("schema_name", schema_name)?;
    require_identifier("table_name", table_name)?;
    Ok(format!(
        "{}.{}",
        quote_identifier(schema_name),
        quote_identifier(table_name)
    ))
}

fn with_overwrite(table: &str, overwrite_existing: bool, create: String) -> Vec<String> {
    let mut statements = Vec::new();
    if overwrite_existing {
        statements.push(format!("DROP TABLE IF EXISTS {}", table));
    }
    statements.push(create);
    statements
}

pub fn vector_store_table_ddl(options: &VectorStoreTableOptions) -> Result<Vec<String>> {
    let table = qualified(&options.schema_name, &options.table_name)?;
    if options.vector_size == 0 {
        return Err(EngineError::validation("vector_size must be greater than zero"));
    }
    for (field, value) in [
        ("id_column", &options.id_column),
        ("text_column", &options.text_column),
        ("embedding_column", &options.embedding_column),
        ("metadata_json_column", &options.metadata_json_column),
        ("ref_doc_id_column", &options.ref_doc_id_column),
        ("node_column", &options.node_column),
    ] {
        require_identifier(field, value)?;
    }

    let mut columns = vec![
        format!("{} VARCHAR PRIMARY KEY", quote_identifier(&options.id_column)),
        format!(
            "{} TEXT{}",
            quote_identifier(&options.text_column),
            if options.stores_text { " NOT NULL" } else { "" }
        ),
        format!(
            "{} vector({}) NOT NULL",
            quote_identifier(&options.embedding_column),
            options.vector_size
        ),
        format!("{} JSONB", quote_identifier(&options.metadata_json_column)),
        format!("{} VARCHAR", quote_identifier(&options.ref_doc_id_column)),
        format!("{} JSON NOT NULL", quote_identifier(&options.node_column)),
    ];
    columns.extend(options.metadata_columns.iter().map(Column::to_sql));

    let mut statements = vec!["CREATE EXTENSION IF NOT EXISTS vector".to_string()];
    statements.extend(with_overwrite(
        &table,
        options.overwrite_existing,
        format!("CREATE TABLE {} (\n  {}\n)", table, columns.join(",\n  ")),
    ));
    Ok(statements)
}

pub fn doc_store_table_ddl(
    table_name: &str,
    schema_name: &str,
    overwrite_existing: bool,
) -> Result<Vec<String>> {
    let table = qualified(schema_name, table_name)?;
    Ok(with_overwrite(
        &table,
        overwrite_existing,
        format!(
            "CREATE TABLE {} (\n  id VARCHAR PRIMARY KEY,\n  doc_hash VARCHAR NOT NULL,\n  ref_doc_info JSONB,\n  node_data JSONB\n)",
            table
        ),
    ))
}

pub fn index_store_table_ddl(
    table_name: &str,
    schema_name: &str,
    overwrite_existing: bool,
) -> Result<Vec<String>> {
    let table = qualified(schema_name, table_name)?;
    Ok(with_overwrite(
        &table,
        overwrite_existing,
        format!(
            "CREATE TABLE {} (\n  index_id VARCHAR PRIMARY KEY,\n  type VARCHAR NOT NULL,\n  index_data JSONB NOT NULL\n)",
            table
        ),
    ))
}

pub fn chat_store_table_ddl(
    table_name: &str,
    schema_name: &str,
    overwrite_existing: bool,
) -> Result<Vec<String>> {
    let table = qualified(schema_name, table_name)?;
    Ok(with_overwrite(
        &table,
        overwrite_existing,
        format!(
            "CREATE TABLE {} (\n  id SERIAL PRIMARY KEY,\n  key VARCHAR NOT NULL,\n  message JSON NOT NULL\n)",
            table
        ),
    ))
}
