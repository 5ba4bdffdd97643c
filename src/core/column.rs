use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::error::{EngineError, Result};

lazy_static::lazy_static! {
    /// A type name, at most one numeric modifier such as `(255)` or
    /// `(10, 2)` directly after it, then optional trailing words as in
    /// `TIMESTAMP(3) WITH TIME ZONE`.
    static ref TYPE_TOKEN: regex::Regex = regex::Regex::new(
        r"^(?P<name>[A-Za-z][A-Za-z0-9_]*(?:\s+[A-Za-z][A-Za-z0-9_]*)*)(?:\s*\(\s*\d+\s*(?:,\s*\d+\s*)?\))?(?P<suffix>(?:\s+[A-Za-z][A-Za-z0-9_]*)*)$"
    )
    .expect("valid type token pattern");
    static ref WHITESPACE: regex::Regex = regex::Regex::new(r"\s+").expect("valid whitespace pattern");

    static ref SQL_TYPES: HashSet<&'static str> = [
        "SMALLINT", "INT2", "INTEGER", "INT", "INT4", "BIGINT", "INT8",
        "SMALLSERIAL", "SERIAL", "BIGSERIAL",
        "REAL", "FLOAT4", "FLOAT", "FLOAT8", "DOUBLE PRECISION", "NUMERIC", "DECIMAL", "MONEY",
        "BOOLEAN", "BOOL",
        "TEXT", "VARCHAR", "CHARACTER VARYING", "CHAR", "CHARACTER", "BPCHAR", "CITEXT",
        "UUID", "JSON", "JSONB", "BYTEA", "XML",
        "DATE", "TIME", "TIMETZ", "TIME WITH TIME ZONE", "TIME WITHOUT TIME ZONE",
        "TIMESTAMP", "TIMESTAMPTZ", "TIMESTAMP WITH TIME ZONE", "TIMESTAMP WITHOUT TIME ZONE",
        "INTERVAL",
        "INET", "CIDR", "MACADDR",
        "TSVECTOR", "TSQUERY",
        "VECTOR", "HALFVEC", "SPARSEVEC",
    ]
    .into_iter()
    .collect();
}

/// Reduces a type token to its allow-list form: upper case, modifier and
/// array suffixes removed, whitespace collapsed. `None` when the token is
/// malformed.
fn base_type(data_type: &str) -> Option<String> {
    let mut token = data_type.trim();
    while let Some(stripped) = token.strip_suffix("[]") {
        token = stripped.trim_end();
    }
    let captures = TYPE_TOKEN.captures(token)?;
    let base = format!("{}{}", &captures["name"], &captures["suffix"]);
    Some(WHITESPACE.replace_all(base.trim(), " ").to_uppercase())
}

pub fn is_sql_type(data_type: &str) -> bool {
    base_type(data_type).is_some_and(|base| SQL_TYPES.contains(base.as_str()))
}

/// A validated table column used when generating DDL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    name: String,
    data_type: String,
    nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let data_type = data_type.into();

        if name.trim().is_empty() {
            return Err(EngineError::validation("Column name cannot be empty"));
        }
        if name.contains('\0') {
            return Err(EngineError::validation("Column name cannot contain NUL characters"));
        }
        if !is_sql_type(&data_type) {
            return Err(EngineError::validation(format!(
                "Column data_type '{}' is not a recognized SQL type",
                data_type
            )));
        }

        Ok(Self {
            name,
            data_type: data_type.trim().to_string(),
            nullable: true,
        })
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Column definition for a `CREATE TABLE` statement.
    pub fn to_sql(&self) -> String {
        let mut sql = format!("{} {}", quote_identifier(&self.name), self.data_type);
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        sql
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

impl TryFrom<&Value> for Column {
    type Error = EngineError;

    /// Accepts `{"name": ..., "data_type": ..., "nullable": ...}`.
    fn try_from(value: &Value) -> Result<Self> {
        let name = match value.get("name") {
            Some(Value::String(name)) => name,
            _ => return Err(EngineError::validation("Column name must be type string")),
        };
        let data_type = match value.get("data_type") {
            Some(Value::String(data_type)) => data_type,
            _ => return Err(EngineError::validation("Column data_type must be type string")),
        };
        let nullable = match value.get("nullable") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(nullable)) => *nullable,
            Some(_) => return Err(EngineError::validation("Column nullable must be type bool")),
        };

        Ok(Column::new(name.as_str(), data_type.as_str())?.nullable(nullable))
    }
}

impl TryFrom<Value> for Column {
    type Error = EngineError;

    fn try_from(value: Value) -> Result<Self> {
        Column::try_from(&value)
    }
}

/// Double-quotes an identifier, escaping embedded quotes.
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}
