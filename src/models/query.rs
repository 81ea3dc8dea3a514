//! Query-related data models.
//!
//! This module defines bound parameter values and statement results.

use crate::db::sql::{Sql, StatementKind};
use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};

/// Default statement timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// A parameter value for parameterized statements.
///
/// Values always travel to the server as bound parameters, never as SQL text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<u32> for QueryParam {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&String> for QueryParam {
    fn from(v: &String) -> Self {
        Self::String(v.clone())
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Outcome of a data-modifying statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    sql: Sql,
    kind: StatementKind,
    rows_affected: u64,
    last_insert_id: Option<i64>,
}

impl ExecResult {
    pub(crate) fn new(
        sql: Sql,
        kind: StatementKind,
        rows_affected: u64,
        last_insert_id: Option<i64>,
    ) -> Self {
        Self {
            sql,
            kind,
            rows_affected,
            last_insert_id,
        }
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    /// Identifier generated by an insert.
    ///
    /// Fails with `NotApplicable` for any other statement kind, for an insert
    /// that stored no row, or when the driver reported no identifier.
    pub fn generated_id(&self) -> DbResult<i64> {
        if self.kind != StatementKind::Insert {
            return Err(DbError::not_applicable(
                self.sql,
                format!("{} statements do not generate identifiers", self.kind),
            ));
        }
        if self.rows_affected == 0 {
            return Err(DbError::not_applicable(self.sql, "no row was inserted"));
        }
        self.last_insert_id
            .ok_or_else(|| DbError::not_applicable(self.sql, "driver reported no identifier"))
    }
}
