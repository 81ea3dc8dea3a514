//! The `users` record and its insert payload.

use crate::db::mapper::{Columns, Record, ToParams};
use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Upper bound enforced by the table's CHECK constraint.
pub const MAX_AGE: i64 = 150;

/// A stored user row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub age: i64,
}

impl Record for User {
    const COLUMNS: &'static [&'static str] = &["id", "name", "age"];

    fn from_columns(columns: &mut Columns<'_>) -> DbResult<Self> {
        Ok(Self {
            id: columns.read()?,
            name: columns.read()?,
            age: columns.read()?,
        })
    }
}

/// Insert payload; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub age: i64,
}

impl NewUser {
    pub fn new(name: impl Into<String>, age: i64) -> Self {
        Self {
            name: name.into(),
            age,
        }
    }
}

impl ToParams for NewUser {
    fn to_params(&self) -> Vec<QueryParam> {
        crate::params![self.name.as_str(), self.age]
    }
}

/// Parses `name:age`, as accepted by the `batch` command.
impl FromStr for NewUser {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, age) = s
            .rsplit_once(':')
            .ok_or_else(|| DbError::invalid_input(format!("expected name:age, got '{s}'")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(DbError::invalid_input("user name cannot be empty"));
        }
        let age = age
            .trim()
            .parse::<i64>()
            .map_err(|e| DbError::invalid_input(format!("invalid age '{age}': {e}")))?;
        Ok(Self::new(name, age))
    }
}
