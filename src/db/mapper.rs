//! Row-to-record mapping.
//!
//! A [`Record`] declares its columns in select order and reads them one by
//! one from a [`Columns`] cursor. The mapper checks the column count first,
//! then every typed read, so a shape or type mismatch surfaces as
//! `DbError::Scan` naming the offending column.

use crate::db::sql::Sql;
use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use sqlx::any::AnyRow;
use sqlx::{Any, Column, Decode, Row, Type};

/// A typed value built from one result row.
pub trait Record: Sized + Send + Unpin + 'static {
    /// Column names, in the order the statement selects them.
    const COLUMNS: &'static [&'static str];

    fn from_columns(columns: &mut Columns<'_>) -> DbResult<Self>;
}

/// A value that supplies an ordered parameter list, e.g. an insert payload.
pub trait ToParams {
    fn to_params(&self) -> Vec<QueryParam>;
}

/// Sequential reader over the columns of a row.
pub struct Columns<'r> {
    row: &'r AnyRow,
    sql: Sql,
    names: &'static [&'static str],
    position: usize,
}

impl<'r> Columns<'r> {
    fn new(row: &'r AnyRow, sql: Sql, names: &'static [&'static str]) -> Self {
        Self {
            row,
            sql,
            names,
            position: 0,
        }
    }

    /// Decode the next column as `T`.
    pub fn read<T>(&mut self) -> DbResult<T>
    where
        T: Decode<'r, Any> + Type<Any>,
    {
        let index = self.position;
        let name = self.column_name(index);
        if index >= self.row.len() {
            return Err(DbError::scan(
                self.sql,
                name,
                format!("row has only {} column(s)", self.row.len()),
            ));
        }
        self.position += 1;
        self.row
            .try_get::<T, usize>(index)
            .map_err(|e| DbError::scan(self.sql, name, e.to_string()))
    }

    fn column_name(&self, index: usize) -> String {
        match self.names.get(index) {
            Some(name) => (*name).to_string(),
            None => self
                .row
                .columns()
                .get(index)
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| format!("#{index}")),
        }
    }

    fn finish(&self) -> DbResult<()> {
        if self.position == self.row.len() {
            return Ok(());
        }
        Err(DbError::scan(
            self.sql,
            self.column_name(self.position),
            format!(
                "record consumed {} of {} column(s)",
                self.position,
                self.row.len()
            ),
        ))
    }
}

/// Map one row onto `R`.
pub fn map_row<R: Record>(row: &AnyRow, sql: Sql) -> DbResult<R> {
    if row.len() != R::COLUMNS.len() {
        return Err(DbError::scan(
            sql,
            R::COLUMNS.join(", "),
            format!(
                "expected {} column(s), row has {}",
                R::COLUMNS.len(),
                row.len()
            ),
        ));
    }
    let mut columns = Columns::new(row, sql, R::COLUMNS);
    let record = R::from_columns(&mut columns)?;
    columns.finish()?;
    Ok(record)
}
