//! Prepared statements.
//!
//! A [`PreparedStatement`] is compiled once on a pooled connection and kept on
//! that connection until [`close`](PreparedStatement::close), so repeated
//! executions skip re-parsing on the server.

use crate::db::executor::{generated_id, settle};
use crate::db::mapper::{Record, map_row};
use crate::db::params::bind_params;
use crate::db::pool::PooledConnection;
use crate::db::sql::{Sql, SqlShape};
use crate::error::{DbError, DbResult};
use crate::models::{ExecResult, QueryParam};
use sqlx::any::AnyStatement;
use sqlx::{Connection, Executor, Statement};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

struct Compiled {
    conn: PooledConnection,
    statement: AnyStatement<'static>,
}

/// A compiled statement pinned to one pooled connection.
pub struct PreparedStatement {
    sql: Sql,
    shape: SqlShape,
    query_timeout: Duration,
    compiled: Option<Compiled>,
    executions: u64,
}

impl std::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("sql", &self.sql)
            .field("shape", &self.shape)
            .field("executions", &self.executions)
            .field("closed", &self.compiled.is_none())
            .finish()
    }
}

impl PreparedStatement {
    pub(crate) async fn prepare(
        mut conn: PooledConnection,
        sql: Sql,
        shape: SqlShape,
        query_timeout: Duration,
    ) -> DbResult<Self> {
        debug!(sql = %sql, connection_id = conn.id(), "Preparing statement");
        let prepared = match conn.raw() {
            Ok(raw) => match timeout(query_timeout, raw.prepare(sql.as_str())).await {
                Ok(result) => result.map_err(|e| DbError::from_sqlx(e, sql, 0)),
                Err(_) => Err(DbError::timeout(format!("prepare [{sql}]"), query_timeout)),
            },
            Err(e) => Err(e),
        };
        match prepared {
            Ok(statement) => Ok(Self {
                sql,
                shape,
                query_timeout,
                compiled: Some(Compiled { conn, statement }),
                executions: 0,
            }),
            Err(err) => {
                let failed: DbResult<Self> = Err(err);
                settle(conn, &failed).await;
                failed
            }
        }
    }

    pub fn sql(&self) -> Sql {
        self.sql
    }

    /// Number of successful executions so far.
    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn is_closed(&self) -> bool {
        self.compiled.is_none()
    }

    /// Execute the statement with one parameter set.
    ///
    /// A statement failure leaves the statement usable; a broken connection
    /// closes it.
    pub async fn execute(&mut self, params: &[QueryParam]) -> DbResult<ExecResult> {
        let sql = self.sql;
        let kind = self.shape.kind;
        let compiled = self
            .compiled
            .as_mut()
            .ok_or_else(|| DbError::statement_closed(sql))?;
        self.shape.check_params(sql, params.len())?;

        let Compiled { conn, statement } = compiled;
        let raw = conn.raw()?;
        let query = bind_params(statement.query(), params);
        let outcome = match timeout(self.query_timeout, query.execute(&mut *raw)).await {
            Ok(Ok(done)) => generated_id(conn, kind, &done, self.query_timeout)
                .await
                .map(|id| ExecResult::new(sql, kind, done.rows_affected(), id)),
            Ok(Err(e)) => Err(DbError::from_sqlx(e, sql, params.len())),
            Err(_) => Err(DbError::timeout(format!("statement [{sql}]"), self.query_timeout)),
        };
        self.after_execution(&outcome).await;
        outcome
    }

    /// Run the statement as a query and map its first row onto `R`.
    pub async fn query_one<R: Record>(&mut self, params: &[QueryParam]) -> DbResult<R> {
        let sql = self.sql;
        let compiled = self
            .compiled
            .as_mut()
            .ok_or_else(|| DbError::statement_closed(sql))?;
        self.shape.check_params(sql, params.len())?;

        let Compiled { conn, statement } = compiled;
        let raw = conn.raw()?;
        let query = bind_params(statement.query(), params);
        let outcome = match timeout(self.query_timeout, query.fetch_optional(&mut *raw)).await {
            Ok(result) => result.map_err(|e| DbError::from_sqlx(e, sql, params.len())),
            Err(_) => Err(DbError::timeout(format!("query [{sql}]"), self.query_timeout)),
        };
        self.after_execution(&outcome).await;

        let row = outcome?.ok_or_else(|| DbError::not_found(sql))?;
        map_row(&row, sql)
    }

    async fn after_execution<T>(&mut self, outcome: &DbResult<T>) {
        match outcome {
            Ok(_) => self.executions += 1,
            Err(err) if err.is_connection_broken() => {
                warn!(sql = %self.sql, error = %err, "Prepared statement lost its connection");
                if let Some(Compiled { conn, .. }) = self.compiled.take() {
                    conn.discard().await;
                }
            }
            Err(_) => {}
        }
    }

    /// Release the statement and return its connection to the pool.
    ///
    /// Closing twice is a no-op. Later executions fail with `StatementClosed`.
    pub async fn close(&mut self) -> DbResult<()> {
        let Some(Compiled {
            mut conn,
            statement,
        }) = self.compiled.take()
        else {
            return Ok(());
        };
        drop(statement);

        let cleared = match conn.raw() {
            Ok(raw) => raw
                .clear_cached_statements()
                .await
                .map_err(|e| DbError::from_sqlx(e, self.sql, 0)),
            Err(e) => Err(e),
        };
        debug!(
            sql = %self.sql,
            executions = self.executions,
            "Prepared statement closed"
        );
        settle(conn, &cleared).await;
        cleared
    }
}

impl Drop for PreparedStatement {
    fn drop(&mut self) {
        if self.compiled.is_some() {
            warn!(
                sql = %self.sql,
                executions = self.executions,
                "Prepared statement dropped without close; returning its connection"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EndpointConfig;
    use crate::db::{ConnectionPool, Sql, StatementExecutor};
    use crate::error::DbError;
    use crate::models::User;
    use tempfile::NamedTempFile;

    const CREATE: Sql = Sql::new("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)");
    const INSERT: Sql = Sql::new("INSERT INTO users (name, age) VALUES (?, ?)");
    const BY_ID: Sql = Sql::new("SELECT id, name, age FROM users WHERE id = ?");

    #[tokio::test]
    async fn test_prepared_query_reused_across_parameters() {
        let file = NamedTempFile::new().unwrap();
        let config = EndpointConfig::sqlite(file.path()).unwrap();
        let executor = StatementExecutor::new(ConnectionPool::open(&config).await.unwrap());
        executor.exec(CREATE, &[]).await.unwrap();
        let first = executor.exec(INSERT, &params!["a", 1]).await.unwrap().generated_id().unwrap();
        let second = executor.exec(INSERT, &params!["b", 2]).await.unwrap().generated_id().unwrap();

        let mut statement = executor.prepare(BY_ID).await.unwrap();
        let a: User = statement.query_one(&params![first]).await.unwrap();
        let b: User = statement.query_one(&params![second]).await.unwrap();
        assert_eq!((a.name.as_str(), b.name.as_str()), ("a", "b"));

        let missing = statement.query_one::<User>(&params![second + 1]).await;
        assert!(matches!(missing, Err(DbError::NotFound { .. })));
        let mismatch = statement.query_one::<User>(&params![1, 2]).await;
        assert!(matches!(mismatch, Err(DbError::ParameterCount { .. })));
        assert_eq!(statement.executions(), 3);

        assert_eq!(executor.pool().status().in_use, 1);
        statement.close().await.unwrap();
        assert_eq!(executor.pool().status().in_use, 0);
    }

    #[tokio::test]
    async fn test_closed_statement_reported_before_arity() {
        let file = NamedTempFile::new().unwrap();
        let config = EndpointConfig::sqlite(file.path()).unwrap();
        let executor = StatementExecutor::new(ConnectionPool::open(&config).await.unwrap());
        executor.exec(CREATE, &[]).await.unwrap();

        let mut statement = executor.prepare(INSERT).await.unwrap();
        let id = statement.execute(&params!["c", 3]).await.unwrap().generated_id().unwrap();
        assert_eq!(id, 1);
        statement.close().await.unwrap();
        statement.close().await.unwrap();
        assert!(statement.is_closed());

        let err = statement.execute(&params!["d"]).await.unwrap_err();
        assert!(matches!(err, DbError::StatementClosed { .. }), "got {err:?}");
        let err = statement.query_one::<User>(&[]).await.unwrap_err();
        assert!(matches!(err, DbError::StatementClosed { .. }), "got {err:?}");
        assert_eq!(statement.executions(), 1);
    }
}
