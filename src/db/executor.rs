//! Statement execution.
//!
//! [`StatementExecutor`] is the entry point for running SQL against a pool:
//! - single-row queries mapped onto a [`Record`]
//! - multi-row queries returned as a lazy [`RowCursor`]
//! - data-modifying statements returning an [`ExecResult`]
//! - prepared statements and transactions
//!
//! Each call checks the placeholder count before touching the database,
//! runs under the query timeout, and returns its connection on every path.
//! A connection whose session broke (I/O failure, timeout) is discarded
//! instead of returned.

use crate::db::cursor::RowCursor;
use crate::db::mapper::{Record, map_row};
use crate::db::params::bind_params;
use crate::db::pool::{ConnectionPool, PooledConnection};
use crate::db::sql::{Sql, SqlShape, StatementKind};
use crate::db::statement::PreparedStatement;
use crate::db::transaction::Transaction;
use crate::error::{DbError, DbResult};
use crate::models::{Backend, DEFAULT_QUERY_TIMEOUT_SECS, ExecResult, QueryParam};
use futures_util::future::BoxFuture;
use sqlx::any::{AnyQueryResult, AnyRow};
use sqlx::{Executor, Row};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Runs statements on connections borrowed from a [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct StatementExecutor {
    pool: ConnectionPool,
    query_timeout: Duration,
}

impl StatementExecutor {
    /// Create an executor with the default query timeout.
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
        }
    }

    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    fn shape(&self, sql: Sql, params: &[QueryParam]) -> DbResult<SqlShape> {
        let shape = sql.analyze(self.pool.backend())?;
        shape.check_params(sql, params.len())?;
        Ok(shape)
    }

    /// Run a query and map its first row onto `R`.
    ///
    /// Fails with `NotFound` when the query returns no row. Rows after the
    /// first are ignored.
    pub async fn query_one<R: Record>(&self, sql: Sql, params: &[QueryParam]) -> DbResult<R> {
        self.shape(sql, params)?;
        let mut conn = self.pool.acquire().await?;
        let outcome = fetch_first(&mut conn, sql, params, self.query_timeout).await;
        settle(conn, &outcome).await;

        let row = outcome?.ok_or_else(|| DbError::not_found(sql))?;
        map_row(&row, sql)
    }

    /// Run a query and return a cursor over its rows.
    ///
    /// The cursor owns a pooled connection until it is drained, closed or
    /// dropped. Statement failures arrive as the cursor's first item.
    pub async fn query_many<R: Record>(
        &self,
        sql: Sql,
        params: &[QueryParam],
    ) -> DbResult<RowCursor<R>> {
        self.shape(sql, params)?;
        let conn = self.pool.acquire().await?;
        Ok(RowCursor::open(conn, sql, params.to_vec(), self.query_timeout))
    }

    /// Run a data-modifying statement.
    pub async fn exec(&self, sql: Sql, params: &[QueryParam]) -> DbResult<ExecResult> {
        let shape = self.shape(sql, params)?;
        let mut conn = self.pool.acquire().await?;
        let outcome = execute(&mut conn, sql, shape.kind, params, self.query_timeout).await;
        settle(conn, &outcome).await;
        outcome
    }

    /// Compile `sql` on a pooled connection for repeated execution.
    pub async fn prepare(&self, sql: Sql) -> DbResult<PreparedStatement> {
        let shape = sql.analyze(self.pool.backend())?;
        let conn = self.pool.acquire().await?;
        PreparedStatement::prepare(conn, sql, shape, self.query_timeout).await
    }

    /// Start a transaction on a dedicated connection.
    pub async fn begin(&self) -> DbResult<Transaction> {
        Transaction::begin(&self.pool, self.query_timeout).await
    }

    /// Run `callback` inside a transaction.
    ///
    /// Commits when the callback returns `Ok`, rolls back when it returns
    /// `Err`, and returns the callback's error unchanged in that case.
    ///
    /// ```no_run
    /// # use dbkit::db::{Sql, StatementExecutor};
    /// # async fn demo(executor: StatementExecutor) -> dbkit::error::DbResult<()> {
    /// const DEBIT: Sql = Sql::new("UPDATE users SET age = age - ? WHERE id = ?");
    /// executor
    ///     .transaction(|tx| {
    ///         Box::pin(async move {
    ///             tx.exec(DEBIT, &dbkit::params![2, 4]).await?;
    ///             Ok(())
    ///         })
    ///     })
    ///     .await
    /// # }
    /// ```
    pub async fn transaction<T, F>(&self, callback: F) -> DbResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, DbResult<T>> + Send,
    {
        let mut tx = self.begin().await?;
        match callback(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if tx.state().is_active() {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(
                            transaction_id = %tx.id(),
                            error = %rollback_err,
                            "Rollback after failed transaction body also failed"
                        );
                    }
                }
                Err(err)
            }
        }
    }
}

/// Return `conn` to the pool, or discard it when `outcome` shows the session broke.
pub(crate) async fn settle<T>(conn: PooledConnection, outcome: &DbResult<T>) {
    match outcome {
        Err(err) if err.is_connection_broken() => {
            warn!(connection_id = conn.id(), error = %err, "Discarding connection");
            conn.discard().await;
        }
        _ => conn.release().await,
    }
}

/// Fetch the first row of `sql`, if any.
pub(crate) async fn fetch_first(
    conn: &mut PooledConnection,
    sql: Sql,
    params: &[QueryParam],
    limit: Duration,
) -> DbResult<Option<AnyRow>> {
    debug!(sql = %sql, params = params.len(), connection_id = conn.id(), "Executing query");
    let raw = conn.raw()?;
    // Parameterless statements use the text protocol
    let result = if params.is_empty() {
        timeout(limit, raw.fetch_optional(sql.as_str())).await
    } else {
        timeout(
            limit,
            bind_params(sqlx::query(sql.as_str()), params).fetch_optional(&mut *raw),
        )
        .await
    };
    match result {
        Ok(rows) => rows.map_err(|e| DbError::from_sqlx(e, sql, params.len())),
        Err(_) => Err(DbError::timeout(format!("query [{sql}]"), limit)),
    }
}

/// Execute a data-modifying statement.
pub(crate) async fn execute(
    conn: &mut PooledConnection,
    sql: Sql,
    kind: StatementKind,
    params: &[QueryParam],
    limit: Duration,
) -> DbResult<ExecResult> {
    debug!(sql = %sql, params = params.len(), connection_id = conn.id(), "Executing statement");
    let raw = conn.raw()?;
    let result = if params.is_empty() {
        timeout(limit, raw.execute(sql.as_str())).await
    } else {
        timeout(
            limit,
            bind_params(sqlx::query(sql.as_str()), params).execute(&mut *raw),
        )
        .await
    };
    let done = match result {
        Ok(Ok(done)) => done,
        Ok(Err(e)) => return Err(DbError::from_sqlx(e, sql, params.len())),
        Err(_) => return Err(DbError::timeout(format!("statement [{sql}]"), limit)),
    };
    let id = generated_id(conn, kind, &done, limit).await?;
    Ok(ExecResult::new(sql, kind, done.rows_affected(), id))
}

const LAST_INSERT_ROWID: Sql = Sql::new("SELECT last_insert_rowid()");

/// Identifier generated by a completed statement.
///
/// SQLite's `Any` result carries no insert id, so it is read back with
/// `last_insert_rowid()` on the connection that ran the insert.
pub(crate) async fn generated_id(
    conn: &mut PooledConnection,
    kind: StatementKind,
    done: &AnyQueryResult,
    limit: Duration,
) -> DbResult<Option<i64>> {
    let reported = done.last_insert_id();
    if kind != StatementKind::Insert
        || done.rows_affected() == 0
        || reported.is_some()
        || conn.backend() != Backend::Sqlite
    {
        return Ok(reported);
    }
    match fetch_first(conn, LAST_INSERT_ROWID, &[], limit).await? {
        Some(row) => row
            .try_get::<i64, usize>(0)
            .map(Some)
            .map_err(|e| DbError::from_sqlx(e, LAST_INSERT_ROWID, 0)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use tempfile::NamedTempFile;

    const CREATE: Sql =
        Sql::new("CREATE TABLE notes (id INTEGER PRIMARY KEY AUTOINCREMENT, body TEXT NOT NULL)");
    const INSERT: Sql = Sql::new("INSERT INTO notes (body) VALUES (?)");
    const UPDATE: Sql = Sql::new("UPDATE notes SET body = ? WHERE id = ?");

    async fn executor(file: &NamedTempFile) -> StatementExecutor {
        let config = EndpointConfig::sqlite(file.path()).unwrap();
        let executor = StatementExecutor::new(ConnectionPool::open(&config).await.unwrap());
        executor.exec(CREATE, &[]).await.unwrap();
        executor
    }

    #[tokio::test]
    async fn test_sqlite_insert_reports_generated_id() {
        let file = NamedTempFile::new().unwrap();
        let executor = executor(&file).await;

        let first = executor.exec(INSERT, &crate::params!["a"]).await.unwrap();
        let second = executor.exec(INSERT, &crate::params!["b"]).await.unwrap();
        assert_eq!(first.generated_id().unwrap(), 1);
        assert_eq!(second.generated_id().unwrap(), 2);

        let updated = executor
            .exec(UPDATE, &crate::params!["c", 2])
            .await
            .unwrap();
        assert_eq!(updated.rows_affected(), 1);
        assert!(matches!(
            updated.generated_id(),
            Err(DbError::NotApplicable { .. })
        ));
        assert_eq!(executor.pool().status().in_use, 0);
    }

    #[tokio::test]
    async fn test_generated_id_inside_transaction() {
        let file = NamedTempFile::new().unwrap();
        let executor = executor(&file).await;
        executor.exec(INSERT, &crate::params!["outside"]).await.unwrap();

        let mut tx = executor.begin().await.unwrap();
        let inserted = tx.exec(INSERT, &crate::params!["inside"]).await.unwrap();
        assert_eq!(inserted.generated_id().unwrap(), 2);
        tx.commit().await.unwrap();
    }
}
