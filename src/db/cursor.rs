//! Lazy result cursor.
//!
//! A [`RowCursor`] streams the rows of one query. A background task owns the
//! pooled connection, pulls rows from the driver and hands them over a
//! single-slot channel, so at most one row is buffered ahead of the caller.
//! The task returns the connection when the rows run out, when the cursor is
//! closed or dropped, or when the statement fails.

use crate::db::executor::settle;
use crate::db::mapper::{Record, map_row};
use crate::db::params::bind_params;
use crate::db::pool::PooledConnection;
use crate::db::sql::Sql;
use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use futures_util::{Stream, StreamExt, stream};
use sqlx::Executor;
use sqlx::any::AnyRow;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Rows buffered ahead of the consumer.
const PREFETCH_ROWS: usize = 1;

/// A finite, non-restartable sequence of records from one query.
pub struct RowCursor<R> {
    sql: Sql,
    rows: Option<mpsc::Receiver<DbResult<AnyRow>>>,
    worker: Option<JoinHandle<()>>,
    yielded: u64,
    _record: PhantomData<fn() -> R>,
}

impl<R> std::fmt::Debug for RowCursor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCursor")
            .field("sql", &self.sql)
            .field("yielded", &self.yielded)
            .field("open", &self.rows.is_some())
            .finish()
    }
}

impl<R: Record> RowCursor<R> {
    pub(crate) fn open(
        conn: PooledConnection,
        sql: Sql,
        params: Vec<QueryParam>,
        row_timeout: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(PREFETCH_ROWS);
        let worker = tokio::spawn(stream_rows(conn, sql, params, row_timeout, sender));
        Self {
            sql,
            rows: Some(receiver),
            worker: Some(worker),
            yielded: 0,
            _record: PhantomData,
        }
    }

    /// Advance to the next record.
    ///
    /// Returns `None` once the rows are exhausted. A failure is yielded once
    /// and ends the sequence; records already yielded stay valid.
    pub async fn next(&mut self) -> Option<DbResult<R>> {
        let received = self.rows.as_mut()?.recv().await;
        match received {
            Some(Ok(row)) => match map_row::<R>(&row, self.sql) {
                Ok(record) => {
                    self.yielded += 1;
                    Some(Ok(record))
                }
                Err(err) => {
                    self.shutdown().await;
                    Some(Err(err))
                }
            },
            Some(Err(err)) => {
                self.shutdown().await;
                Some(Err(err))
            }
            None => {
                self.shutdown().await;
                None
            }
        }
    }

    /// Records yielded so far.
    pub fn yielded(&self) -> u64 {
        self.yielded
    }

    /// True once the sequence ended or the cursor was closed.
    pub fn is_closed(&self) -> bool {
        self.rows.is_none()
    }

    /// Stop reading and return the connection to the pool.
    pub async fn close(mut self) {
        self.shutdown().await;
    }

    /// Drain the remaining records into a vector, stopping at the first failure.
    pub async fn try_collect(mut self) -> DbResult<Vec<R>> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record?);
        }
        Ok(records)
    }

    /// Adapt the cursor into a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = DbResult<R>> + Send {
        stream::unfold(self, |mut cursor| async move {
            cursor.next().await.map(|item| (item, cursor))
        })
    }

    async fn shutdown(&mut self) {
        if let Some(mut rows) = self.rows.take() {
            rows.close();
        }
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(sql = %self.sql, error = %e, "Cursor worker failed");
            }
        }
    }
}

impl<R> Drop for RowCursor<R> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            debug!(
                sql = %self.sql,
                yielded = self.yielded,
                "Cursor dropped before exhaustion; worker will return its connection"
            );
        }
    }
}

/// Worker body: feed rows into `sink` until done, then settle the connection.
async fn stream_rows(
    mut conn: PooledConnection,
    sql: Sql,
    params: Vec<QueryParam>,
    row_timeout: Duration,
    sink: mpsc::Sender<DbResult<AnyRow>>,
) {
    debug!(sql = %sql, params = params.len(), connection_id = conn.id(), "Executing query");

    let outcome: DbResult<()> = async {
        let raw = conn.raw()?;
        let mut rows = if params.is_empty() {
            raw.fetch(sql.as_str())
        } else {
            bind_params(sqlx::query(sql.as_str()), &params).fetch(&mut *raw)
        };
        loop {
            let next = match timeout(row_timeout, rows.next()).await {
                Ok(next) => next,
                Err(_) => return Err(DbError::timeout(format!("query [{sql}]"), row_timeout)),
            };
            match next {
                Some(Ok(row)) => {
                    if sink.send(Ok(row)).await.is_err() {
                        debug!(sql = %sql, "Cursor closed before the last row");
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(DbError::from_sqlx(e, sql, params.len())),
                None => return Ok(()),
            }
        }
    }
    .await;

    settle(conn, &outcome).await;
    if let Err(err) = outcome {
        // The consumer may already be gone; nothing else to report to.
        let _ = sink.send(Err(err)).await;
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EndpointConfig;
    use crate::db::{ConnectionPool, Sql, StatementExecutor};
    use crate::error::DbError;
    use crate::models::User;
    use futures_util::StreamExt;
    use tempfile::NamedTempFile;

    const CREATE: Sql = Sql::new("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)");
    const SEED: Sql = Sql::new("INSERT INTO users (name, age) VALUES ('a', 1), ('b', 2), ('c', 3)");
    const ALL: Sql = Sql::new("SELECT id, name, age FROM users ORDER BY id");
    const MISSING_TABLE: Sql = Sql::new("SELECT id, name, age FROM nowhere");

    async fn executor(file: &NamedTempFile) -> StatementExecutor {
        let config = EndpointConfig::sqlite(file.path()).unwrap();
        let executor = StatementExecutor::new(ConnectionPool::open(&config).await.unwrap());
        executor.exec(CREATE, &[]).await.unwrap();
        executor.exec(SEED, &[]).await.unwrap();
        executor
    }

    #[tokio::test]
    async fn test_cursor_as_stream() {
        let file = NamedTempFile::new().unwrap();
        let executor = executor(&file).await;

        let cursor = executor.query_many::<User>(ALL, &[]).await.unwrap();
        let names: Vec<String> = cursor
            .into_stream()
            .map(|user| user.unwrap().name)
            .collect()
            .await;
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(executor.pool().status().in_use, 0);
    }

    #[tokio::test]
    async fn test_statement_failure_is_first_item() {
        let file = NamedTempFile::new().unwrap();
        let executor = executor(&file).await;

        let mut cursor = executor.query_many::<User>(MISSING_TABLE, &[]).await.unwrap();
        let first = cursor.next().await.unwrap();
        assert!(matches!(first, Err(DbError::Statement { .. })), "got {first:?}");
        assert!(cursor.next().await.is_none());
        assert!(cursor.is_closed());
        assert_eq!(executor.pool().status().in_use, 0);
    }

    #[tokio::test]
    async fn test_try_collect() {
        let file = NamedTempFile::new().unwrap();
        let executor = executor(&file).await;

        let users = executor
            .query_many::<User>(ALL, &[])
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(users.len(), 3);
        assert_eq!(users[2].age, 3);
    }
}
