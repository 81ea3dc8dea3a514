//! Transactions on a dedicated pooled connection.
//!
//! A [`Transaction`] holds one connection from `BEGIN` until exactly one
//! terminal outcome, `Committed` or `RolledBack`. A failed statement rolls the
//! whole transaction back before its error is returned, so no partial work is
//! ever committed.

use crate::db::executor::{execute, fetch_first};
use crate::db::mapper::{Record, map_row};
use crate::db::pool::{ConnectionPool, PooledConnection};
use crate::db::sql::{Sql, StatementKind};
use crate::error::{DbError, DbResult};
use crate::models::{Backend, ExecResult, QueryParam, TransactionInfo, TransactionState};
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BEGIN: Sql = Sql::new("BEGIN");
const COMMIT: Sql = Sql::new("COMMIT");
const ROLLBACK: Sql = Sql::new("ROLLBACK");

/// An open transaction. Obtain one from
/// [`StatementExecutor::begin`](crate::db::StatementExecutor::begin).
pub struct Transaction {
    id: String,
    backend: Backend,
    conn: Option<PooledConnection>,
    state: TransactionState,
    query_timeout: Duration,
    started_at: DateTime<Utc>,
    started: Instant,
    statements: u64,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("state", &self.state)
            .field("statements", &self.statements)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) async fn begin(pool: &ConnectionPool, query_timeout: Duration) -> DbResult<Self> {
        let mut conn = pool.acquire().await?;
        let id = generate_transaction_id();

        if let Err(err) = execute(&mut conn, BEGIN, StatementKind::Other, &[], query_timeout).await
        {
            warn!(transaction_id = %id, error = %err, "BEGIN failed");
            if !err.is_connection_broken() {
                if let Err(e) =
                    execute(&mut conn, ROLLBACK, StatementKind::Other, &[], query_timeout).await
                {
                    debug!(transaction_id = %id, error = %e, "Rollback after failed BEGIN failed");
                }
            }
            conn.discard().await;
            return Err(DbError::begin_failed(err));
        }

        info!(
            transaction_id = %id,
            connection_id = conn.id(),
            backend = %pool.backend(),
            "Transaction started"
        );

        Ok(Self {
            id,
            backend: pool.backend(),
            conn: Some(conn),
            state: TransactionState::Begun,
            query_timeout,
            started_at: Utc::now(),
            started: Instant::now(),
            statements: 0,
        })
    }

    /// Transaction id, `tx_` followed by a UUID.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id.clone(),
            backend: self.backend,
            state: self.state,
            started_at: self.started_at,
            duration_ms: self.started.elapsed().as_millis() as u64,
            statements: self.statements,
        }
    }

    fn ensure_active(&self) -> DbResult<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(DbError::transaction_closed(&self.id, self.state))
        }
    }

    /// Run a data-modifying statement inside the transaction.
    ///
    /// On any failure the transaction is rolled back and the original error
    /// returned; the transaction is then closed.
    pub async fn exec(&mut self, sql: Sql, params: &[QueryParam]) -> DbResult<ExecResult> {
        self.ensure_active()?;
        self.statements += 1;

        let outcome = self.run_exec(sql, params).await;
        match &outcome {
            Ok(result) => debug!(
                transaction_id = %self.id,
                sql = %sql,
                rows_affected = result.rows_affected(),
                "Executed in transaction"
            ),
            Err(err) => self.abort(err).await,
        }
        outcome
    }

    async fn run_exec(&mut self, sql: Sql, params: &[QueryParam]) -> DbResult<ExecResult> {
        let shape = sql.analyze(self.backend)?;
        shape.check_params(sql, params.len())?;
        let Some(conn) = self.conn.as_mut() else {
            return Err(DbError::transaction_closed(&self.id, self.state));
        };
        execute(conn, sql, shape.kind, params, self.query_timeout).await
    }

    /// Run a query inside the transaction and map its first row onto `R`.
    ///
    /// A failed statement rolls the transaction back. `NotFound` and `Scan`
    /// leave it open.
    pub async fn query_one<R: Record>(&mut self, sql: Sql, params: &[QueryParam]) -> DbResult<R> {
        self.ensure_active()?;
        self.statements += 1;

        let row = match self.run_fetch(sql, params).await {
            Ok(row) => row,
            Err(err) => {
                self.abort(&err).await;
                return Err(err);
            }
        };
        let row = row.ok_or_else(|| DbError::not_found(sql))?;
        map_row(&row, sql)
    }

    async fn run_fetch(
        &mut self,
        sql: Sql,
        params: &[QueryParam],
    ) -> DbResult<Option<sqlx::any::AnyRow>> {
        sql.analyze(self.backend)?.check_params(sql, params.len())?;
        let Some(conn) = self.conn.as_mut() else {
            return Err(DbError::transaction_closed(&self.id, self.state));
        };
        fetch_first(conn, sql, params, self.query_timeout).await
    }

    /// Commit and return the connection to the pool.
    ///
    /// When `COMMIT` itself fails the transaction is rolled back and
    /// `DbError::Commit` wraps the cause. The connection stays with the
    /// transaction until `COMMIT` completes, so a cancelled commit leaves it
    /// `Begun` and still owning its session.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.ensure_active()?;
        let Some(conn) = self.conn.as_mut() else {
            return Err(DbError::transaction_closed(&self.id, self.state));
        };

        match execute(conn, COMMIT, StatementKind::Other, &[], self.query_timeout).await {
            Ok(_) => {
                self.state = TransactionState::Committed;
                if let Some(conn) = self.conn.take() {
                    conn.release().await;
                }
                info!(
                    transaction_id = %self.id,
                    statements = self.statements,
                    duration_ms = self.started.elapsed().as_millis() as u64,
                    "Transaction committed"
                );
                Ok(())
            }
            Err(err) => {
                warn!(transaction_id = %self.id, error = %err, "COMMIT failed; rolling back");
                if let Err(e) = self.finish_rollback(err.is_connection_broken()).await {
                    debug!(transaction_id = %self.id, error = %e, "Rollback after failed COMMIT failed");
                }
                Err(DbError::commit_failed(&self.id, err))
            }
        }
    }

    /// Roll back and return the connection to the pool.
    ///
    /// Rolling back twice is a no-op. A committed transaction cannot be
    /// rolled back.
    pub async fn rollback(&mut self) -> DbResult<()> {
        match self.state {
            TransactionState::RolledBack => return Ok(()),
            TransactionState::Committed => {
                return Err(DbError::transaction_closed(&self.id, self.state));
            }
            TransactionState::Begun => {}
        }

        let result = self.finish_rollback(false).await;
        info!(
            transaction_id = %self.id,
            statements = self.statements,
            "Transaction rolled back"
        );
        result
    }

    async fn abort(&mut self, cause: &DbError) {
        if self.conn.is_none() {
            return;
        }
        warn!(
            transaction_id = %self.id,
            error = %cause,
            "Statement failed; rolling back transaction"
        );
        if let Err(e) = self.finish_rollback(cause.is_connection_broken()).await {
            debug!(transaction_id = %self.id, error = %e, "Rollback after failed statement failed");
        }
    }

    /// Issue `ROLLBACK` on the held connection, then mark the transaction
    /// `RolledBack` and settle the connection.
    ///
    /// The connection is only given up after the statement completes. A
    /// broken session is closed without a rollback; a failed rollback closes
    /// it too.
    async fn finish_rollback(&mut self, session_broken: bool) -> DbResult<()> {
        let result = match self.conn.as_mut() {
            None => Ok(()),
            Some(_) if session_broken => {
                debug!(transaction_id = %self.id, "Closing broken transaction session");
                Ok(())
            }
            Some(conn) => execute(conn, ROLLBACK, StatementKind::Other, &[], self.query_timeout)
                .await
                .map(|_| ()),
        };

        self.state = TransactionState::RolledBack;
        if let Some(conn) = self.conn.take() {
            if session_broken || result.is_err() {
                conn.discard().await;
            } else {
                conn.release().await;
            }
        }
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        self.state = TransactionState::RolledBack;
        warn!(
            transaction_id = %self.id,
            "Transaction dropped while active; rolling back"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let id = std::mem::take(&mut self.id);
                let limit = self.query_timeout;
                handle.spawn(async move {
                    if let Err(e) = roll_back(&id, conn, limit).await {
                        warn!(transaction_id = %id, error = %e, "Rollback of dropped transaction failed");
                    }
                });
            }
            // Without a runtime the session is closed unfinished; the server
            // discards the open transaction.
            Err(_) => conn.detach(),
        }
    }
}

/// Issue `ROLLBACK` on a connection taken from a dropped transaction and
/// settle it. A failed rollback closes the session.
async fn roll_back(transaction_id: &str, mut conn: PooledConnection, limit: Duration) -> DbResult<()> {
    debug!(transaction_id = %transaction_id, "Rolling back dropped transaction");
    match execute(&mut conn, ROLLBACK, StatementKind::Other, &[], limit).await {
        Ok(_) => {
            conn.release().await;
            Ok(())
        }
        Err(err) => {
            conn.discard().await;
            Err(err)
        }
    }
}

fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
