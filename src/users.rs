//! Typed operations on the `users` table.
//!
//! Every value reaches the database as a bound parameter; the SQL text of
//! each operation is a compile-time constant.

use crate::db::{RowCursor, Sql, StatementExecutor, ToParams};
use crate::error::{DbError, DbResult};
use crate::models::user::MAX_AGE;
use crate::models::{Backend, NewUser, User};
use crate::params;
use tracing::{debug, info};

const CREATE_USERS_MYSQL: Sql = Sql::new(
    "CREATE TABLE IF NOT EXISTS users (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        age BIGINT NOT NULL,
        CONSTRAINT users_age_range CHECK (age BETWEEN 0 AND 150)
    )",
);
const CREATE_USERS_SQLITE: Sql = Sql::new(
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        age INTEGER NOT NULL CHECK (age BETWEEN 0 AND 150)
    )",
);

const SELECT_USER: Sql = Sql::new("SELECT id, name, age FROM users WHERE id = ?");
const SELECT_USERS_AFTER: Sql =
    Sql::new("SELECT id, name, age FROM users WHERE id > ? ORDER BY id");
const SELECT_USERS_BY_NAME: Sql =
    Sql::new("SELECT id, name, age FROM users WHERE name = ? ORDER BY id");
const INSERT_USER: Sql = Sql::new("INSERT INTO users (name, age) VALUES (?, ?)");
const UPDATE_AGE: Sql = Sql::new("UPDATE users SET age = ? WHERE id = ?");
const DELETE_USER: Sql = Sql::new("DELETE FROM users WHERE id = ?");
const DEBIT_AGE: Sql = Sql::new("UPDATE users SET age = age - ? WHERE id = ?");
const CREDIT_AGE: Sql = Sql::new("UPDATE users SET age = age + ? WHERE id = ?");

/// Data access for [`User`] records.
#[derive(Debug, Clone)]
pub struct UserStore {
    executor: StatementExecutor,
}

impl UserStore {
    pub fn new(executor: StatementExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &StatementExecutor {
        &self.executor
    }

    /// Create the `users` table when it does not exist yet.
    pub async fn ensure_schema(&self) -> DbResult<()> {
        let ddl = match self.executor.pool().backend() {
            Backend::MySql => CREATE_USERS_MYSQL,
            Backend::Sqlite => CREATE_USERS_SQLITE,
        };
        self.executor.exec(ddl, &[]).await?;
        info!("users table ready");
        Ok(())
    }

    pub async fn get(&self, id: i64) -> DbResult<User> {
        self.executor.query_one(SELECT_USER, &params![id]).await
    }

    /// Cursor over users with an id greater than `after`, in id order.
    pub async fn list_after(&self, after: i64) -> DbResult<RowCursor<User>> {
        self.executor
            .query_many(SELECT_USERS_AFTER, &params![after])
            .await
    }

    /// All users whose name equals `name` exactly.
    pub async fn find_by_name(&self, name: &str) -> DbResult<Vec<User>> {
        self.executor
            .query_many::<User>(SELECT_USERS_BY_NAME, &params![name])
            .await?
            .try_collect()
            .await
    }

    /// Insert a user and return its generated id.
    pub async fn insert(&self, user: &NewUser) -> DbResult<i64> {
        validate_age(user.age)?;
        let id = self
            .executor
            .exec(INSERT_USER, &user.to_params())
            .await?
            .generated_id()?;
        debug!(id = id, "Inserted user");
        Ok(id)
    }

    /// Set a user's age. Returns the number of rows changed.
    pub async fn update_age(&self, id: i64, age: i64) -> DbResult<u64> {
        validate_age(age)?;
        let result = self.executor.exec(UPDATE_AGE, &params![age, id]).await?;
        Ok(result.rows_affected())
    }

    pub async fn delete(&self, id: i64) -> DbResult<u64> {
        let result = self.executor.exec(DELETE_USER, &params![id]).await?;
        Ok(result.rows_affected())
    }

    /// Insert several users through one prepared statement.
    ///
    /// Stops at the first failure; users inserted before it stay inserted.
    pub async fn insert_batch(&self, users: &[NewUser]) -> DbResult<Vec<i64>> {
        for user in users {
            validate_age(user.age)?;
        }

        let mut statement = self.executor.prepare(INSERT_USER).await?;
        let mut ids = Vec::with_capacity(users.len());
        let mut outcome = Ok(());
        for user in users {
            match statement
                .execute(&user.to_params())
                .await
                .and_then(|result| result.generated_id())
            {
                Ok(id) => ids.push(id),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        let closed = statement.close().await;
        outcome?;
        closed?;

        info!(count = ids.len(), "Inserted user batch");
        Ok(ids)
    }

    /// Move `amount` years of age from user `from` to user `to` in one
    /// transaction.
    ///
    /// Either both updates commit or neither does: a missing user, or an age
    /// leaving the allowed range, rolls the transfer back.
    pub async fn transfer_age(&self, from: i64, to: i64, amount: i64) -> DbResult<()> {
        if amount <= 0 {
            return Err(DbError::invalid_input(format!(
                "transfer amount must be positive, got {amount}"
            )));
        }
        if from == to {
            return Err(DbError::invalid_input(
                "transfer source and target must differ",
            ));
        }

        self.executor
            .transaction(move |tx| {
                Box::pin(async move {
                    let debited = tx.exec(DEBIT_AGE, &params![amount, from]).await?;
                    if debited.rows_affected() == 0 {
                        return Err(DbError::not_found(DEBIT_AGE));
                    }
                    let credited = tx.exec(CREDIT_AGE, &params![amount, to]).await?;
                    if credited.rows_affected() == 0 {
                        return Err(DbError::not_found(CREDIT_AGE));
                    }
                    Ok(())
                })
            })
            .await?;

        info!(from = from, to = to, amount = amount, "Age transferred");
        Ok(())
    }
}

fn validate_age(age: i64) -> DbResult<()> {
    if (0..=MAX_AGE).contains(&age) {
        Ok(())
    } else {
        Err(DbError::invalid_input(format!(
            "age must be between 0 and {MAX_AGE}, got {age}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_age_bounds() {
        assert!(validate_age(0).is_ok());
        assert!(validate_age(MAX_AGE).is_ok());
        assert!(matches!(validate_age(-1), Err(DbError::InvalidInput { .. })));
        assert!(matches!(
            validate_age(MAX_AGE + 1),
            Err(DbError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_user_statements_are_well_formed() {
        for backend in [Backend::MySql, Backend::Sqlite] {
            assert_eq!(SELECT_USER.analyze(backend).unwrap().placeholders, 1);
            assert_eq!(INSERT_USER.analyze(backend).unwrap().placeholders, 2);
            assert_eq!(DEBIT_AGE.analyze(backend).unwrap().placeholders, 2);
            assert_eq!(CREDIT_AGE.analyze(backend).unwrap().placeholders, 2);
        }
        assert_eq!(
            CREATE_USERS_MYSQL.analyze(Backend::MySql).unwrap().placeholders,
            0
        );
        assert_eq!(
            CREATE_USERS_SQLITE
                .analyze(Backend::Sqlite)
                .unwrap()
                .placeholders,
            0
        );
    }
}
