//! Database access layer.
//!
//! - Connection pool with bounded open and idle connections
//! - Statement execution with typed row mapping
//! - Lazy cursors, prepared statements and transactions
//! - Static SQL analysis for placeholder and statement checks

pub mod cursor;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod mapper;
pub mod params;
pub mod pool;
pub mod sql;
pub mod statement;
pub mod transaction;

pub use cursor::RowCursor;
pub use executor::StatementExecutor;
pub use mapper::{Columns, Record, ToParams, map_row};
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
pub use sql::{Sql, SqlShape, StatementKind};
pub use statement::PreparedStatement;
pub use transaction::Transaction;
