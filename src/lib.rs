//! dbkit library
//!
//! A pooled data-access layer over MySQL/MariaDB and SQLite: bounded
//! connection pooling, parameter-bound statements mapped onto typed records,
//! prepared statements and atomic transactions.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod users;

pub use config::Config;
pub use error::{DbError, DbResult};
pub use users::UserStore;
