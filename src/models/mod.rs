//! Data models for dbkit.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod user;

// Re-export commonly used types
pub use connection::{Backend, TransactionInfo, TransactionState};
pub use query::{DEFAULT_QUERY_TIMEOUT_SECS, ExecResult, QueryParam};
pub use user::{NewUser, User};
