//! dbkit - Main entry point.
//!
//! Drives the `users` table through the pooled data-access layer. Results are
//! written to stdout as JSON lines; logs go to stderr.

use dbkit::config::{Command, Config};
use dbkit::db::{ConnectionPool, StatementExecutor};
use dbkit::error::{DbError, DbResult};
use dbkit::users::UserStore;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn emit<T: Serialize>(value: &T) -> DbResult<()> {
    let line = serde_json::to_string(value)
        .map_err(|e| DbError::internal(format!("Failed to serialize output: {e}")))?;
    println!("{line}");
    Ok(())
}

async fn dispatch(store: &UserStore, command: &Command) -> DbResult<()> {
    match command {
        Command::Init => {
            store.ensure_schema().await?;
            emit(&json!({ "initialized": true }))
        }
        Command::Get { id } => emit(&store.get(*id).await?),
        Command::List { after } => {
            let mut cursor = store.list_after(*after).await?;
            while let Some(user) = cursor.next().await {
                emit(&user?)?;
            }
            Ok(())
        }
        Command::Find { name } => {
            for user in store.find_by_name(name).await? {
                emit(&user)?;
            }
            Ok(())
        }
        Command::Insert { name, age } => {
            let id = store
                .insert(&dbkit::models::NewUser::new(name.as_str(), *age))
                .await?;
            emit(&json!({ "id": id }))
        }
        Command::Update { id, age } => {
            let rows = store.update_age(*id, *age).await?;
            emit(&json!({ "rows_affected": rows }))
        }
        Command::Delete { id } => {
            let rows = store.delete(*id).await?;
            emit(&json!({ "rows_affected": rows }))
        }
        Command::Batch { users } => {
            let ids = store.insert_batch(users).await?;
            emit(&json!({ "ids": ids }))
        }
        Command::Transfer { from, to, amount } => {
            store.transfer_age(*from, *to, *amount).await?;
            emit(&json!({ "transferred": amount, "from": from, "to": to }))
        }
    }
}

async fn run(config: &Config) -> DbResult<()> {
    let endpoint = config.endpoint()?;
    info!(
        endpoint = %endpoint.masked(),
        "Starting dbkit v{}",
        env!("CARGO_PKG_VERSION")
    );

    let pool = ConnectionPool::open(&endpoint).await?;
    let executor =
        StatementExecutor::new(pool.clone()).with_query_timeout(config.query_timeout_duration());
    let store = UserStore::new(executor);

    let result = dispatch(&store, &config.command).await;

    debug!(status = ?pool.status(), "Pool status at shutdown");
    pool.close().await;
    result
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();
    init_tracing(&config);

    if let Err(e) = run(&config).await {
        error!(error = %e, "Command failed");
        if let Some(suggestion) = e.suggestion() {
            eprintln!("Hint: {suggestion}");
        }
        return Err(e.into());
    }
    Ok(())
}
