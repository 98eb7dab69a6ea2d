//! Database initialization and migration runner.
//!
//! SYSTEM CONTEXT
//! ==============
//! Startup uses this module to create the shared SQLx pool and enforce schema
//! migrations before the server accepts chat sessions. When no database is
//! configured the process runs on the in-memory store instead and this module
//! is bypassed entirely.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::env_parse;

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_DB_ACQUIRE_TIMEOUT_MS: u64 = 3_000;

fn pool_options() -> PgPoolOptions {
    let max_connections = env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS);
    let acquire_ms = env_parse("DB_ACQUIRE_TIMEOUT_MS", DEFAULT_DB_ACQUIRE_TIMEOUT_MS);

    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_millis(acquire_ms))
}

/// Initialize the `PostgreSQL` connection pool and run migrations.
///
/// Session connects read the store before the websocket upgrade, so the
/// acquire timeout is kept short: a saturated pool surfaces as a storage
/// error instead of a stalled handshake.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = pool_options().connect(database_url).await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}
