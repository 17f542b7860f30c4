use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

/// Open the Postgres pool used by the chunk store.
///
/// Each connection gets a server-side `statement_timeout` so a runaway
/// vector scan is cancelled by the database, not just abandoned by us.
pub async fn connect(config: &Config) -> Result<PgPool> {
    let url = config
        .db
        .url
        .as_deref()
        .context("db.url (or DATABASE_URL) is not set")?;

    let options = PgConnectOptions::from_str(url)
        .context("Invalid Postgres connection string")?
        .options([(
            "statement_timeout",
            config.db.statement_timeout_ms.to_string(),
        )]);

    let pool = PgPoolOptions::new()
        .max_connections(config.db.max_connections)
        .acquire_timeout(Duration::from_secs(config.db.acquire_timeout_secs))
        .connect_lazy_with(options);

    tracing::debug!(
        max_connections = config.db.max_connections,
        statement_timeout_ms = config.db.statement_timeout_ms,
        "postgres pool configured"
    );

    Ok(pool)
}
