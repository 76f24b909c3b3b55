use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;

pub type DbPool = sqlx::SqlitePool;

/// Pool tuning for the engine's SQLite database. Defaults suit an
/// embedded engine serving a handful of concurrent approval operations;
/// the busy timeout covers writers colliding on the single-writer file.
#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub busy_timeout_ms: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { max_connections: 5, acquire_timeout_secs: 30, busy_timeout_ms: 5_000 }
    }
}

impl PoolSettings {
    /// One shared connection. In-memory databases get a fresh database
    /// per connection, so tests over `sqlite::memory:` need this.
    pub fn single_connection() -> Self {
        Self { max_connections: 1, ..Self::default() }
    }
}

pub async fn connect(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect_with(database_url, &PoolSettings::default()).await
}

pub async fn connect_with(
    database_url: &str,
    settings: &PoolSettings,
) -> Result<DbPool, sqlx::Error> {
    let busy_timeout_ms = settings.busy_timeout_ms;
    SqlitePoolOptions::new()
        .max_connections(settings.max_connections.max(1))
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs.max(1)))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                // Foreign keys guard the audit_log -> approval_instance
                // reference; WAL lets dispatch polls read during writes.
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query(&format!("PRAGMA busy_timeout = {busy_timeout_ms}"))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
}
