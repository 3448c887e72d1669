//! Database connection pool, migrations, and health check.
//!
//! [`Db`] is the production [`QueueStore`](crate::store::QueueStore): every
//! trait method runs as one Postgres transaction (or one read) on a pooled
//! connection, and the transaction is rolled back on every early exit.

pub mod admin;
pub mod queue;

use std::time::Duration;

use crate::error::{Error, Result};
use crate::store::ConflictKind;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool shared by every engine clone.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, 10, Duration::from_secs(30)).await
    }

    /// Connect with explicit pool sizing and connection-acquire timeout.
    pub async fn connect_with(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Round-trip a `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Classify a failed statement: store-level conflicts are soft, the rest is fatal.
pub(crate) fn conflict_kind(err: &sqlx::Error) -> Option<ConflictKind> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };
    if db_err.is_unique_violation() {
        return Some(ConflictKind::Duplicate);
    }
    match db_err.code().as_deref() {
        // serialization_failure
        Some("40001") => Some(ConflictKind::Other),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_are_not_conflicts() {
        assert_eq!(conflict_kind(&sqlx::Error::RowNotFound), None);
        assert_eq!(conflict_kind(&sqlx::Error::PoolTimedOut), None);
    }
}
