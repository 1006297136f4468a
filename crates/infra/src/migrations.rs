//! Embedded database migrations.
//!
//! Both binaries run these at startup; already-applied migrations are
//! skipped, so concurrent instances can boot in any order.

use sqlx::migrate::MigrateError;
use sqlx::PgPool;

/// PostgreSQL migrator with the report schema embedded.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Apply all pending migrations. Safe to call multiple times.
pub async fn run(pool: &PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
