//! Schema migrations for the subscriber cache.

use sqlx::PgPool;
use sqlx::migrate::Migrator;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply pending migrations.
///
/// Idempotent: already-applied migrations are skipped and checksums verified.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    log::info!("checking cache schema migration state");
    MIGRATOR.run(pool).await?;
    log::info!("cache schema up to date");
    Ok(())
}
