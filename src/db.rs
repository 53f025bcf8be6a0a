//! Connection pool and schema migrations.
//!
//! Migrations are applied before the API starts serving requests; startup is
//! aborted when they fail.

use rocket_db_pools::Database;
use rocket_db_pools::sqlx::{self, PgPool, migrate::Migrator};

#[derive(Database)]
#[database("codekata_db")]
pub struct CodekataDb(PgPool);

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply pending migrations. Already-applied migrations are skipped.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    log::info!("checking database migration state");
    MIGRATOR.run(pool).await?;
    log::info!("database migrations up to date");
    Ok(())
}
