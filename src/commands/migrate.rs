//! `migrate` subcommand: apply embedded Diesel migrations to `DATABASE_URL`.

use anyhow::{Context, Result};
use diesel::Connection;
use diesel::PgConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tracing::info;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/");

pub async fn handle_migrate() -> Result<()> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    tokio::task::spawn_blocking(move || {
        let mut conn = PgConnection::establish(&database_url)
            .with_context(|| format!("failed to connect to {database_url}"))?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("failed to run migrations: {e}"))?;
        for migration in &applied {
            info!(migration = %migration, "applied migration");
        }
        info!(count = applied.len(), "migrations up to date");
        Ok::<(), anyhow::Error>(())
    })
    .await?
}
