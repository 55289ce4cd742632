pub mod api;
pub mod cancellation;
pub mod cart;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fulfillment;
pub mod ledger;
pub mod models;
pub mod orders;
pub mod outbox;
pub mod payments;
pub mod schema;
pub mod settlement;

use diesel::{Connection, PgConnection};
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub use error::{MarketError, MarketResult};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = Pool<AsyncPgConnection>;

/// Migrations run on a blocking connection before the async pool is built.
pub fn run_migrations(database_url: &str) -> anyhow::Result<()> {
    let mut conn = PgConnection::establish(database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    Ok(())
}

pub async fn connect_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let config = diesel_async::pooled_connection::AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder().build(config).await?;
    Ok(pool)
}
