//! PostgreSQL backends
//!
//! Schema and change trigger live in `migrations/0001_init.sql`; run them with
//! `sqlx::migrate!` before constructing these types.

mod feed;
mod records;
mod webhooks;

pub use feed::{PgChangeFeed, CHANGE_NOTIFY_CHANNEL};
pub use records::PgFileRecordStore;
pub use webhooks::PgWebhookResolver;

/// Run the bundled migrations.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
