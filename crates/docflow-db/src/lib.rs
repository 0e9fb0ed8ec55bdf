//! Docflow DB Library
//!
//! Collaborator interfaces the ingestion core consumes: the record store,
//! the change-notification channel and the webhook resolver. Ships an
//! in-memory backend (tests, CLI dry runs) and a PostgreSQL backend behind
//! the `postgres` feature.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod traits;

pub use memory::{InMemoryRecordStore, InMemoryWebhookResolver};
#[cfg(feature = "postgres")]
pub use postgres::{PgChangeFeed, PgFileRecordStore, PgWebhookResolver, CHANGE_NOTIFY_CHANNEL};
pub use traits::{
    change_matches, ChangeFeed, ChangeFeedError, ChangeStream, FileRecordStore, RecordStoreError,
    ResolveError, WebhookResolver,
};
