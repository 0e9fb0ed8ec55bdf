//! In-memory backends
//!
//! Mutex-guarded maps standing in for the database. They support fault
//! injection so tests can exercise reconnects and unavailable endpoints.

mod records;
mod webhooks;

pub use records::InMemoryRecordStore;
pub use webhooks::InMemoryWebhookResolver;
