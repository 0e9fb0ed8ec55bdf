//! Status synchronizer
//!
//! Watches a tenant-scoped slice of the record store and republishes it as
//! a snapshot followed by monotonic deltas, with connectivity events for
//! the UI. The change feed is best-effort; reconnects back off exponentially
//! and the record store is polled while the feed is down.

mod merger;
mod synchronizer;

pub use merger::DeltaMerger;
pub use synchronizer::{StatusSynchronizer, SyncEvent, SyncHandle};
