//! Data models for the ingestion core
//!
//! Organized by owner: tasks belong to the upload queue, records to the
//! record store, webhook configs to the dispatcher and sync types to the
//! status synchronizer.

mod file_record;
mod sync;
mod task;
mod webhook;

pub use file_record::*;
pub use sync::*;
pub use task::*;
pub use webhook::*;
