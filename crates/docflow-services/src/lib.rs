//! Docflow Services Layer
//!
//! The status synchronizer and the orchestration facade. Re-exports the
//! pieces a caller needs to wire the ingestion core, so a UI or CLI can
//! depend on this crate alone.

pub mod orchestrator;
pub mod sync;

pub use docflow_core::models::{
    ConnState, ConnectivityEvent, Destination, DispatchOutcome, DispatchScope, FileRecordDelta,
    ProgressEvent, SourceFile, SyncScope, SyncUpdate, TaskHandle, TaskSnapshot, TaskStatus,
};
pub use docflow_core::{Config, IngestError, IngestResult};
pub use docflow_infra::init_telemetry;
pub use docflow_worker::{DispatchContext, UploadQueue};
pub use orchestrator::{Collaborators, Orchestrator};
pub use sync::{DeltaMerger, StatusSynchronizer, SyncEvent, SyncHandle};
