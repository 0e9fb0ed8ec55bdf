//! Dispatch context trait
//!
//! The queue hands every uploaded file to a `DispatchContext` once its record
//! exists. `ProcessingDispatcher` is the production implementation; tests
//! plug in scripted ones.

use async_trait::async_trait;
use docflow_core::models::{DispatchOutcome, DispatchScope, FileRecord};
use docflow_infra::ProcessingDispatcher;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait DispatchContext: Send + Sync {
    /// Start processing for `record`. Must not start another attempt after
    /// `cancel` fires.
    async fn dispatch(
        &self,
        record: &FileRecord,
        scope: &DispatchScope,
        cancel: &CancellationToken,
    ) -> DispatchOutcome;
}

#[async_trait]
impl DispatchContext for ProcessingDispatcher {
    async fn dispatch(
        &self,
        record: &FileRecord,
        scope: &DispatchScope,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        ProcessingDispatcher::dispatch(self, record, scope, cancel).await
    }
}
