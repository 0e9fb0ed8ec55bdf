//! Monotonic merge of record changes into deltas.

use chrono::{DateTime, Utc};
use docflow_core::models::{
    DeltaKind, FileRecord, FileRecordDelta, ProcessingStatus, RecordChange,
};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Applied {
    updated_at: DateTime<Utc>,
    status: ProcessingStatus,
    deleted: bool,
}

/// Tracks the newest `updated_at` applied per record. Anything at or below it
/// is a replay and is dropped, so a record never moves backwards.
#[derive(Debug, Default)]
pub struct DeltaMerger {
    applied: HashMap<Uuid, Applied>,
    seeded: bool,
}

impl DeltaMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a snapshot has been applied.
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Record the snapshot as the baseline every later delta is compared to.
    pub fn seed(&mut self, records: &[FileRecord]) {
        for record in records {
            self.remember(record.id, record.updated_at, record.processing_status, false);
        }
        self.seeded = true;
    }

    pub fn last_applied(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.applied.get(&id).map(|applied| applied.updated_at)
    }

    /// Turn one channel notification into a delta, or `None` if it is stale.
    pub fn apply(&mut self, change: RecordChange) -> Option<FileRecordDelta> {
        let record_id = change.record_id()?;
        let known = self.applied.get(&record_id).copied();

        match (&change.old, &change.new) {
            (_, Some(new)) => {
                if known.is_some_and(|k| k.deleted || new.updated_at <= k.updated_at) {
                    tracing::debug!(record_id = %record_id, "Dropping stale change");
                    return None;
                }
                let previous = known
                    .map(|k| k.status)
                    .or_else(|| change.old.as_ref().map(|old| old.processing_status));
                let kind = match previous {
                    None => DeltaKind::Inserted,
                    Some(from) if from != new.processing_status => DeltaKind::StatusTransition {
                        from,
                        to: new.processing_status,
                    },
                    Some(_) => DeltaKind::Updated,
                };
                let updated_at = new.updated_at;
                self.remember(record_id, updated_at, new.processing_status, false);
                Some(FileRecordDelta {
                    record_id,
                    kind,
                    old: change.old,
                    new: change.new,
                    updated_at,
                })
            }
            (Some(old), None) => {
                // A delete of a version older than the one already shown is a replay.
                if known.is_some_and(|k| k.deleted || old.updated_at < k.updated_at) {
                    tracing::debug!(record_id = %record_id, "Dropping stale delete");
                    return None;
                }
                let updated_at = old.updated_at;
                self.remember(record_id, updated_at, old.processing_status, true);
                Some(FileRecordDelta {
                    record_id,
                    kind: DeltaKind::Deleted,
                    old: change.old,
                    new: None,
                    updated_at,
                })
            }
            (None, None) => None,
        }
    }

    /// Merge a record read by polling. Emits a delta only if it is newer than
    /// what was last applied.
    pub fn observe(&mut self, record: FileRecord) -> Option<FileRecordDelta> {
        self.apply(RecordChange {
            old: None,
            new: Some(record),
        })
    }

    fn remember(
        &mut self,
        id: Uuid,
        updated_at: DateTime<Utc>,
        status: ProcessingStatus,
        deleted: bool,
    ) {
        self.applied.insert(
            id,
            Applied {
                updated_at,
                status,
                deleted,
            },
        );
    }
}
