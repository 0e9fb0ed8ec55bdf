use async_trait::async_trait;
use chrono::Utc;
use docflow_core::models::{
    FileRecord, FileRecordPatch, NewFileRecord, Pagination, ProcessingLogEntry, RecordFilter,
    StatusGuard,
};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::traits::{FileRecordStore, RecordStoreError};

const RECORD_COLUMNS: &str = "id, tenant_id, collection_id, file_name, storage_path, size, \
    content_type, processing_status, chunk_count, vector_count, error_message, created_at, updated_at";

fn backend(err: sqlx::Error) -> RecordStoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RecordStoreError::Unavailable(err.to_string())
        }
        other => RecordStoreError::Backend(other.to_string()),
    }
}

#[derive(Clone)]
pub struct PgFileRecordStore {
    pool: PgPool,
}

impl PgFileRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileRecordStore for PgFileRecordStore {
    async fn insert(&self, record: NewFileRecord) -> Result<Uuid, RecordStoreError> {
        let id = record.id;
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO file_records (
                id, tenant_id, collection_id, file_name, storage_path, size,
                content_type, processing_status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.tenant_id)
        .bind(record.collection_id)
        .bind(&record.file_name)
        .bind(&record.storage_path)
        .bind(record.size)
        .bind(&record.content_type)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(RecordStoreError::Conflict(id));
        }
        Ok(id)
    }

    async fn update(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        patch: FileRecordPatch,
        guard: StatusGuard,
    ) -> Result<FileRecord, RecordStoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let mut record = sqlx::query_as::<Postgres, FileRecord>(&format!(
            "SELECT {} FROM file_records WHERE tenant_id = $1 AND id = $2 FOR UPDATE",
            RECORD_COLUMNS
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?
        .ok_or(RecordStoreError::NotFound(id))?;

        if !patch.apply_to(&mut record, guard, Utc::now()) {
            tx.commit().await.map_err(backend)?;
            return Ok(record);
        }

        if guard == StatusGuard::Explicit {
            sqlx::query("SELECT set_config('docflow.explicit_status', 'on', true)")
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }

        let stored = sqlx::query_as::<Postgres, FileRecord>(&format!(
            r#"
            UPDATE file_records
            SET processing_status = $3,
                error_message = $4,
                storage_path = $5,
                chunk_count = $6,
                vector_count = $7
            WHERE tenant_id = $1 AND id = $2
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(tenant_id)
        .bind(id)
        .bind(record.processing_status)
        .bind(&record.error_message)
        .bind(&record.storage_path)
        .bind(record.chunk_count)
        .bind(record.vector_count)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(stored)
    }

    async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<FileRecord>, RecordStoreError> {
        sqlx::query_as::<Postgres, FileRecord>(&format!(
            "SELECT {} FROM file_records WHERE tenant_id = $1 AND id = $2",
            RECORD_COLUMNS
        ))
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)
    }

    async fn query(
        &self,
        filter: &RecordFilter,
        pagination: Pagination,
    ) -> Result<Vec<FileRecord>, RecordStoreError> {
        sqlx::query_as::<Postgres, FileRecord>(&format!(
            r#"
            SELECT {}
            FROM file_records
            WHERE tenant_id = $1
                AND ($2::uuid IS NULL OR collection_id = $2)
                AND ($3::text IS NULL OR processing_status = $3)
            ORDER BY created_at ASC, id ASC
            LIMIT $4 OFFSET $5
            "#,
            RECORD_COLUMNS
        ))
        .bind(filter.tenant_id)
        .bind(filter.collection_id)
        .bind(filter.processing_status.map(|s| s.to_string()))
        .bind(pagination.limit)
        .bind(pagination.offset)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)
    }

    async fn delete(&self, tenant_id: Uuid, id: Uuid) -> Result<bool, RecordStoreError> {
        let result = sqlx::query("DELETE FROM file_records WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_processing_log(
        &self,
        entry: ProcessingLogEntry,
    ) -> Result<(), RecordStoreError> {
        sqlx::query(
            r#"
            INSERT INTO processing_log (
                id, file_id, tenant_id, attempt, status_code, success,
                error_message, duration_ms, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.file_id)
        .bind(entry.tenant_id)
        .bind(entry.attempt)
        .bind(entry.status_code)
        .bind(entry.success)
        .bind(&entry.error_message)
        .bind(entry.duration_ms)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn list_processing_log(
        &self,
        tenant_id: Uuid,
        file_id: Uuid,
    ) -> Result<Vec<ProcessingLogEntry>, RecordStoreError> {
        sqlx::query_as::<Postgres, ProcessingLogEntry>(
            r#"
            SELECT id, file_id, tenant_id, attempt, status_code, success,
                error_message, duration_ms, created_at
            FROM processing_log
            WHERE tenant_id = $1 AND file_id = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id)
        .bind(file_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)
    }
}
