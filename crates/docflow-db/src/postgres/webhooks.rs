use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docflow_core::models::{DispatchScope, WebhookConfig};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use std::collections::HashMap;
use uuid::Uuid;

use crate::traits::{ResolveError, WebhookResolver};

#[derive(sqlx::FromRow)]
struct WebhookConfigRow {
    id: Uuid,
    tenant_id: Uuid,
    feature: String,
    url: String,
    timeout_seconds: i64,
    retry_attempts: i32,
    is_active: bool,
    headers: Json<HashMap<String, String>>,
    signing_secret: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WebhookConfigRow> for WebhookConfig {
    fn from(row: WebhookConfigRow) -> Self {
        WebhookConfig {
            id: row.id,
            tenant_id: row.tenant_id,
            feature: row.feature,
            url: row.url,
            timeout_seconds: row.timeout_seconds.max(0) as u64,
            retry_attempts: row.retry_attempts.max(0) as u32,
            is_active: row.is_active,
            headers: row.headers.0,
            signing_secret: row.signing_secret,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct PgWebhookResolver {
    pool: PgPool,
}

impl PgWebhookResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookResolver for PgWebhookResolver {
    async fn resolve_active_config(
        &self,
        scope: &DispatchScope,
    ) -> Result<WebhookConfig, ResolveError> {
        let row = sqlx::query_as::<Postgres, WebhookConfigRow>(
            r#"
            SELECT id, tenant_id, feature, url, timeout_seconds, retry_attempts,
                is_active, headers, signing_secret, created_at, updated_at
            FROM webhook_configs
            WHERE tenant_id = $1 AND feature = $2
            "#,
        )
        .bind(scope.tenant_id)
        .bind(&scope.feature)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ResolveError::Backend(e.to_string()))?;

        match row {
            Some(row) if row.is_active => Ok(row.into()),
            Some(_) => Err(ResolveError::Inactive(scope.feature.clone())),
            None => Err(ResolveError::NotFound(scope.feature.clone())),
        }
    }
}
