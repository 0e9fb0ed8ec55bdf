use async_trait::async_trait;
use docflow_core::models::{RecordChange, RecordFilter};
use futures::StreamExt;
use sqlx::postgres::PgListener;
use sqlx::PgPool;

use crate::traits::{change_matches, ChangeFeed, ChangeFeedError, ChangeStream};

/// Channel the `file_records_notify` trigger publishes on.
pub const CHANGE_NOTIFY_CHANNEL: &str = "docflow_file_changes";

/// Change feed over PostgreSQL LISTEN/NOTIFY.
///
/// Each subscription holds its own listener connection; dropping the stream
/// closes it.
#[derive(Clone)]
pub struct PgChangeFeed {
    pool: PgPool,
}

impl PgChangeFeed {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn subscribe(&self, filter: &RecordFilter) -> Result<ChangeStream, ChangeFeedError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| ChangeFeedError::Connect(e.to_string()))?;
        listener
            .listen(CHANGE_NOTIFY_CHANNEL)
            .await
            .map_err(|e| ChangeFeedError::Connect(e.to_string()))?;

        tracing::debug!(
            channel = CHANGE_NOTIFY_CHANNEL,
            tenant_id = %filter.tenant_id,
            "Subscribed to file record changes"
        );

        let filter = filter.clone();
        let stream = listener
            .into_stream()
            .filter_map(move |notification| {
                let item = match notification {
                    Ok(notification) => {
                        match serde_json::from_str::<RecordChange>(notification.payload()) {
                            Ok(change) if change_matches(&filter, &change) => Some(Ok(change)),
                            Ok(_) => None,
                            Err(e) => Some(Err(ChangeFeedError::Decode(e.to_string()))),
                        }
                    }
                    Err(e) => Some(Err(ChangeFeedError::Closed(e.to_string()))),
                };
                futures::future::ready(item)
            });

        Ok(Box::pin(stream))
    }
}
