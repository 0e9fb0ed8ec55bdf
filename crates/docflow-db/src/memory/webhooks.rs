use async_trait::async_trait;
use docflow_core::models::{DispatchScope, WebhookConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::traits::{ResolveError, WebhookResolver};

/// Webhook configs keyed by `(tenant_id, feature)`.
#[derive(Clone, Default)]
pub struct InMemoryWebhookResolver {
    configs: Arc<Mutex<HashMap<(Uuid, String), WebhookConfig>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryWebhookResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, config: WebhookConfig) {
        self.configs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((config.tenant_id, config.feature.clone()), config);
    }

    pub fn remove(&self, tenant_id: Uuid, feature: &str) -> Option<WebhookConfig> {
        self.configs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(tenant_id, feature.to_string()))
    }

    /// Make lookups fail as if the backing store were down.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl WebhookResolver for InMemoryWebhookResolver {
    async fn resolve_active_config(
        &self,
        scope: &DispatchScope,
    ) -> Result<WebhookConfig, ResolveError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ResolveError::Backend(
                "webhook configuration store unavailable".to_string(),
            ));
        }

        let configs = self
            .configs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only the config registered for this exact feature counts; other
        // active endpoints of the tenant are never used as a fallback.
        match configs.get(&(scope.tenant_id, scope.feature.clone())) {
            Some(config) if config.is_active => Ok(config.clone()),
            Some(_) => Err(ResolveError::Inactive(scope.feature.clone())),
            None => Err(ResolveError::NotFound(scope.feature.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_exact_active_config() {
        let resolver = InMemoryWebhookResolver::new();
        let tenant = Uuid::new_v4();
        resolver.upsert(WebhookConfig::new(tenant, "knowledge_base", "https://engine.test/jobs"));

        let config = resolver
            .resolve_active_config(&DispatchScope::new(tenant, "knowledge_base"))
            .await
            .unwrap();
        assert_eq!(config.url, "https://engine.test/jobs");
    }

    #[tokio::test]
    async fn never_falls_back_to_another_feature() {
        let resolver = InMemoryWebhookResolver::new();
        let tenant = Uuid::new_v4();
        resolver.upsert(WebhookConfig::new(tenant, "thumbnails", "https://other.test/hook"));

        let result = resolver
            .resolve_active_config(&DispatchScope::new(tenant, "knowledge_base"))
            .await;
        assert!(matches!(result, Err(ResolveError::NotFound(_))));
    }

    #[tokio::test]
    async fn inactive_is_distinct_from_missing() {
        let resolver = InMemoryWebhookResolver::new();
        let tenant = Uuid::new_v4();
        let mut config = WebhookConfig::new(tenant, "knowledge_base", "https://engine.test/jobs");
        config.is_active = false;
        resolver.upsert(config);

        let result = resolver
            .resolve_active_config(&DispatchScope::new(tenant, "knowledge_base"))
            .await;
        assert!(matches!(result, Err(ResolveError::Inactive(_))));
    }

    #[tokio::test]
    async fn backend_failure() {
        let resolver = InMemoryWebhookResolver::new();
        resolver.set_failing(true);
        let result = resolver
            .resolve_active_config(&DispatchScope::new(Uuid::new_v4(), "knowledge_base"))
            .await;
        assert!(matches!(result, Err(ResolveError::Backend(_))));
    }
}
