//! Read access to installed plugin configurations.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use formplug_core::{EventType, FormId, PluginConfig, PluginConfigId};
use formplug_plugins::PluginRegistry;

use crate::error::StoreError;

/// Plugin configuration store as seen by the engine.
#[async_trait]
pub trait PluginConfigStore: Send + Sync {
    /// Enabled configs on `form_id` whose triggers include `event_type`.
    async fn list_enabled(&self, form_id: FormId, event_type: EventType) -> Result<Vec<PluginConfig>, StoreError>;

    async fn get(&self, id: PluginConfigId) -> Result<Option<PluginConfig>, StoreError>;
}

#[async_trait]
impl<S> PluginConfigStore for Arc<S>
where
    S: PluginConfigStore + ?Sized,
{
    async fn list_enabled(&self, form_id: FormId, event_type: EventType) -> Result<Vec<PluginConfig>, StoreError> {
        (**self).list_enabled(form_id, event_type).await
    }

    async fn get(&self, id: PluginConfigId) -> Result<Option<PluginConfig>, StoreError> {
        (**self).get(id).await
    }
}

/// In-memory configuration store for tests/dev.
///
/// With a registry attached, `save` validates the config against its plugin
/// type before storing it, the way the product's API does.
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    configs: RwLock<BTreeMap<PluginConfigId, PluginConfig>>,
    registry: Option<Arc<PluginRegistry>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: Arc<PluginRegistry>) -> Self {
        Self {
            configs: RwLock::default(),
            registry: Some(registry),
        }
    }

    /// Insert or replace a config.
    pub fn save(&self, config: PluginConfig) -> Result<(), StoreError> {
        if let Some(registry) = &self.registry {
            registry
                .validate(&config.plugin_type, &config.config)
                .map_err(|e| StoreError::Rejected(e.to_string()))?;
        }
        self.configs.write()?.insert(config.id, config);
        Ok(())
    }

    pub fn set_enabled(&self, id: PluginConfigId, enabled: bool) -> Result<(), StoreError> {
        let mut configs = self.configs.write()?;
        let config = configs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        config.enabled = enabled;
        Ok(())
    }

    pub fn remove(&self, id: PluginConfigId) -> Result<Option<PluginConfig>, StoreError> {
        Ok(self.configs.write()?.remove(&id))
    }
}

#[async_trait]
impl PluginConfigStore for InMemoryConfigStore {
    async fn list_enabled(&self, form_id: FormId, event_type: EventType) -> Result<Vec<PluginConfig>, StoreError> {
        Ok(self
            .configs
            .read()?
            .values()
            .filter(|c| c.matches(form_id, event_type))
            .cloned()
            .collect())
    }

    async fn get(&self, id: PluginConfigId) -> Result<Option<PluginConfig>, StoreError> {
        Ok(self.configs.read()?.get(&id).cloned())
    }
}
