//! Static plugin registry: plugin type → (handler, validator).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use formplug_core::{PluginConfig, PluginError};

use crate::handler::{ConfigValidator, PluginHandler, PluginMetadata};
use crate::settings::{PluginSettings, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("plugin type already registered: {0}")]
    AlreadyRegistered(String),
    #[error("plugin type not registered: {0}")]
    NotFound(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl From<RegistryError> for PluginError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(ty) => PluginError::not_registered(&ty),
            RegistryError::Invalid(v) => v.into(),
            RegistryError::AlreadyRegistered(ty) => {
                PluginError::validation(format!("duplicate plugin type {ty}"))
            }
        }
    }
}

struct Entry {
    handler: Arc<dyn PluginHandler>,
    validator: ConfigValidator,
}

/// Lookup table populated once at process start.
///
/// Registration is append-only: a type can't be replaced once registered.
#[derive(Default)]
pub struct PluginRegistry {
    entries: BTreeMap<String, Entry>,
}

impl core::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        plugin_type: impl Into<String>,
        handler: Arc<dyn PluginHandler>,
        validator: ConfigValidator,
    ) -> Result<(), RegistryError> {
        let plugin_type = plugin_type.into();
        if self.entries.contains_key(&plugin_type) {
            return Err(RegistryError::AlreadyRegistered(plugin_type));
        }
        self.entries.insert(plugin_type, Entry { handler, validator });
        Ok(())
    }

    pub fn get(&self, plugin_type: &str) -> Result<Arc<dyn PluginHandler>, RegistryError> {
        self.entries
            .get(plugin_type)
            .map(|e| e.handler.clone())
            .ok_or_else(|| RegistryError::NotFound(plugin_type.to_string()))
    }

    pub fn contains(&self, plugin_type: &str) -> bool {
        self.entries.contains_key(plugin_type)
    }

    /// Validate a raw config for `plugin_type`.
    ///
    /// The configuration store calls this before persisting a config; the
    /// engine calls it again before every execution because configs can be
    /// edited in between.
    pub fn validate(&self, plugin_type: &str, raw: &JsonValue) -> Result<PluginSettings, RegistryError> {
        let entry = self
            .entries
            .get(plugin_type)
            .ok_or_else(|| RegistryError::NotFound(plugin_type.to_string()))?;
        Ok((entry.validator)(raw)?)
    }

    /// Handler and validated settings for a stored config.
    pub fn resolve(
        &self,
        config: &PluginConfig,
    ) -> Result<(Arc<dyn PluginHandler>, PluginSettings), PluginError> {
        let handler = self.get(&config.plugin_type)?;
        let settings = self.validate(&config.plugin_type, &config.config)?;
        Ok((handler, settings))
    }

    /// Metadata for every registered type, ordered by type.
    pub fn metadata(&self) -> Vec<PluginMetadata> {
        self.entries.values().map(|e| e.handler.metadata()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use formplug_core::{ErrorKind, FormId, OrganizationId, PluginResult};
    use formplug_events::Event;
    use serde_json::json;

    use crate::context::PluginContext;
    use crate::handler::ExecutionMode;
    use crate::quiz::QuizGradingSettings;
    use crate::settings::PluginSettings;

    struct Noop;

    #[async_trait]
    impl PluginHandler for Noop {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata {
                plugin_type: "noop".into(),
                name: "No-op".into(),
                description: "does nothing".into(),
                execution_mode: ExecutionMode::Inline,
            }
        }

        async fn execute(
            &self,
            _settings: &PluginSettings,
            _event: &Event,
            _ctx: &PluginContext,
        ) -> PluginResult<JsonValue> {
            Ok(JsonValue::Null)
        }
    }

    fn accept_all(_raw: &JsonValue) -> Result<PluginSettings, ValidationError> {
        Ok(PluginSettings::QuizGrading(QuizGradingSettings {
            quiz_fields: Vec::new(),
            pass_threshold: 0.0,
        }))
    }

    fn reject_all(_raw: &JsonValue) -> Result<PluginSettings, ValidationError> {
        Err(ValidationError::single("noop", "always invalid"))
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = PluginRegistry::new();
        registry.register("noop", Arc::new(Noop), accept_all).unwrap();

        let err = registry.register("noop", Arc::new(Noop), accept_all).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("noop".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_type_maps_to_not_registered() {
        let registry = PluginRegistry::new();
        assert!(matches!(registry.get("sms"), Err(RegistryError::NotFound(_))));

        let cfg = PluginConfig::new(FormId::new(), OrganizationId::new(), "sms", json!({}));
        let err = registry.resolve(&cfg).err().unwrap();
        assert_eq!(err.kind, ErrorKind::HandlerNotRegistered);
    }

    #[test]
    fn invalid_config_maps_to_validation_error() {
        let mut registry = PluginRegistry::new();
        registry.register("noop", Arc::new(Noop), reject_all).unwrap();

        let cfg = PluginConfig::new(FormId::new(), OrganizationId::new(), "noop", json!({}));
        let err = registry.resolve(&cfg).err().unwrap();
        assert_eq!(err.kind, ErrorKind::ValidationError);
        assert!(err.message.contains("always invalid"));
    }

    #[test]
    fn metadata_lists_registered_types() {
        let mut registry = PluginRegistry::new();
        registry.register("noop", Arc::new(Noop), accept_all).unwrap();

        let meta = registry.metadata();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].plugin_type, "noop");
        assert_eq!(meta[0].execution_mode, ExecutionMode::Inline);
    }
}
