//! Handler resolution and invocation shared by the inline and worker paths.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::Instrument;

use formplug_core::{ErrorKind, PluginConfig, PluginConfigId, PluginError, PluginResult};
use formplug_events::Event;
use formplug_plugins::{PluginContext, PluginHandler, PluginRegistry, PluginSettings};

use crate::config_store::PluginConfigStore;
use crate::error::StoreError;

/// Why an attempt produced no result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptError {
    /// Classified plugin failure; the retry policy decides what happens next.
    #[error(transparent)]
    Plugin(#[from] PluginError),
    /// The config store could not be read. Never retried.
    #[error("config store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl AttemptError {
    pub fn plugin_kind(&self) -> Option<ErrorKind> {
        match self {
            AttemptError::Plugin(e) => Some(e.kind),
            AttemptError::Store(_) => None,
        }
    }
}

pub type AttemptResult<T> = Result<T, AttemptError>;

/// Load a config by id and resolve its handler and validated settings.
///
/// Runs before every attempt: the config may have been disabled, deleted or
/// edited since the job was created.
pub async fn load_handler(
    configs: &dyn PluginConfigStore,
    registry: &PluginRegistry,
    id: PluginConfigId,
) -> AttemptResult<(PluginConfig, Arc<dyn PluginHandler>, PluginSettings)> {
    let config = configs
        .get(id)
        .await?
        .ok_or_else(|| PluginError::config_not_found(format!("plugin config {id} not found")))?;
    if !config.enabled {
        return Err(PluginError::disabled(format!("plugin config {id} is disabled")).into());
    }

    let (handler, settings) = registry.resolve(&config)?;
    Ok((config, handler, settings))
}

/// Run `handler` once, bounded by `timeout`, inside the context's span.
pub async fn invoke(
    handler: &dyn PluginHandler,
    settings: &PluginSettings,
    event: &Event,
    ctx: &PluginContext,
    timeout: Duration,
) -> PluginResult<JsonValue> {
    let span = ctx.logger().span().clone();
    match tokio::time::timeout(timeout, handler.execute(settings, event, ctx).instrument(span)).await {
        Ok(result) => result,
        Err(_) => Err(PluginError::handler_timeout(format!(
            "handler did not finish within {}ms",
            timeout.as_millis()
        ))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use formplug_core::{FormId, JobId, OrganizationId};
    use formplug_plugins::{ExecutionMode, PluginMetadata, QuizGradingSettings, ValidationError};
    use serde_json::json;

    use crate::config_store::InMemoryConfigStore;
    use crate::form_data::InMemoryFormData;

    struct Sleepy(Duration);

    #[async_trait]
    impl PluginHandler for Sleepy {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata {
                plugin_type: "sleepy".into(),
                name: "Sleepy".into(),
                description: "sleeps".into(),
                execution_mode: ExecutionMode::Inline,
            }
        }

        async fn execute(&self, _s: &PluginSettings, _e: &Event, _c: &PluginContext) -> PluginResult<JsonValue> {
            tokio::time::sleep(self.0).await;
            Ok(json!("done"))
        }
    }

    fn any_settings(_raw: &JsonValue) -> Result<PluginSettings, ValidationError> {
        Ok(PluginSettings::QuizGrading(QuizGradingSettings {
            quiz_fields: Vec::new(),
            pass_threshold: 0.0,
        }))
    }

    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry
            .register("sleepy", Arc::new(Sleepy(Duration::from_millis(200))), any_settings)
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn load_handler_classifies_missing_and_disabled() {
        let registry = registry();
        let store = InMemoryConfigStore::new();

        let err = load_handler(&store, &registry, PluginConfigId::new()).await.err().unwrap();
        assert_eq!(err.plugin_kind(), Some(ErrorKind::ConfigNotFound));

        let cfg = PluginConfig::new(FormId::new(), OrganizationId::new(), "sleepy", json!({})).disabled();
        store.save(cfg.clone()).unwrap();
        let err = load_handler(&store, &registry, cfg.id).await.err().unwrap();
        assert_eq!(err.plugin_kind(), Some(ErrorKind::PluginDisabled));

        store.set_enabled(cfg.id, true).unwrap();
        let (loaded, handler, _) = load_handler(&store, &registry, cfg.id).await.unwrap();
        assert_eq!(loaded.id, cfg.id);
        assert_eq!(handler.metadata().plugin_type, "sleepy");
    }

    struct Down;

    #[async_trait]
    impl PluginConfigStore for Down {
        async fn list_enabled(
            &self,
            _f: FormId,
            _e: formplug_core::EventType,
        ) -> Result<Vec<PluginConfig>, StoreError> {
            Ok(Vec::new())
        }

        async fn get(&self, _id: PluginConfigId) -> Result<Option<PluginConfig>, StoreError> {
            Err(StoreError::Storage("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn store_failure_is_not_a_plugin_error() {
        let err = load_handler(&Down, &registry(), PluginConfigId::new()).await.err().unwrap();
        assert_eq!(err, AttemptError::Store(StoreError::Storage("connection reset".into())));
        assert_eq!(err.plugin_kind(), None);
    }

    #[tokio::test]
    async fn invoke_enforces_timeout() {
        let data = InMemoryFormData::arc();
        let ctx = PluginContext::new(JobId::new(), PluginConfigId::new(), "sleepy", data.clone(), data);
        let event = Event::form_submitted(FormId::new(), OrganizationId::new(), formplug_core::ResponseId::new());
        let settings = any_settings(&json!({})).unwrap();

        let err = invoke(&Sleepy(Duration::from_secs(5)), &settings, &event, &ctx, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::HandlerTimeout);

        let ok = invoke(&Sleepy(Duration::ZERO), &settings, &event, &ctx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ok, json!("done"));
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
