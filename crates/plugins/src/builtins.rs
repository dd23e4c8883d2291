//! Registration of the plugin types compiled into the engine.

use std::sync::Arc;

use crate::email::{self, EmailHandler, Mailer};
use crate::quiz::{self, QuizGradingHandler, ResponseMetadataWriter};
use crate::registry::{PluginRegistry, RegistryError};
use crate::webhook::{self, DeliveryPolicy, WebhookHandler};

/// Outbound resources the built-in handlers are constructed with.
#[derive(Clone)]
pub struct BuiltinDeps {
    pub http: reqwest::Client,
    pub delivery: DeliveryPolicy,
    pub mailer: Arc<dyn Mailer>,
    pub metadata: Arc<dyn ResponseMetadataWriter>,
}

/// Register `webhook`, `email` and `quiz-grading`.
pub fn register_builtins(registry: &mut PluginRegistry, deps: BuiltinDeps) -> Result<(), RegistryError> {
    registry.register(
        webhook::PLUGIN_TYPE,
        Arc::new(WebhookHandler::new(deps.http, deps.delivery)),
        webhook::validate,
    )?;
    registry.register(email::PLUGIN_TYPE, Arc::new(EmailHandler::new(deps.mailer)), email::validate)?;
    registry.register(
        quiz::PLUGIN_TYPE,
        Arc::new(QuizGradingHandler::new(deps.metadata)),
        quiz::validate,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use formplug_core::ResponseId;

    use crate::context::DataAccessError;
    use crate::email::LogMailer;
    use crate::handler::ExecutionMode;
    use crate::quiz::QuizResult;
    use crate::settings::PluginSettings;

    struct Discard;

    #[async_trait]
    impl ResponseMetadataWriter for Discard {
        async fn write_quiz_result(&self, _id: ResponseId, _result: &QuizResult) -> Result<(), DataAccessError> {
            Ok(())
        }
    }

    fn deps() -> BuiltinDeps {
        BuiltinDeps {
            http: reqwest::Client::new(),
            delivery: DeliveryPolicy::default(),
            mailer: Arc::new(LogMailer),
            metadata: Arc::new(Discard),
        }
    }

    #[test]
    fn registers_three_types_sorted() {
        let mut registry = PluginRegistry::new();
        register_builtins(&mut registry, deps()).unwrap();

        let types: Vec<_> = registry.metadata().into_iter().map(|m| (m.plugin_type, m.execution_mode)).collect();
        assert_eq!(
            types,
            vec![
                ("email".to_string(), ExecutionMode::Isolated),
                ("quiz-grading".to_string(), ExecutionMode::Inline),
                ("webhook".to_string(), ExecutionMode::Isolated),
            ]
        );
    }

    #[test]
    fn registering_twice_fails() {
        let mut registry = PluginRegistry::new();
        register_builtins(&mut registry, deps()).unwrap();
        assert!(matches!(
            register_builtins(&mut registry, deps()),
            Err(RegistryError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn validation_goes_through_the_type_validator() {
        let mut registry = PluginRegistry::new();
        register_builtins(&mut registry, deps()).unwrap();

        let settings = registry
            .validate("webhook", &json!({"url": "https://hooks.example.com/in"}))
            .unwrap();
        assert!(matches!(settings, PluginSettings::Webhook(_)));
        assert!(registry.validate("email", &json!({"recipientEmail": "x"})).is_err());
    }
}
