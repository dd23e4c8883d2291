//! Typed plugin settings.
//!
//! Config rows arrive from the store as raw JSON. A validator turns that JSON
//! into one variant of [`PluginSettings`]; handlers only ever see the typed
//! form.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use formplug_core::PluginError;

use crate::email::EmailSettings;
use crate::quiz::QuizGradingSettings;
use crate::webhook::WebhookSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum PluginSettings {
    #[serde(rename = "webhook")]
    Webhook(WebhookSettings),
    #[serde(rename = "email")]
    Email(EmailSettings),
    #[serde(rename = "quiz-grading")]
    QuizGrading(QuizGradingSettings),
}

impl PluginSettings {
    pub fn plugin_type(&self) -> &'static str {
        match self {
            PluginSettings::Webhook(_) => crate::webhook::PLUGIN_TYPE,
            PluginSettings::Email(_) => crate::email::PLUGIN_TYPE,
            PluginSettings::QuizGrading(_) => crate::quiz::PLUGIN_TYPE,
        }
    }
}

/// A plugin config failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid `{plugin_type}` config: {}", .issues.join("; "))]
pub struct ValidationError {
    pub plugin_type: String,
    pub issues: Vec<String>,
}

impl ValidationError {
    pub fn new(plugin_type: impl Into<String>, issues: Vec<String>) -> Self {
        Self {
            plugin_type: plugin_type.into(),
            issues,
        }
    }

    pub fn single(plugin_type: impl Into<String>, issue: impl Into<String>) -> Self {
        Self::new(plugin_type, vec![issue.into()])
    }
}

impl From<ValidationError> for PluginError {
    fn from(err: ValidationError) -> Self {
        PluginError::validation(err.to_string())
    }
}

/// Deserialize a raw config into `T`, reporting shape errors as a validation
/// failure for `plugin_type`.
pub(crate) fn parse_raw<T: DeserializeOwned>(
    plugin_type: &str,
    raw: &JsonValue,
) -> Result<T, ValidationError> {
    serde_json::from_value(raw.clone()).map_err(|e| ValidationError::single(plugin_type, e.to_string()))
}

/// Collects issues and turns them into a result.
#[derive(Debug, Default)]
pub(crate) struct Issues(Vec<String>);

impl Issues {
    pub(crate) fn check(&mut self, ok: bool, issue: impl FnOnce() -> String) {
        if !ok {
            self.0.push(issue());
        }
    }

    pub(crate) fn push(&mut self, issue: impl Into<String>) {
        self.0.push(issue.into());
    }

    pub(crate) fn finish<T>(self, plugin_type: &str, value: T) -> Result<T, ValidationError> {
        if self.0.is_empty() {
            Ok(value)
        } else {
            Err(ValidationError::new(plugin_type, self.0))
        }
    }
}
