//! Seed data for the in-memory stores.
//!
//! ```json
//! {
//!   "forms":     [{ "id": "...", "organizationId": "...", "title": "Signup" }],
//!   "responses": [{ "id": "...", "formId": "...", "data": {...}, "submittedAt": "..." }],
//!   "plugins":   [{ "id": "...", "formId": "...", "organizationId": "...",
//!                   "pluginType": "webhook", "config": {...}, "enabled": true,
//!                   "triggerEvents": ["form.submitted"] }]
//! }
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use formplug_core::{FormMeta, PluginConfig, Response};

use crate::engine::Engine;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Fixtures {
    pub forms: Vec<FormMeta>,
    pub responses: Vec<Response>,
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureSummary {
    pub forms: usize,
    pub responses: usize,
    pub plugins: usize,
}

impl Fixtures {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("malformed fixtures")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("in {}", path.display()))
    }

    /// Load everything into `engine`'s stores. Plugin configs are validated
    /// against the registry; the first invalid one aborts the load.
    pub fn apply(self, engine: &Engine) -> anyhow::Result<FixtureSummary> {
        let summary = FixtureSummary {
            forms: self.forms.len(),
            responses: self.responses.len(),
            plugins: self.plugins.len(),
        };

        for form in self.forms {
            engine.form_data().put_form(form)?;
        }
        for response in self.responses {
            engine.form_data().put_response(response)?;
        }
        for plugin in self.plugins {
            let id = plugin.id;
            engine
                .configs()
                .save(plugin)
                .with_context(|| format!("plugin config {id}"))?;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use formplug_core::{FormId, OrganizationId};
    use formplug_infra::PluginConfigStore;
    use serde_json::json;

    fn engine() -> Engine {
        Engine::start(EngineConfig {
            worker_threads: 0,
            ..EngineConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn applies_valid_fixtures() {
        let form = FormId::new();
        let org = OrganizationId::new();
        let fixtures = Fixtures::from_json(
            &json!({
                "forms": [{ "id": form, "organizationId": org, "title": "Signup" }],
                "plugins": [{
                    "id": formplug_core::PluginConfigId::new(),
                    "formId": form,
                    "organizationId": org,
                    "pluginType": "webhook",
                    "config": { "url": "https://hooks.example.com/in" },
                    "enabled": true,
                    "triggerEvents": ["form.submitted"]
                }]
            })
            .to_string(),
        )
        .unwrap();

        let engine = engine();
        let summary = fixtures.apply(&engine).unwrap();
        assert_eq!(summary, FixtureSummary { forms: 1, responses: 0, plugins: 1 });

        let enabled = engine
            .configs()
            .list_enabled(form, formplug_core::EventType::FormSubmitted)
            .await
            .unwrap();
        assert_eq!(enabled.len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_plugin_config_aborts_load() {
        let fixtures = Fixtures {
            plugins: vec![PluginConfig::new(
                FormId::new(),
                OrganizationId::new(),
                "webhook",
                json!({ "url": "ftp://nope" }),
            )],
            ..Fixtures::default()
        };

        let engine = engine();
        assert!(fixtures.apply(&engine).is_err());
        engine.shutdown().await;
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let fixtures = Fixtures::from_json("{}").unwrap();
        assert_eq!(fixtures, Fixtures::default());
    }
}
