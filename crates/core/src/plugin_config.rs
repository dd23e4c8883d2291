use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::event_type::EventType;
use crate::id::{FormId, OrganizationId, PluginConfigId};

/// A plugin installed on a form.
///
/// Owned by the configuration store; the engine only reads it. `config` is the
/// raw per-type payload as stored; it is turned into typed settings by the
/// registry validator before every execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    pub id: PluginConfigId,
    pub form_id: FormId,
    pub organization_id: OrganizationId,
    pub plugin_type: String,
    #[serde(default)]
    pub config: JsonValue,
    pub enabled: bool,
    pub trigger_events: BTreeSet<EventType>,
}

impl PluginConfig {
    pub fn new(
        form_id: FormId,
        organization_id: OrganizationId,
        plugin_type: impl Into<String>,
        config: JsonValue,
    ) -> Self {
        Self {
            id: PluginConfigId::new(),
            form_id,
            organization_id,
            plugin_type: plugin_type.into(),
            config,
            enabled: true,
            trigger_events: BTreeSet::from([EventType::FormSubmitted]),
        }
    }

    pub fn with_triggers(mut self, triggers: impl IntoIterator<Item = EventType>) -> Self {
        self.trigger_events = triggers.into_iter().collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether this config should run for `event_type` on `form_id`.
    pub fn matches(&self, form_id: FormId, event_type: EventType) -> bool {
        self.enabled && self.form_id == form_id && self.trigger_events.contains(&event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn matches_requires_enabled_form_and_trigger() {
        let form = FormId::new();
        let cfg = PluginConfig::new(form, OrganizationId::new(), "webhook", json!({}))
            .with_triggers([EventType::FormSubmitted, EventType::ResponseUpdated]);

        assert!(cfg.matches(form, EventType::FormSubmitted));
        assert!(cfg.matches(form, EventType::ResponseUpdated));
        assert!(!cfg.matches(form, EventType::ResponseDeleted));
        assert!(!cfg.matches(FormId::new(), EventType::FormSubmitted));

        let off = cfg.disabled();
        assert!(!off.matches(form, EventType::FormSubmitted));
    }

    #[test]
    fn deserializes_camel_case_rows() {
        let row = json!({
            "id": PluginConfigId::new(),
            "formId": FormId::new(),
            "organizationId": OrganizationId::new(),
            "pluginType": "email",
            "config": {"recipientEmail": "ops@example.com"},
            "enabled": true,
            "triggerEvents": ["form.submitted"]
        });

        let cfg: PluginConfig = serde_json::from_value(row).unwrap();
        assert_eq!(cfg.plugin_type, "email");
        assert!(cfg.trigger_events.contains(&EventType::FormSubmitted));
    }
}
