use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use formplug_core::{EventType, FormId, JobId, OrganizationId, PluginConfigId, ResponseId};

/// An event carried on the bus.
///
/// Events are facts: immutable once built, never persisted, and shared by
/// every listener group that observes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    event_type: EventType,
    form_id: FormId,
    organization_id: OrganizationId,
    #[serde(default)]
    payload: JsonValue,
    /// Stamped on receipt when absent.
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        form_id: FormId,
        organization_id: OrganizationId,
        payload: JsonValue,
    ) -> Self {
        Self {
            event_type,
            form_id,
            organization_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// A form submission carrying the id of the new response.
    pub fn form_submitted(
        form_id: FormId,
        organization_id: OrganizationId,
        response_id: ResponseId,
    ) -> Self {
        Self::new(
            EventType::FormSubmitted,
            form_id,
            organization_id,
            json!({ "responseId": response_id }),
        )
    }

    /// Engine lifecycle notification for a plugin job.
    pub fn job_lifecycle(
        event_type: EventType,
        form_id: FormId,
        organization_id: OrganizationId,
        job_id: JobId,
        plugin_config_id: PluginConfigId,
        detail: JsonValue,
    ) -> Self {
        Self::new(
            event_type,
            form_id,
            organization_id,
            json!({
                "jobId": job_id,
                "pluginConfigId": plugin_config_id,
                "detail": detail,
            }),
        )
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn form_id(&self) -> FormId {
        self.form_id
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.organization_id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The response this event refers to, if the payload names one.
    pub fn response_id(&self) -> Option<ResponseId> {
        self.payload
            .get("responseId")
            .and_then(JsonValue::as_str)
            .and_then(|s| s.parse().ok())
    }
}
