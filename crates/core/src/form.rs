//! Read-only views of forms and responses owned by the product's data store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::id::{FormId, OrganizationId, ResponseId};

/// Form metadata handlers may need (subject lines, webhook context).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormMeta {
    pub id: FormId,
    pub organization_id: OrganizationId,
    pub title: String,
}

/// A submitted response: field id → submitted value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: ResponseId,
    pub form_id: FormId,
    #[serde(default)]
    pub data: Map<String, JsonValue>,
    pub submitted_at: DateTime<Utc>,
}

impl Response {
    pub fn field(&self, field_id: &str) -> Option<&JsonValue> {
        self.data.get(field_id)
    }

    /// Field value rendered as plain text (strings unquoted, arrays joined).
    pub fn field_text(&self, field_id: &str) -> Option<String> {
        self.field(field_id).map(value_to_text)
    }
}

pub fn value_to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(items) => items
            .iter()
            .map(value_to_text)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}
