use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable event type identifiers carried on the bus.
///
/// Form lifecycle types are produced by the product's mutation paths; the
/// `plugin.job.*` types are re-published by the dispatcher for observers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "form.submitted")]
    FormSubmitted,
    #[serde(rename = "form.updated")]
    FormUpdated,
    #[serde(rename = "response.updated")]
    ResponseUpdated,
    #[serde(rename = "response.deleted")]
    ResponseDeleted,
    #[serde(rename = "plugin.job.created")]
    JobCreated,
    #[serde(rename = "plugin.job.started")]
    JobStarted,
    #[serde(rename = "plugin.job.completed")]
    JobCompleted,
    #[serde(rename = "plugin.job.failed")]
    JobFailed,
}

impl EventType {
    /// Event types a plugin config may list as triggers.
    pub const FORM_LIFECYCLE: [EventType; 4] = [
        EventType::FormSubmitted,
        EventType::FormUpdated,
        EventType::ResponseUpdated,
        EventType::ResponseDeleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::FormSubmitted => "form.submitted",
            EventType::FormUpdated => "form.updated",
            EventType::ResponseUpdated => "response.updated",
            EventType::ResponseDeleted => "response.deleted",
            EventType::JobCreated => "plugin.job.created",
            EventType::JobStarted => "plugin.job.started",
            EventType::JobCompleted => "plugin.job.completed",
            EventType::JobFailed => "plugin.job.failed",
        }
    }

    pub fn is_form_lifecycle(self) -> bool {
        Self::FORM_LIFECYCLE.contains(&self)
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "form.submitted" => Ok(EventType::FormSubmitted),
            "form.updated" => Ok(EventType::FormUpdated),
            "response.updated" => Ok(EventType::ResponseUpdated),
            "response.deleted" => Ok(EventType::ResponseDeleted),
            "plugin.job.created" => Ok(EventType::JobCreated),
            "plugin.job.started" => Ok(EventType::JobStarted),
            "plugin.job.completed" => Ok(EventType::JobCompleted),
            "plugin.job.failed" => Ok(EventType::JobFailed),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_uses_dotted_names() {
        let json = serde_json::to_string(&EventType::ResponseDeleted).unwrap();
        assert_eq!(json, "\"response.deleted\"");

        let parsed: EventType = serde_json::from_str("\"plugin.job.failed\"").unwrap();
        assert_eq!(parsed, EventType::JobFailed);
    }

    #[test]
    fn from_str_matches_as_str() {
        for ty in EventType::FORM_LIFECYCLE {
            assert_eq!(ty.as_str().parse::<EventType>().unwrap(), ty);
        }
        assert!("form.deleted".parse::<EventType>().is_err());
    }

    #[test]
    fn lifecycle_classification() {
        assert!(EventType::FormSubmitted.is_form_lifecycle());
        assert!(!EventType::JobCompleted.is_form_lifecycle());
    }
}
