//! Append-only audit trail of plugin execution attempts.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use formplug_core::{DeliveryId, ErrorKind, EventType, JobId, PluginConfigId, PluginError};

use crate::error::StoreError;
use crate::jobs::Job;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Success,
    Failed,
}

/// One execution attempt of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub id: DeliveryId,
    pub job_id: JobId,
    pub plugin_id: PluginConfigId,
    pub plugin_type: String,
    pub event_type: EventType,
    pub attempt: u32,
    pub status: DeliveryStatus,
    pub payload: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryRecord {
    fn base(job: &Job, attempt: u32, status: DeliveryStatus) -> Self {
        Self {
            id: DeliveryId::new(),
            job_id: job.id,
            plugin_id: job.plugin_config_id,
            plugin_type: job.plugin_type.clone(),
            event_type: job.event_type,
            attempt,
            status,
            payload: job.payload.clone(),
            response: None,
            error_message: None,
            error_kind: None,
            delivered_at: Utc::now(),
        }
    }

    pub fn success(job: &Job, attempt: u32, response: JsonValue) -> Self {
        Self {
            response: Some(response),
            ..Self::base(job, attempt, DeliveryStatus::Success)
        }
    }

    pub fn failure(job: &Job, attempt: u32, error: &PluginError) -> Self {
        Self {
            error_message: Some(error.message.clone()),
            error_kind: Some(error.kind),
            ..Self::base(job, attempt, DeliveryStatus::Failed)
        }
    }
}

/// Delivery record persistence. Records are never updated or removed.
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    async fn append(&self, record: DeliveryRecord) -> Result<(), StoreError>;

    /// Records for one job in attempt order.
    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<DeliveryRecord>, StoreError>;

    /// Most recent records for a plugin config, newest first.
    async fn list_for_plugin(&self, plugin_id: PluginConfigId, limit: usize) -> Result<Vec<DeliveryRecord>, StoreError>;
}

#[async_trait]
impl<L> DeliveryLog for Arc<L>
where
    L: DeliveryLog + ?Sized,
{
    async fn append(&self, record: DeliveryRecord) -> Result<(), StoreError> {
        (**self).append(record).await
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<DeliveryRecord>, StoreError> {
        (**self).list_for_job(job_id).await
    }

    async fn list_for_plugin(&self, plugin_id: PluginConfigId, limit: usize) -> Result<Vec<DeliveryRecord>, StoreError> {
        (**self).list_for_plugin(plugin_id, limit).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDeliveryLog {
    records: RwLock<Vec<DeliveryRecord>>,
}

impl InMemoryDeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Every record in append order.
    pub fn all(&self) -> Result<Vec<DeliveryRecord>, StoreError> {
        Ok(self.records.read()?.clone())
    }
}

#[async_trait]
impl DeliveryLog for InMemoryDeliveryLog {
    async fn append(&self, record: DeliveryRecord) -> Result<(), StoreError> {
        let mut records = self.records.write()?;
        let last_attempt = records
            .iter()
            .filter(|r| r.job_id == record.job_id)
            .map(|r| r.attempt)
            .max();
        if last_attempt.is_some_and(|a| a >= record.attempt) {
            return Err(StoreError::Rejected(format!(
                "attempt {} for job {} is out of order",
                record.attempt, record.job_id
            )));
        }
        records.push(record);
        Ok(())
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<DeliveryRecord>, StoreError> {
        Ok(self
            .records
            .read()?
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_for_plugin(&self, plugin_id: PluginConfigId, limit: usize) -> Result<Vec<DeliveryRecord>, StoreError> {
        Ok(self
            .records
            .read()?
            .iter()
            .rev()
            .filter(|r| r.plugin_id == plugin_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formplug_core::{FormId, OrganizationId, PluginConfig};
    use serde_json::json;

    fn job() -> Job {
        let cfg = PluginConfig::new(FormId::new(), OrganizationId::new(), "webhook", json!({}));
        Job::new(&cfg, EventType::FormSubmitted, json!({"responseId": "r1"}), 3)
    }

    #[tokio::test]
    async fn records_keep_attempt_order() {
        let log = InMemoryDeliveryLog::new();
        let job = job();

        log.append(DeliveryRecord::failure(&job, 1, &PluginError::execution("503")))
            .await
            .unwrap();
        log.append(DeliveryRecord::success(&job, 2, json!({"status": 200})))
            .await
            .unwrap();

        let records = log.list_for_job(job.id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, DeliveryStatus::Failed);
        assert_eq!(records[0].error_kind, Some(ErrorKind::HandlerExecutionError));
        assert_eq!(records[1].attempt, 2);
        assert_eq!(records[1].payload, json!({"responseId": "r1"}));
    }

    #[tokio::test]
    async fn out_of_order_attempts_are_rejected() {
        let log = InMemoryDeliveryLog::new();
        let job = job();

        log.append(DeliveryRecord::success(&job, 2, json!(null))).await.unwrap();
        let err = log
            .append(DeliveryRecord::failure(&job, 1, &PluginError::execution("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn list_for_plugin_is_newest_first() {
        let log = InMemoryDeliveryLog::new();
        let first = job();
        let mut second = job();
        second.plugin_config_id = first.plugin_config_id;

        log.append(DeliveryRecord::success(&first, 1, json!("a"))).await.unwrap();
        log.append(DeliveryRecord::success(&second, 1, json!("b"))).await.unwrap();

        let records = log.list_for_plugin(first.plugin_config_id, 10).await.unwrap();
        assert_eq!(records[0].response, Some(json!("b")));
        assert_eq!(records[1].response, Some(json!("a")));
        assert_eq!(log.list_for_plugin(first.plugin_config_id, 1).await.unwrap().len(), 1);
    }

    #[test]
    fn failure_record_serializes_error_fields() {
        let record = DeliveryRecord::failure(&job(), 1, &PluginError::delivery_timeout("slow"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["errorKind"], "DELIVERY_TIMEOUT");
        assert!(json.get("response").is_none());
    }
}
