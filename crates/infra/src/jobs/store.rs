//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;

use formplug_core::{JobId, OrganizationId, PluginConfigId};

use super::types::{Job, JobStatus};
use crate::error::StoreError;

/// Job store abstraction.
///
/// Jobs are never deleted. `update` refuses to overwrite a job that is
/// already terminal in the store.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    async fn update(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Jobs for one plugin config, oldest first.
    async fn list_for_config(&self, plugin_config_id: PluginConfigId, limit: usize) -> Result<Vec<Job>, StoreError>;

    async fn stats(&self, organization_id: OrganizationId) -> Result<JobStats, StoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        (**self).insert(job).await
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        (**self).update(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(job_id).await
    }

    async fn list_for_config(&self, plugin_config_id: PluginConfigId, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).list_for_config(plugin_config_id, limit).await
    }

    async fn stats(&self, organization_id: OrganizationId) -> Result<JobStats, StoreError> {
        (**self).stats(organization_id).await
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Every stored job, oldest first.
    pub fn all(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read()?;
        let mut all: Vec<_> = jobs.values().cloned().collect();
        all.sort_by_key(|j| (j.created_at, j.id));
        Ok(all)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write()?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id.to_string()));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write()?;
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::NotFound(job.id.to_string()))?;
        if stored.status.is_terminal() {
            return Err(StoreError::TerminalJob(job.id));
        }
        *stored = job.clone();
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read()?.get(&job_id).cloned())
    }

    async fn list_for_config(&self, plugin_config_id: PluginConfigId, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.plugin_config_id == plugin_config_id)
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self, organization_id: OrganizationId) -> Result<JobStats, StoreError> {
        let jobs = self.jobs.read()?;
        let mut stats = JobStats::default();

        for job in jobs.values().filter(|j| j.organization_id == organization_id) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formplug_core::{EventType, FormId, PluginConfig};
    use serde_json::json;

    fn config(org: OrganizationId) -> PluginConfig {
        PluginConfig::new(FormId::new(), org, "webhook", json!({}))
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = InMemoryJobStore::new();
        let job = Job::new(&config(OrganizationId::new()), EventType::FormSubmitted, json!({}), 3);

        store.insert(&job).await.unwrap();
        assert_eq!(store.get(job.id).await.unwrap(), Some(job.clone()));
        assert!(matches!(store.insert(&job).await, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn terminal_jobs_are_frozen() {
        let store = InMemoryJobStore::new();
        let mut job = Job::new(&config(OrganizationId::new()), EventType::FormSubmitted, json!({}), 3);
        store.insert(&job).await.unwrap();

        job.start().unwrap();
        store.update(&job).await.unwrap();
        job.complete().unwrap();
        store.update(&job).await.unwrap();

        let mut stale = job.clone();
        stale.status = JobStatus::Running;
        assert_eq!(store.update(&stale).await, Err(StoreError::TerminalJob(job.id)));
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn update_of_unknown_job_fails() {
        let store = InMemoryJobStore::new();
        let job = Job::new(&config(OrganizationId::new()), EventType::FormSubmitted, json!({}), 3);
        assert!(matches!(store.update(&job).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_and_stats_are_scoped() {
        let store = InMemoryJobStore::new();
        let org = OrganizationId::new();
        let cfg = config(org);

        for _ in 0..3 {
            store
                .insert(&Job::new(&cfg, EventType::FormSubmitted, json!({}), 3))
                .await
                .unwrap();
        }
        store
            .insert(&Job::new(&config(OrganizationId::new()), EventType::FormSubmitted, json!({}), 3))
            .await
            .unwrap();

        let listed = store.list_for_config(cfg.id, 2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].created_at <= listed[1].created_at);

        let mut running = listed[0].clone();
        running.start().unwrap();
        store.update(&running).await.unwrap();

        let stats = store.stats(org).await.unwrap();
        assert_eq!(stats, JobStats { pending: 2, running: 1, completed: 0, failed: 0 });
    }
}
