//! Plugin job record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use formplug_core::{ErrorKind, EventType, FormId, JobId, OrganizationId, PluginConfig, PluginConfigId, PluginError};

/// Job execution status.
///
/// `Pending` → `Running` → `Completed` | `Pending` (retry) | `Failed`.
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Currently being executed
    Running,
    /// Handler returned successfully
    Completed,
    /// Non-retryable error or attempts exhausted
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStateError {
    #[error("job {job_id} is {status} and cannot change state")]
    Terminal { job_id: JobId, status: JobStatus },
    #[error("job {job_id} cannot go from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

/// What a failed attempt led to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `Pending`; another attempt is allowed.
    Retry,
    /// Moved to `Failed`.
    Terminal,
}

/// One execution of one plugin config for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub plugin_config_id: PluginConfigId,
    pub plugin_type: String,
    pub form_id: FormId,
    pub organization_id: OrganizationId,
    pub event_type: EventType,
    /// Payload of the triggering event
    pub payload: JsonValue,
    pub status: JobStatus,
    /// Failed executions so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    /// Start of the most recent attempt
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job for `config`.
    pub fn new(config: &PluginConfig, event_type: EventType, payload: JsonValue, max_attempts: u32) -> Self {
        Self {
            id: JobId::new(),
            plugin_config_id: config.id,
            plugin_type: config.plugin_type.clone(),
            form_id: config.form_id,
            organization_id: config.organization_id,
            event_type,
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
            error_kind: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 1-indexed number of the attempt currently running (or about to run).
    pub fn current_attempt(&self) -> u32 {
        self.attempts + 1
    }

    fn transition(&self, expected: JobStatus, to: JobStatus) -> Result<(), JobStateError> {
        if self.status.is_terminal() {
            return Err(JobStateError::Terminal {
                job_id: self.id,
                status: self.status,
            });
        }
        if self.status != expected {
            return Err(JobStateError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    /// Mark job as running.
    pub fn start(&mut self) -> Result<(), JobStateError> {
        self.transition(JobStatus::Pending, JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Mark job as completed.
    pub fn complete(&mut self) -> Result<(), JobStateError> {
        self.transition(JobStatus::Running, JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// Retryable errors requeue the job while attempts remain. Otherwise the
    /// job fails with the error's own kind, or `MaxRetriesExceeded` when a
    /// retryable error used up the last attempt.
    pub fn fail(&mut self, error: &PluginError) -> Result<FailureOutcome, JobStateError> {
        let retryable = error.is_retryable();
        let retry = retryable && self.attempts + 1 < self.max_attempts;
        let to = if retry { JobStatus::Pending } else { JobStatus::Failed };
        self.transition(JobStatus::Running, to)?;

        self.attempts += 1;
        self.last_error = Some(error.message.clone());

        if retry {
            self.status = JobStatus::Pending;
            self.error_kind = Some(error.kind);
            return Ok(FailureOutcome::Retry);
        }

        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_kind = Some(if retryable {
            ErrorKind::MaxRetriesExceeded
        } else {
            error.kind
        });
        Ok(FailureOutcome::Terminal)
    }
}
