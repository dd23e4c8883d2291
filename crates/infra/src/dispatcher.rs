//! Plugin job dispatcher.
//!
//! Turns a form lifecycle event into plugin jobs and drives each job through
//! its state machine until it is terminal.
//!
//! ```text
//! Event
//!   ↓
//! 1. Load enabled configs for (form, event type)
//!   ↓
//! 2. Insert one pending job per config
//!   ↓
//! 3. Run every job concurrently, settle-all:
//!      pending → running → handler (inline or worker)
//!        ok  → completed + success record
//!        err → failed record; pending again (retryable, attempts left)
//!                               or failed (terminal)
//!   ↓
//! 4. DispatchReport
//! ```
//!
//! Handler failures never escape a job. Infrastructure failures (config store,
//! job store, delivery log) are not retried: a config read or job insert
//! failure fails the whole dispatch, a config read or write failure mid-job
//! aborts that job and shows up in the report.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use formplug_core::{ErrorKind, EventType, FormId, JobId, PluginConfigId, PluginError, RetryPolicy};
use formplug_events::{BusError, Event, EventBus, EventListener};
use formplug_plugins::{ExecutionMode, FormReader, PluginContext, PluginRegistry, ResponseReader};

use crate::config_store::PluginConfigStore;
use crate::delivery::{DeliveryLog, DeliveryRecord};
use crate::error::StoreError;
use crate::execution::{AttemptError, AttemptResult, invoke, load_handler, panic_message};
use crate::jobs::{FailureOutcome, Job, JobStateError, JobStatus, JobStore};
use crate::worker::{WorkRequest, WorkerPool};

/// Listener group the dispatcher subscribes under.
pub const DISPATCH_GROUP: &str = "plugin-dispatcher";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Job-level retry: attempts and backoff between them
    pub retry: RetryPolicy,
    /// Bound on one inline handler invocation
    pub handler_timeout: Duration,
    /// Bound on waiting for a worker reply
    pub reply_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            handler_timeout: Duration::from_secs(30),
            reply_timeout: Duration::from_secs(35),
        }
    }
}

/// Everything the dispatcher reads from or writes to.
#[derive(Clone)]
pub struct DispatcherDeps {
    pub registry: Arc<PluginRegistry>,
    pub configs: Arc<dyn PluginConfigStore>,
    pub jobs: Arc<dyn JobStore>,
    pub deliveries: Arc<dyn DeliveryLog>,
    pub responses: Arc<dyn ResponseReader>,
    pub forms: Arc<dyn FormReader>,
    /// Isolated handlers run here when set, inline otherwise.
    pub workers: Option<Arc<WorkerPool>>,
    /// Lifecycle notifications are published here when set.
    pub bus: Option<Arc<dyn EventBus>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to load plugin configs: {0}")]
    ConfigStore(StoreError),
    #[error("failed to create job: {0}")]
    JobCreation(StoreError),
}

/// Failure that aborts one job without a state transition being recorded.
#[derive(Debug, thiserror::Error)]
enum JobRunError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    State(#[from] JobStateError),
}

/// Final state of one job in a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub job_id: JobId,
    pub plugin_config_id: PluginConfigId,
    pub plugin_type: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub error_kind: Option<ErrorKind>,
    /// Set when a store write aborted the job.
    pub aborted: Option<String>,
}

impl JobOutcome {
    fn of(job: &Job, aborted: Option<String>) -> Self {
        Self {
            job_id: job.id,
            plugin_config_id: job.plugin_config_id,
            plugin_type: job.plugin_type.clone(),
            status: job.status,
            attempts: job.attempts,
            error_kind: job.error_kind,
            aborted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub event_type: EventType,
    pub form_id: FormId,
    pub jobs: Vec<JobOutcome>,
}

impl DispatchReport {
    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    pub fn aborted(&self) -> impl Iterator<Item = &JobOutcome> {
        self.jobs.iter().filter(|j| j.aborted.is_some())
    }
}

pub struct Dispatcher {
    deps: DispatcherDeps,
    config: DispatcherConfig,
    tracker: TaskTracker,
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("in_flight", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(deps: DispatcherDeps, config: DispatcherConfig) -> Self {
        Self {
            deps,
            config,
            tracker: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Dispatches spawned through the bus that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Subscribe to every form lifecycle event type on `bus`.
    pub fn subscribe(self: &Arc<Self>, bus: &dyn EventBus) -> Result<(), BusError> {
        let listener: Arc<dyn EventListener> = Arc::new(DispatchListener {
            dispatcher: self.clone(),
        });
        for event_type in EventType::FORM_LIFECYCLE {
            bus.subscribe(DISPATCH_GROUP, event_type, listener.clone())?;
        }
        Ok(())
    }

    /// Dispatch `event` on a tracked background task.
    ///
    /// Returns immediately. Dispatch errors are logged.
    pub fn spawn_dispatch(self: &Arc<Self>, event: Event) {
        if self.tracker.is_closed() {
            warn!(event_type = %event.event_type(), "dispatcher is shutting down; event ignored");
            return;
        }
        let this = self.clone();
        self.tracker.spawn(async move {
            match this.dispatch(&event).await {
                Ok(report) => debug!(
                    event_type = %report.event_type,
                    jobs = report.jobs.len(),
                    completed = report.count(JobStatus::Completed),
                    failed = report.count(JobStatus::Failed),
                    "dispatch finished"
                ),
                Err(e) => error!(event_type = %event.event_type(), form_id = %event.form_id(), error = %e, "dispatch failed"),
            }
        });
    }

    /// Wait for every spawned dispatch to finish. New dispatches are refused
    /// from here on.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        debug!("dispatcher drained");
    }

    /// Create and run every job `event` triggers.
    pub async fn dispatch(&self, event: &Event) -> Result<DispatchReport, DispatchError> {
        let span = info_span!("dispatch", event_type = %event.event_type(), form_id = %event.form_id());
        self.dispatch_inner(event).instrument(span).await
    }

    async fn dispatch_inner(&self, event: &Event) -> Result<DispatchReport, DispatchError> {
        let configs = self
            .deps
            .configs
            .list_enabled(event.form_id(), event.event_type())
            .await
            .map_err(DispatchError::ConfigStore)?;

        let mut jobs = Vec::with_capacity(configs.len());
        for config in &configs {
            let job = Job::new(
                config,
                event.event_type(),
                event.payload().clone(),
                self.config.retry.max_attempts,
            );
            self.deps
                .jobs
                .insert(&job)
                .await
                .map_err(DispatchError::JobCreation)?;
            self.publish_lifecycle(EventType::JobCreated, &job, json!({}));
            jobs.push(job);
        }

        if jobs.is_empty() {
            debug!("no plugin configs match");
        } else {
            info!(jobs = jobs.len(), "running plugin jobs");
        }

        let outcomes = join_all(jobs.into_iter().map(|job| self.run_job(job, event))).await;

        Ok(DispatchReport {
            event_type: event.event_type(),
            form_id: event.form_id(),
            jobs: outcomes,
        })
    }

    async fn run_job(&self, mut job: Job, event: &Event) -> JobOutcome {
        let span = info_span!(
            "job",
            job_id = %job.id,
            plugin_config_id = %job.plugin_config_id,
            plugin_type = %job.plugin_type,
            event_type = %event.event_type(),
        );
        match self.drive(&mut job, event).instrument(span.clone()).await {
            Ok(()) => JobOutcome::of(&job, None),
            Err(e) => {
                error!(parent: &span, error = %e, status = %job.status, "job aborted");
                JobOutcome::of(&job, Some(e.to_string()))
            }
        }
    }

    async fn drive(&self, job: &mut Job, event: &Event) -> Result<(), JobRunError> {
        loop {
            job.start()?;
            self.deps.jobs.update(job).await?;
            let attempt = job.current_attempt();
            self.publish_lifecycle(EventType::JobStarted, job, json!({ "attempt": attempt }));

            match self.execute_attempt(job, event, attempt).await {
                Err(AttemptError::Store(e)) => return Err(JobRunError::Store(e)),
                Ok(response) => {
                    job.complete()?;
                    self.deps
                        .deliveries
                        .append(DeliveryRecord::success(job, attempt, response))
                        .await?;
                    self.deps.jobs.update(job).await?;
                    info!(attempt, "job completed");
                    self.publish_lifecycle(EventType::JobCompleted, job, json!({ "attempts": attempt }));
                    return Ok(());
                }
                Err(AttemptError::Plugin(err)) => {
                    let outcome = job.fail(&err)?;
                    self.deps
                        .deliveries
                        .append(DeliveryRecord::failure(job, attempt, &err))
                        .await?;
                    self.deps.jobs.update(job).await?;

                    match outcome {
                        FailureOutcome::Retry => {
                            let delay = self.config.retry.delay_for_attempt(job.attempts);
                            warn!(
                                attempt,
                                error_kind = %err.kind,
                                error = %err.message,
                                delay_ms = delay.as_millis() as u64,
                                "job attempt failed; retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        FailureOutcome::Terminal => {
                            warn!(
                                attempt,
                                error_kind = ?job.error_kind,
                                error = %err.message,
                                "job failed"
                            );
                            self.publish_lifecycle(
                                EventType::JobFailed,
                                job,
                                json!({ "attempts": job.attempts, "errorKind": job.error_kind, "error": err.message }),
                            );
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn execute_attempt(&self, job: &Job, event: &Event, attempt: u32) -> AttemptResult<JsonValue> {
        let handler = self.deps.registry.get(&job.plugin_type).map_err(PluginError::from)?;

        match (handler.execution_mode(), &self.deps.workers) {
            (ExecutionMode::Isolated, Some(pool)) => {
                let request = WorkRequest {
                    job_id: job.id,
                    plugin_config_id: job.plugin_config_id,
                    attempt,
                    event: event.clone(),
                };
                pool.execute(&request, self.config.reply_timeout).await
            }
            _ => self.execute_inline(job, event).await,
        }
    }

    async fn execute_inline(&self, job: &Job, event: &Event) -> AttemptResult<JsonValue> {
        let (config, handler, settings) =
            load_handler(self.deps.configs.as_ref(), &self.deps.registry, job.plugin_config_id).await?;
        let ctx = PluginContext::new(
            job.id,
            config.id,
            &config.plugin_type,
            self.deps.responses.clone(),
            self.deps.forms.clone(),
        );

        let run = invoke(handler.as_ref(), &settings, event, &ctx, self.config.handler_timeout);
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => Ok(result?),
            Err(panic) => Err(PluginError::execution(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))
            .into()),
        }
    }

    fn publish_lifecycle(&self, event_type: EventType, job: &Job, detail: JsonValue) {
        let Some(bus) = &self.deps.bus else {
            return;
        };
        let event = Event::job_lifecycle(
            event_type,
            job.form_id,
            job.organization_id,
            job.id,
            job.plugin_config_id,
            detail,
        );
        if let Err(e) = bus.publish(event) {
            warn!(event_type = %event_type, error = %e, "lifecycle notification dropped");
        }
    }
}

/// Bus listener that hands each event to the dispatcher without waiting for
/// the jobs to finish.
struct DispatchListener {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait::async_trait]
impl EventListener for DispatchListener {
    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        self.dispatcher.spawn_dispatch(event.clone());
        Ok(())
    }
}
