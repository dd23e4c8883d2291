//! Worker isolation boundary.
//!
//! Isolated handlers run on a pool of dedicated OS threads. Each thread owns a
//! current-thread tokio runtime and its own resource handles, built from a
//! factory when the thread starts. The dispatcher talks to the pool only by
//! message passing: a serialized [`WorkRequest`] goes out over an MPMC
//! channel, a [`WorkOutcome`] comes back on a one-shot reply channel.
//!
//! A config store failure inside a worker comes back as
//! [`WorkOutcome::Aborted`] and is not retried.
//!
//! A handler that panics takes its worker thread down with it. The reply
//! sender is dropped during unwinding, which the caller observes as
//! `WorkerCrashed`; the supervisor thread then starts a replacement.
//!
//! A worker that misses its reply deadline (a handler blocking the thread)
//! is also reported as `WorkerCrashed`. The supervisor starts an extra
//! worker in its place; when the late worker finally finishes and finds its
//! caller gone, it retires so the pool returns to its configured size.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use formplug_core::{JobId, PluginConfigId, PluginError};
use formplug_events::Event;
use formplug_plugins::{FormReader, PluginContext, PluginRegistry, ResponseReader};

use crate::config_store::PluginConfigStore;
use crate::error::StoreError;
use crate::execution::{AttemptError, AttemptResult, invoke, load_handler};

const RESPAWN_DELAY: Duration = Duration::from_millis(100);

/// One unit of work sent across the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    pub job_id: JobId,
    pub plugin_config_id: PluginConfigId,
    pub attempt: u32,
    pub event: Event,
}

/// What a worker reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkOutcome {
    Completed { result: JsonValue },
    Failed { error: PluginError },
    /// The worker could not read the config store.
    Aborted { reason: String },
}

impl From<AttemptResult<JsonValue>> for WorkOutcome {
    fn from(result: AttemptResult<JsonValue>) -> Self {
        match result {
            Ok(result) => WorkOutcome::Completed { result },
            Err(AttemptError::Plugin(error)) => WorkOutcome::Failed { error },
            Err(AttemptError::Store(e)) => WorkOutcome::Aborted { reason: e.to_string() },
        }
    }
}

impl From<WorkOutcome> for AttemptResult<JsonValue> {
    fn from(outcome: WorkOutcome) -> Self {
        match outcome {
            WorkOutcome::Completed { result } => Ok(result),
            WorkOutcome::Failed { error } => Err(error.into()),
            WorkOutcome::Aborted { reason } => Err(StoreError::Storage(reason).into()),
        }
    }
}

/// Handles a worker thread owns.
#[derive(Clone)]
pub struct WorkerResources {
    pub configs: Arc<dyn PluginConfigStore>,
    pub registry: Arc<PluginRegistry>,
    pub responses: Arc<dyn ResponseReader>,
    pub forms: Arc<dyn FormReader>,
}

/// Builds a fresh set of resources for each worker thread.
pub type ResourceFactory = Arc<dyn Fn() -> anyhow::Result<WorkerResources> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker pool needs at least one thread")]
    NoThreads,
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub name: String,
    pub threads: usize,
    /// Bound on one handler invocation inside a worker
    pub handler_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "plugin-worker".to_string(),
            threads: 4,
            handler_timeout: Duration::from_secs(30),
        }
    }
}

struct Envelope {
    request: Vec<u8>,
    reply: oneshot::Sender<WorkOutcome>,
}

enum Notice {
    Exited { index: usize, panicked: bool, retired: bool },
    Stalled,
    Shutdown,
}

#[derive(Default)]
struct PoolState {
    shutting_down: AtomicBool,
    live: AtomicUsize,
    crashes: AtomicU64,
    stalls: AtomicU64,
    /// Workers started to replace stalled ones and not yet retired.
    excess: AtomicUsize,
    next_index: AtomicUsize,
}

impl PoolState {
    fn take_excess(&self) -> bool {
        self.excess
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Sends an exit notice when a worker thread ends, including by panic.
struct ExitGuard {
    index: usize,
    retired: bool,
    notices: mpsc::Sender<Notice>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.notices.send(Notice::Exited {
            index: self.index,
            panicked: thread::panicking(),
            retired: self.retired,
        });
    }
}

/// Pool of isolated worker threads with a supervisor.
pub struct WorkerPool {
    tx: Mutex<Option<flume::Sender<Envelope>>>,
    notices: mpsc::Sender<Notice>,
    supervisor: Mutex<Option<thread::JoinHandle<()>>>,
    state: Arc<PoolState>,
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("live", &self.state.live.load(Ordering::SeqCst))
            .field("crashes", &self.state.crashes.load(Ordering::SeqCst))
            .finish()
    }
}

#[derive(Clone)]
struct Spawner {
    config: WorkerPoolConfig,
    factory: ResourceFactory,
    rx: flume::Receiver<Envelope>,
    notices: mpsc::Sender<Notice>,
    state: Arc<PoolState>,
}

impl Spawner {
    fn spawn(&self, index: usize) -> std::io::Result<()> {
        let this = self.clone();
        self.state.live.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("{}-{index}", self.config.name))
            .spawn(move || this.run(index));
        if let Err(e) = spawned {
            self.state.live.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    fn run(self, index: usize) {
        let mut guard = ExitGuard {
            index,
            retired: false,
            notices: self.notices.clone(),
        };

        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                error!(worker = index, error = %e, "failed to build worker runtime");
                return;
            }
        };
        let resources = match (self.factory)() {
            Ok(r) => r,
            Err(e) => {
                error!(worker = index, error = %e, "failed to build worker resources");
                return;
            }
        };

        debug!(worker = index, "worker started");
        while let Ok(envelope) = self.rx.recv() {
            let outcome = runtime.block_on(process(&resources, &envelope.request, self.config.handler_timeout));
            if envelope.reply.send(outcome).is_err() {
                debug!(worker = index, "caller stopped waiting; reply discarded");
                if self.state.take_excess() {
                    debug!(worker = index, "worker retired; a replacement took its place");
                    guard.retired = true;
                    break;
                }
            }
        }
        debug!(worker = index, "worker stopped");
    }
}

async fn process(resources: &WorkerResources, body: &[u8], timeout: Duration) -> WorkOutcome {
    let request: WorkRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            return WorkOutcome::Failed {
                error: PluginError::execution(format!("malformed work request: {e}")),
            };
        }
    };

    let result: AttemptResult<JsonValue> = async {
        let (config, handler, settings) =
            load_handler(resources.configs.as_ref(), &resources.registry, request.plugin_config_id).await?;
        let ctx = PluginContext::new(
            request.job_id,
            config.id,
            &config.plugin_type,
            resources.responses.clone(),
            resources.forms.clone(),
        );
        Ok(invoke(handler.as_ref(), &settings, &request.event, &ctx, timeout).await?)
    }
    .await;

    result.into()
}

fn supervise(spawner: Spawner, notices: mpsc::Receiver<Notice>) {
    let state = spawner.state.clone();
    while let Ok(notice) = notices.recv() {
        match notice {
            Notice::Exited { index, panicked, retired } => {
                state.live.fetch_sub(1, Ordering::SeqCst);
                if panicked {
                    state.crashes.fetch_add(1, Ordering::SeqCst);
                    warn!(worker = index, "worker thread crashed");
                }
                if state.shutting_down.load(Ordering::SeqCst) {
                    if state.live.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                    continue;
                }
                if retired {
                    continue;
                }
                if !panicked {
                    // Exited on its own: resource setup failed. Avoid a hot loop.
                    thread::sleep(RESPAWN_DELAY);
                }
                if let Err(e) = spawner.spawn(index) {
                    error!(worker = index, error = %e, "failed to respawn worker");
                }
            }
            Notice::Stalled => {
                if state.shutting_down.load(Ordering::SeqCst) {
                    continue;
                }
                let index = state.next_index.fetch_add(1, Ordering::SeqCst);
                warn!(worker = index, "worker missed its reply deadline; starting a replacement");
                if let Err(e) = spawner.spawn(index) {
                    state.take_excess();
                    error!(worker = index, error = %e, "failed to start replacement worker");
                }
            }
            Notice::Shutdown => {
                if state.live.load(Ordering::SeqCst) == 0 {
                    break;
                }
            }
        }
    }
    info!(pool = %spawner.config.name, "worker pool stopped");
}

impl WorkerPool {
    /// Spawn `config.threads` workers and their supervisor.
    pub fn start(config: WorkerPoolConfig, factory: ResourceFactory) -> Result<Self, WorkerError> {
        if config.threads == 0 {
            return Err(WorkerError::NoThreads);
        }

        let (tx, rx) = flume::unbounded();
        let (notice_tx, notice_rx) = mpsc::channel();
        let state = Arc::new(PoolState {
            next_index: AtomicUsize::new(config.threads),
            ..PoolState::default()
        });
        let spawner = Spawner {
            config: config.clone(),
            factory,
            rx,
            notices: notice_tx.clone(),
            state: state.clone(),
        };

        for index in 0..config.threads {
            spawner.spawn(index)?;
        }
        let supervisor = thread::Builder::new()
            .name(format!("{}-supervisor", config.name))
            .spawn(move || supervise(spawner, notice_rx))?;

        info!(pool = %config.name, threads = config.threads, "worker pool started");
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            notices: notice_tx,
            supervisor: Mutex::new(Some(supervisor)),
            state,
        })
    }

    /// Run `request` on a worker and wait up to `reply_timeout` for the result.
    pub async fn execute(&self, request: &WorkRequest, reply_timeout: Duration) -> AttemptResult<JsonValue> {
        let body = serde_json::to_vec(request)
            .map_err(|e| PluginError::execution(format!("failed to encode work request: {e}")))?;
        let sender = self
            .tx
            .lock()
            .ok()
            .and_then(|tx| tx.clone())
            .ok_or_else(|| PluginError::worker_crashed("worker pool is shut down"))?;

        let (reply, mut rx) = oneshot::channel();
        sender
            .send_async(Envelope { request: body, reply })
            .await
            .map_err(|_| PluginError::worker_crashed("worker pool is shut down"))?;

        match tokio::time::timeout(reply_timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome.into(),
            Ok(Err(_)) => Err(PluginError::worker_crashed("worker exited without replying").into()),
            Err(_) => {
                // Counted before the reply receiver drops, so the late worker
                // sees the excess when its send fails.
                self.state.stalls.fetch_add(1, Ordering::SeqCst);
                self.state.excess.fetch_add(1, Ordering::SeqCst);
                let _ = self.notices.send(Notice::Stalled);
                Err(PluginError::worker_crashed(format!(
                    "no reply from worker within {}ms",
                    reply_timeout.as_millis()
                ))
                .into())
            }
        }
    }

    /// Worker threads that died by panic since start.
    pub fn crashes(&self) -> u64 {
        self.state.crashes.load(Ordering::SeqCst)
    }

    /// Reply deadlines missed since start. Each one started a replacement.
    pub fn stalls(&self) -> u64 {
        self.state.stalls.load(Ordering::SeqCst)
    }

    pub fn live_workers(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Stop accepting work, let workers finish queued requests, and join the
    /// supervisor.
    pub async fn shutdown(&self) {
        self.state.shutting_down.store(true, Ordering::SeqCst);
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let _ = self.notices.send(Notice::Shutdown);

        let handle = self.supervisor.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if tokio::task::spawn_blocking(move || handle.join()).await.is_err() {
                warn!("worker supervisor did not stop cleanly");
            }
        }
    }
}
