//! Engine bootstrap.
//!
//! ```text
//! publish(event) → InMemoryEventBus ──group "plugin-dispatcher"──→ Dispatcher
//!                                                                    │
//!                        inline handlers ←───────────────────────────┤
//!                        WorkerPool (isolated handlers) ←────────────┘
//! ```
//!
//! Shutdown order:
//!
//! 1. refuse new events from `publish`
//! 2. flush the bus so queued form events reach the dispatcher
//! 3. wait for running jobs; their lifecycle notifications still go out
//! 4. close and drain the bus
//! 5. stop the worker pool

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use formplug_events::{BusError, Event, EventBus, InMemoryEventBus};
use formplug_infra::{
    Dispatcher, DispatcherDeps, InMemoryConfigStore, InMemoryDeliveryLog, InMemoryFormData, InMemoryJobStore,
    ResourceFactory, WorkerError, WorkerPool, WorkerResources,
};
use formplug_plugins::{
    BuiltinDeps, HttpMailer, LogMailer, Mailer, PluginRegistry, RegistryError, register_builtins,
};

use crate::config::{ConfigError, EngineConfig};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to register plugins: {0}")]
    Registry(#[from] RegistryError),
    #[error("failed to start worker pool: {0}")]
    Worker(#[from] WorkerError),
    #[error("failed to subscribe dispatcher: {0}")]
    Bus(#[from] BusError),
}

/// Everything needed to build a plugin registry. Workers build their own
/// from the same parts so no HTTP client is shared across runtimes.
#[derive(Clone)]
struct RegistryParts {
    config: EngineConfig,
    mailer: Option<Arc<dyn Mailer>>,
    data: Arc<InMemoryFormData>,
}

impl RegistryParts {
    fn build(&self) -> Result<PluginRegistry, EngineError> {
        let http = reqwest::Client::builder().build()?;
        let mailer: Arc<dyn Mailer> = match (&self.mailer, &self.config.mail_endpoint, &self.config.mail_api_key) {
            (Some(mailer), _, _) => mailer.clone(),
            (None, Some(endpoint), Some(key)) => Arc::new(HttpMailer::new(
                http.clone(),
                endpoint.clone(),
                key.clone(),
                self.config.mail_from.clone(),
            )),
            _ => Arc::new(LogMailer),
        };

        let mut registry = PluginRegistry::new();
        register_builtins(
            &mut registry,
            BuiltinDeps {
                http,
                delivery: self.config.delivery_policy(),
                mailer,
                metadata: self.data.clone(),
            },
        )?;
        Ok(registry)
    }
}

/// A running engine over in-memory stores.
pub struct Engine {
    accepting: AtomicBool,
    bus: Arc<InMemoryEventBus>,
    dispatcher: Arc<Dispatcher>,
    workers: Option<Arc<WorkerPool>>,
    registry: Arc<PluginRegistry>,
    configs: Arc<InMemoryConfigStore>,
    jobs: Arc<InMemoryJobStore>,
    deliveries: Arc<InMemoryDeliveryLog>,
    data: Arc<InMemoryFormData>,
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("workers", &self.workers)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Start with the mailer chosen by `config`.
    pub fn start(config: EngineConfig) -> Result<Self, EngineError> {
        Self::start_with(config, None)
    }

    /// Start with an explicit mailer, overriding the configured one.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start_with(config: EngineConfig, mailer: Option<Arc<dyn Mailer>>) -> Result<Self, EngineError> {
        config.validate()?;

        let data = InMemoryFormData::arc();
        let parts = RegistryParts {
            config: config.clone(),
            mailer,
            data: data.clone(),
        };
        let registry = Arc::new(parts.build()?);
        let configs = Arc::new(InMemoryConfigStore::with_registry(registry.clone()));
        let jobs = InMemoryJobStore::arc();
        let deliveries = InMemoryDeliveryLog::arc();

        let workers = if config.worker_threads > 0 {
            let factory_configs = configs.clone();
            let factory: ResourceFactory = Arc::new(move || {
                Ok(WorkerResources {
                    configs: factory_configs.clone(),
                    registry: Arc::new(parts.build()?),
                    responses: parts.data.clone(),
                    forms: parts.data.clone(),
                })
            });
            Some(Arc::new(WorkerPool::start(config.worker_pool_config(), factory)?))
        } else {
            None
        };

        let bus = InMemoryEventBus::arc();
        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherDeps {
                registry: registry.clone(),
                configs: configs.clone(),
                jobs: jobs.clone(),
                deliveries: deliveries.clone(),
                responses: data.clone(),
                forms: data.clone(),
                workers: workers.clone(),
                bus: Some(bus.clone()),
            },
            config.dispatcher_config(),
        ));
        dispatcher.subscribe(bus.as_ref())?;

        info!(
            plugin_types = registry.len(),
            worker_threads = config.worker_threads,
            max_attempts = config.max_attempts,
            "engine started"
        );

        Ok(Self {
            accepting: AtomicBool::new(true),
            bus,
            dispatcher,
            workers,
            registry,
            configs,
            jobs,
            deliveries,
            data,
        })
    }

    /// Hand an event to the bus. Returns once it is queued.
    ///
    /// Fails with [`BusError::Closed`] once shutdown has begun.
    pub fn publish(&self, event: Event) -> Result<(), BusError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        self.bus.publish(event)
    }

    pub fn bus(&self) -> &Arc<InMemoryEventBus> {
        &self.bus
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn configs(&self) -> &InMemoryConfigStore {
        &self.configs
    }

    pub fn jobs(&self) -> &InMemoryJobStore {
        &self.jobs
    }

    pub fn deliveries(&self) -> &InMemoryDeliveryLog {
        &self.deliveries
    }

    pub fn form_data(&self) -> &InMemoryFormData {
        &self.data
    }

    /// Drain queued events, wait for every job to finish, deliver the
    /// remaining notifications, stop the workers.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        self.bus.flush().await;
        self.dispatcher.shutdown().await;
        self.bus.shutdown().await;
        if let Some(workers) = &self.workers {
            workers.shutdown().await;
        }
        info!("engine stopped");
    }
}
