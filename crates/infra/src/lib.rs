//! Infrastructure layer: job dispatch, worker isolation and the stores the
//! engine persists to.
//!
//! Storage is in-memory behind async traits ([`JobStore`], [`DeliveryLog`],
//! [`PluginConfigStore`]) so a database-backed implementation can slot in
//! without touching the dispatcher.

pub mod config_store;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod form_data;
pub mod jobs;
pub mod worker;

pub use config_store::{InMemoryConfigStore, PluginConfigStore};
pub use delivery::{DeliveryLog, DeliveryRecord, DeliveryStatus, InMemoryDeliveryLog};
pub use dispatcher::{
    DISPATCH_GROUP, DispatchError, DispatchReport, Dispatcher, DispatcherConfig, DispatcherDeps, JobOutcome,
};
pub use error::StoreError;
pub use form_data::InMemoryFormData;
pub use jobs::{FailureOutcome, InMemoryJobStore, Job, JobStateError, JobStats, JobStatus, JobStore};
pub use worker::{
    ResourceFactory, WorkOutcome, WorkRequest, WorkerError, WorkerPool, WorkerPoolConfig, WorkerResources,
};
