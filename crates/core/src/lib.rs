//! `formplug-core`: shared building blocks for the plugin engine.
//!
//! Identifiers, the error taxonomy, retry policies and the read-only records
//! the engine consumes from the surrounding product (forms, responses,
//! plugin configurations). No I/O lives here.

pub mod error;
pub mod event_type;
pub mod form;
pub mod id;
pub mod plugin_config;
pub mod retry;

pub use error::{ErrorKind, InvalidId, PluginError, PluginResult};
pub use event_type::EventType;
pub use form::{FormMeta, Response};
pub use id::{DeliveryId, FormId, JobId, OrganizationId, PluginConfigId, ResponseId};
pub use plugin_config::PluginConfig;
pub use retry::{BackoffStrategy, RetryPolicy};
