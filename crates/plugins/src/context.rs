//! Capabilities handed to a handler for one job.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::Span;

use formplug_core::{FormId, FormMeta, JobId, PluginConfigId, PluginError, PluginResult, Response, ResponseId};

/// A read or write against the product's data store failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("data access failed: {0}")]
pub struct DataAccessError(pub String);

impl From<DataAccessError> for PluginError {
    fn from(err: DataAccessError) -> Self {
        PluginError::execution(err.to_string())
    }
}

/// Read access to submitted responses.
#[async_trait]
pub trait ResponseReader: Send + Sync {
    async fn get_by_id(&self, id: ResponseId) -> Result<Option<Response>, DataAccessError>;
}

/// Read access to form metadata.
#[async_trait]
pub trait FormReader: Send + Sync {
    async fn get_by_id(&self, id: FormId) -> Result<Option<FormMeta>, DataAccessError>;
}

/// Structured logger bound to one job.
///
/// Every line carries `job_id`, `plugin_config_id` and `plugin_type`.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    span: Span,
}

impl PluginLogger {
    pub fn new(job_id: JobId, plugin_config_id: PluginConfigId, plugin_type: &str) -> Self {
        Self {
            span: tracing::info_span!(
                "plugin",
                job_id = %job_id,
                plugin_config_id = %plugin_config_id,
                plugin_type = %plugin_type,
            ),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(parent: &self.span, "{message}");
    }

    pub fn info(&self, message: &str) {
        tracing::info!(parent: &self.span, "{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(parent: &self.span, "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(parent: &self.span, "{message}");
    }
}

/// Scoped data access and logging for a single handler invocation.
///
/// Exposes a response by id, form metadata by id and a logger, nothing else.
/// Tests build one from in-memory fakes.
#[derive(Clone)]
pub struct PluginContext {
    job_id: JobId,
    plugin_config_id: PluginConfigId,
    responses: Arc<dyn ResponseReader>,
    forms: Arc<dyn FormReader>,
    logger: PluginLogger,
}

impl core::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PluginContext")
            .field("job_id", &self.job_id)
            .field("plugin_config_id", &self.plugin_config_id)
            .finish_non_exhaustive()
    }
}

impl PluginContext {
    pub fn new(
        job_id: JobId,
        plugin_config_id: PluginConfigId,
        plugin_type: &str,
        responses: Arc<dyn ResponseReader>,
        forms: Arc<dyn FormReader>,
    ) -> Self {
        Self {
            job_id,
            plugin_config_id,
            responses,
            forms,
            logger: PluginLogger::new(job_id, plugin_config_id, plugin_type),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn plugin_config_id(&self) -> PluginConfigId {
        self.plugin_config_id
    }

    pub async fn response(&self, id: ResponseId) -> PluginResult<Option<Response>> {
        Ok(self.responses.get_by_id(id).await?)
    }

    pub async fn form(&self, id: FormId) -> PluginResult<Option<FormMeta>> {
        Ok(self.forms.get_by_id(id).await?)
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }
}
