use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use formplug_core::PluginResult;
use formplug_events::Event;

use crate::context::PluginContext;
use crate::settings::{PluginSettings, ValidationError};

/// Where a handler's code runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// On the dispatcher's runtime. For short, deterministic work.
    Inline,
    /// On a worker thread behind the isolation boundary. For network calls
    /// and third-party SDKs with unpredictable latency.
    Isolated,
}

/// Descriptive data for listing installed plugin types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    pub plugin_type: String,
    pub name: String,
    pub description: String,
    pub execution_mode: ExecutionMode,
}

/// Turns a raw stored config into typed settings.
pub type ConfigValidator = fn(&JsonValue) -> Result<PluginSettings, ValidationError>;

/// The behaviour of one plugin type.
///
/// A handler is a function of (settings, event, context) to a result. It must
/// not reach for global state: everything it reads comes through the
/// [`PluginContext`], everything it needs to write is injected when the
/// handler is built.
#[async_trait]
pub trait PluginHandler: Send + Sync {
    fn metadata(&self) -> PluginMetadata;

    fn execution_mode(&self) -> ExecutionMode {
        self.metadata().execution_mode
    }

    /// Run the plugin once. The returned value is recorded as the delivery
    /// response.
    async fn execute(
        &self,
        settings: &PluginSettings,
        event: &Event,
        ctx: &PluginContext,
    ) -> PluginResult<JsonValue>;
}
