//! Plugin execution error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used by handlers and the execution path.
pub type PluginResult<T> = Result<T, PluginError>;

/// Classification of a plugin execution failure.
///
/// The kind decides whether the job state machine may retry: a malformed
/// config or an unknown plugin type will not fix itself between attempts,
/// a flaky network call might.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ConfigNotFound,
    PluginDisabled,
    HandlerNotRegistered,
    ValidationError,
    HandlerExecutionError,
    WorkerCrashed,
    DeliveryTimeout,
    HandlerTimeout,
    /// Terminal marker set on a job once every attempt has been used.
    MaxRetriesExceeded,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::HandlerExecutionError
                | ErrorKind::WorkerCrashed
                | ErrorKind::DeliveryTimeout
                | ErrorKind::HandlerTimeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConfigNotFound => "CONFIG_NOT_FOUND",
            ErrorKind::PluginDisabled => "PLUGIN_DISABLED",
            ErrorKind::HandlerNotRegistered => "HANDLER_NOT_REGISTERED",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::HandlerExecutionError => "HANDLER_EXECUTION_ERROR",
            ErrorKind::WorkerCrashed => "WORKER_CRASHED",
            ErrorKind::DeliveryTimeout => "DELIVERY_TIMEOUT",
            ErrorKind::HandlerTimeout => "HANDLER_TIMEOUT",
            ErrorKind::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed plugin execution.
///
/// Serializable so it can cross the worker isolation boundary intact.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct PluginError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PluginError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn config_not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigNotFound, msg)
    }

    pub fn disabled(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::PluginDisabled, msg)
    }

    pub fn not_registered(plugin_type: &str) -> Self {
        Self::new(
            ErrorKind::HandlerNotRegistered,
            format!("no handler registered for plugin type `{plugin_type}`"),
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, msg)
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::HandlerExecutionError, msg)
    }

    pub fn worker_crashed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::WorkerCrashed, msg)
    }

    pub fn delivery_timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeliveryTimeout, msg)
    }

    pub fn handler_timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::HandlerTimeout, msg)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// An identifier failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid identifier: {0}")]
pub struct InvalidId(pub String);
