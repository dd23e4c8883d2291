//! Engine configuration from `FORMPLUG_*` environment variables.

use std::time::Duration;

use envconfig::Envconfig;

use formplug_core::{BackoffStrategy, RetryPolicy};
use formplug_infra::{DispatcherConfig, WorkerPoolConfig};
use formplug_observability::LogFormat;
use formplug_plugins::DeliveryPolicy;

/// Extra time the dispatcher waits for a worker reply beyond the handler
/// timeout, so an in-worker timeout is reported as such.
const REPLY_GRACE: Duration = Duration::from_secs(1);

#[derive(Envconfig, Clone, Debug)]
pub struct EngineConfig {
    /// Total attempts per job, the first one included
    #[envconfig(from = "FORMPLUG_MAX_ATTEMPTS", default = "3")]
    pub max_attempts: u32,
    #[envconfig(from = "FORMPLUG_RETRY_BASE_MS", default = "1000")]
    pub retry_base_ms: u64,
    #[envconfig(from = "FORMPLUG_RETRY_MAX_MS", default = "30000")]
    pub retry_max_ms: u64,
    #[envconfig(from = "FORMPLUG_BACKOFF", default = "exponential")]
    pub backoff: BackoffStrategy,
    #[envconfig(from = "FORMPLUG_HANDLER_TIMEOUT_MS", default = "30000")]
    pub handler_timeout_ms: u64,
    /// 0 runs isolated handlers inline
    #[envconfig(from = "FORMPLUG_WORKER_THREADS", default = "4")]
    pub worker_threads: usize,
    #[envconfig(from = "FORMPLUG_WEBHOOK_TIMEOUT_MS", default = "8000")]
    pub webhook_timeout_ms: u64,
    /// Delivery attempts inside one webhook invocation
    #[envconfig(from = "FORMPLUG_WEBHOOK_ATTEMPTS", default = "3")]
    pub webhook_attempts: u32,
    /// Without an endpoint, emails are logged instead of sent
    #[envconfig(from = "FORMPLUG_MAIL_ENDPOINT")]
    pub mail_endpoint: Option<String>,
    #[envconfig(from = "FORMPLUG_MAIL_API_KEY")]
    pub mail_api_key: Option<String>,
    #[envconfig(from = "FORMPLUG_MAIL_FROM", default = "no-reply@formplug.local")]
    pub mail_from: String,
    #[envconfig(from = "FORMPLUG_LOG_FORMAT", default = "json")]
    pub log_format: LogFormat,
    #[envconfig(from = "FORMPLUG_FIXTURES")]
    pub fixtures: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be at least 1")]
    Zero { name: &'static str },
    #[error("FORMPLUG_RETRY_MAX_MS ({max}) is below FORMPLUG_RETRY_BASE_MS ({base})")]
    RetryBounds { base: u64, max: u64 },
    #[error("FORMPLUG_MAIL_API_KEY is required when FORMPLUG_MAIL_ENDPOINT is set")]
    MissingMailKey,
    #[error(
        "a webhook invocation can run {worst_case_ms}ms, which does not fit in \
         FORMPLUG_HANDLER_TIMEOUT_MS ({handler_timeout_ms}); lower FORMPLUG_WEBHOOK_TIMEOUT_MS or FORMPLUG_WEBHOOK_ATTEMPTS"
    )]
    WebhookBudget { worst_case_ms: u128, handler_timeout_ms: u64 },
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_ms: 1000,
            retry_max_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
            handler_timeout_ms: 30_000,
            worker_threads: 4,
            webhook_timeout_ms: 8_000,
            webhook_attempts: 3,
            mail_endpoint: None,
            mail_api_key: None,
            mail_from: "no-reply@formplug.local".to_string(),
            log_format: LogFormat::Json,
            fixtures: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero { name: "FORMPLUG_MAX_ATTEMPTS" });
        }
        if self.handler_timeout_ms == 0 {
            return Err(ConfigError::Zero { name: "FORMPLUG_HANDLER_TIMEOUT_MS" });
        }
        if self.webhook_attempts == 0 {
            return Err(ConfigError::Zero { name: "FORMPLUG_WEBHOOK_ATTEMPTS" });
        }
        if self.retry_max_ms < self.retry_base_ms {
            return Err(ConfigError::RetryBounds {
                base: self.retry_base_ms,
                max: self.retry_max_ms,
            });
        }
        if self.mail_endpoint.is_some() && self.mail_api_key.is_none() {
            return Err(ConfigError::MissingMailKey);
        }
        // The webhook's own retries must finish before the job-level timeout
        // fires, otherwise its last attempts never run.
        let worst_case = self.delivery_policy().worst_case();
        if worst_case >= self.handler_timeout() {
            return Err(ConfigError::WebhookBudget {
                worst_case_ms: worst_case.as_millis(),
                handler_timeout_ms: self.handler_timeout_ms,
            });
        }
        Ok(())
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Job-level retry between attempts.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            strategy: self.backoff,
            ..RetryPolicy::default()
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            retry: self.retry_policy(),
            handler_timeout: self.handler_timeout(),
            reply_timeout: self.handler_timeout() + REPLY_GRACE,
        }
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            name: "plugin-worker".to_string(),
            threads: self.worker_threads,
            handler_timeout: self.handler_timeout(),
        }
    }

    /// Retry inside one webhook invocation.
    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            retry: RetryPolicy::exponential(
                self.webhook_attempts,
                Duration::from_millis(500),
                Duration::from_secs(5),
            ),
            request_timeout: Duration::from_millis(self.webhook_timeout_ms),
        }
    }
}
