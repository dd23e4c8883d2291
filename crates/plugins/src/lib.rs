//! `formplug-plugins`: the plugin contract and the built-in plugins.
//!
//! A plugin type is a compiled [`PluginHandler`] plus a config validator,
//! registered once at start-up in a [`PluginRegistry`]. Installing a plugin
//! on a form never loads code; it only activates a config row that names an
//! already-registered type.

pub mod builtins;
pub mod context;
pub mod email;
pub mod handler;
pub mod quiz;
pub mod registry;
pub mod settings;
pub mod webhook;

pub use builtins::{BuiltinDeps, register_builtins};
pub use context::{DataAccessError, FormReader, PluginContext, PluginLogger, ResponseReader};
pub use email::{EmailHandler, EmailSettings, HttpMailer, LogMailer, Mailer, MailerError, OutgoingEmail};
pub use handler::{ConfigValidator, ExecutionMode, PluginHandler, PluginMetadata};
pub use quiz::{FieldScore, QuizField, QuizGradingHandler, QuizGradingSettings, QuizResult, ResponseMetadataWriter, grade};
pub use registry::{PluginRegistry, RegistryError};
pub use settings::{PluginSettings, ValidationError};
pub use webhook::{DeliveryPolicy, WebhookHandler, WebhookSettings};
