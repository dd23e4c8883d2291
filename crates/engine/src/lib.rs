//! `formplug-engine`: wires the bus, registry, stores, dispatcher and worker
//! pool into one running engine.

pub mod config;
pub mod engine;
pub mod fixtures;

pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineError};
pub use fixtures::{FixtureSummary, Fixtures};
