//! Process-wide tracing setup shared by the engine binary and tests.

pub mod tracing;

pub use crate::tracing::{LogFormat, ParseLogFormatError};

/// Initialize tracing with `format`, filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init(format: LogFormat) {
    crate::tracing::init(format);
}
