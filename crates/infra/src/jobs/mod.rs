//! Plugin jobs: the per-(event, config) execution record and its storage.
//!
//! - One job per matching plugin config per event
//! - Bounded retry driven by the job's `max_attempts`
//! - Jobs are never deleted; terminal jobs are frozen

pub mod store;
pub mod types;

pub use store::{InMemoryJobStore, JobStats, JobStore};
pub use types::{FailureOutcome, Job, JobStateError, JobStatus};
