use formplug_core::JobId;

/// Storage operation error shared by the job store, delivery log and
/// configuration store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    #[error("job {0} is terminal and cannot be modified")]
    TerminalJob(JobId),
    #[error("record rejected: {0}")]
    Rejected(String),
    #[error("store state poisoned")]
    Poisoned,
    #[error("storage error: {0}")]
    Storage(String),
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StoreError::Poisoned
    }
}
