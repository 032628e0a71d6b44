//! Bounded-concurrency, observable units of work.

mod manager;
mod model;

pub use manager::{WorkerHandle, WorkerManager, WorkerTypeStats};
pub use model::{
    MAX_CLEANUP_AFTER_MS, MAX_CONCURRENCY, MAX_LOGS_PER_WORKER, StreamWorker, WorkerConfig,
    WorkerConfigUpdate, WorkerLogEntry, WorkerStatus, WorkerType,
};
