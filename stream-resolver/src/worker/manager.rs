//! Lifecycle tracking and admission control for units of work.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::{StreamWorker, WorkerConfig, WorkerStatus, WorkerType};
use crate::error::{Error, Result};
use crate::extraction::ExtractionObserver;

struct Shared {
    config: RwLock<WorkerConfig>,
    /// Admitted, not yet terminal workers per type.
    running: Mutex<HashMap<WorkerType, usize>>,
}

impl Shared {
    fn release_slot(&self, worker_type: WorkerType) {
        let mut running = self.running.lock();
        if let Some(count) = running.get_mut(&worker_type) {
            *count = count.saturating_sub(1);
        }
    }
}

struct WorkerEntry {
    state: Mutex<StreamWorker>,
    cancel: CancellationToken,
}

/// Handle to a tracked worker, given to its task.
#[derive(Clone)]
pub struct WorkerHandle {
    entry: Arc<WorkerEntry>,
    shared: Arc<Shared>,
}

impl WorkerHandle {
    pub fn id(&self) -> Uuid {
        self.entry.state.lock().id
    }

    pub fn worker_type(&self) -> WorkerType {
        self.entry.state.lock().worker_type
    }

    pub fn status(&self) -> WorkerStatus {
        self.entry.state.lock().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.entry.cancel
    }

    pub fn snapshot(&self) -> StreamWorker {
        self.entry.state.lock().clone()
    }

    pub fn log(&self, message: impl Into<String>) {
        let max_logs = self.shared.config.read().max_logs_per_worker;
        self.entry.state.lock().push_log(message.into(), max_logs);
    }

    pub fn set_progress(&self, progress: u8) {
        let mut state = self.entry.state.lock();
        if !state.status.is_terminal() {
            state.progress = progress.min(100);
        }
    }

    fn mark_running(&self) {
        let mut state = self.entry.state.lock();
        if state.status == WorkerStatus::Pending {
            state.status = WorkerStatus::Running;
        }
    }

    pub fn complete(&self, result: serde_json::Value) -> bool {
        self.finish(WorkerStatus::Succeeded, Some(result), None)
    }

    pub fn fail(&self, error: impl Into<String>) -> bool {
        self.finish(WorkerStatus::Failed, None, Some(error.into()))
    }

    /// Mark the worker cancelled and cancel its task's token. No-op once terminal.
    pub fn cancel(&self) -> bool {
        let changed = self.finish(WorkerStatus::Cancelled, None, None);
        if changed {
            self.entry.cancel.cancel();
        }
        changed
    }

    /// Terminal transition. Only the first call has any effect.
    fn finish(
        &self,
        status: WorkerStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> bool {
        let worker_type = {
            let mut state = self.entry.state.lock();
            if state.status.is_terminal() {
                return false;
            }
            state.status = status;
            state.completed_at = Some(Utc::now());
            if status == WorkerStatus::Succeeded {
                state.progress = 100;
            }
            state.result = result;
            state.error = error;
            debug!(worker_id = %state.id, worker_type = %state.worker_type, status = ?status, "Worker finished");
            state.worker_type
        };
        self.shared.release_slot(worker_type);
        true
    }

    fn settle<T: Serialize>(&self, result: &Result<T>) {
        match result {
            Ok(value) => {
                self.complete(serde_json::to_value(value).unwrap_or(serde_json::Value::Null));
            }
            Err(e) if e.is_cancelled() => {
                self.cancel();
            }
            Err(e) => {
                self.fail(e.to_string());
            }
        }
    }
}

impl ExtractionObserver for WorkerHandle {
    fn log(&self, message: &str) {
        WorkerHandle::log(self, message);
    }

    fn progress(&self, percent: u8) {
        self.set_progress(percent);
    }
}

/// Cancels a foreground worker whose future is dropped before it settles.
struct ForegroundGuard {
    handle: WorkerHandle,
}

impl Drop for ForegroundGuard {
    fn drop(&mut self) {
        if self.handle.cancel() {
            debug!(worker_id = %self.handle.id(), "Foreground worker dropped, marked cancelled");
        }
    }
}

/// Per-type counts for the workers endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTypeStats {
    pub running: usize,
    pub max: usize,
}

/// Tracks workers, enforces per-type caps and reaps finished workers.
pub struct WorkerManager {
    shared: Arc<Shared>,
    workers: DashMap<Uuid, Arc<WorkerEntry>>,
    cancellation_token: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
    reap_interval: Duration,
}

impl WorkerManager {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config: RwLock::new(config),
                running: Mutex::new(HashMap::new()),
            }),
            workers: DashMap::new(),
            cancellation_token: CancellationToken::new(),
            tasks: Mutex::new(Some(JoinSet::new())),
            reap_interval: Duration::from_secs(30),
        })
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn config(&self) -> WorkerConfig {
        self.shared.config.read().clone()
    }

    pub fn update_config(&self, config: WorkerConfig) -> Result<()> {
        config.validate()?;
        info!(?config, "Updated worker configuration");
        *self.shared.config.write() = config;
        Ok(())
    }

    pub fn running_count(&self, worker_type: WorkerType) -> usize {
        self.shared
            .running
            .lock()
            .get(&worker_type)
            .copied()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> HashMap<WorkerType, WorkerTypeStats> {
        let config = self.config();
        WorkerType::ALL
            .iter()
            .map(|t| {
                (
                    *t,
                    WorkerTypeStats {
                        running: self.running_count(*t),
                        max: config.max_for(*t),
                    },
                )
            })
            .collect()
    }

    /// Reserve a slot and register a pending worker, or reject at cap.
    fn admit(&self, worker_type: WorkerType, metadata: serde_json::Value) -> Result<WorkerHandle> {
        if self.cancellation_token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let max = self.shared.config.read().max_for(worker_type);
        {
            let mut running = self.shared.running.lock();
            let count = running.entry(worker_type).or_insert(0);
            if *count >= max {
                debug!(worker_type = %worker_type, max, "Worker admission rejected");
                return Err(Error::WorkerCapacity {
                    worker_type: worker_type.to_string(),
                    max,
                });
            }
            *count += 1;
        }

        let worker = StreamWorker::new(worker_type, metadata);
        let id = worker.id;
        let entry = Arc::new(WorkerEntry {
            state: Mutex::new(worker),
            cancel: self.cancellation_token.child_token(),
        });
        self.workers.insert(id, entry.clone());

        Ok(WorkerHandle {
            entry,
            shared: self.shared.clone(),
        })
    }

    /// Run `task` as a tracked worker on the caller's task.
    ///
    /// The outer error is an admission failure. Dropping the returned future
    /// cancels the worker.
    pub async fn spawn<T, F, Fut>(
        &self,
        worker_type: WorkerType,
        metadata: serde_json::Value,
        task: F,
    ) -> Result<(WorkerHandle, Result<T>)>
    where
        T: Serialize,
        F: FnOnce(WorkerHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.admit(worker_type, metadata)?;
        let guard = ForegroundGuard {
            handle: handle.clone(),
        };
        handle.mark_running();

        let result = task(handle.clone()).await;
        handle.settle(&result);
        drop(guard);

        Ok((handle, result))
    }

    /// Run `task` on the runtime and return its handle immediately.
    ///
    /// The outcome, including a panic, lands in the worker's terminal state.
    pub fn spawn_in_background<T, F, Fut>(
        &self,
        worker_type: WorkerType,
        metadata: serde_json::Value,
        task: F,
    ) -> Result<WorkerHandle>
    where
        T: Serialize + Send + 'static,
        F: FnOnce(WorkerHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let handle = self.admit(worker_type, metadata)?;
        let worker = handle.clone();

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            handle.cancel();
            return Err(Error::Cancelled);
        };

        join_set.spawn(async move {
            worker.mark_running();
            let token = worker.cancellation_token().clone();
            let run = AssertUnwindSafe(task(worker.clone())).catch_unwind();

            tokio::select! {
                _ = token.cancelled() => {
                    worker.cancel();
                }
                outcome = run => match outcome {
                    Ok(result) => worker.settle(&result),
                    Err(_) => {
                        error!(worker_id = %worker.id(), "Background worker panicked");
                        worker.fail("worker panicked");
                    }
                },
            }
        });

        Ok(handle)
    }

    pub fn get(&self, id: &Uuid) -> Option<StreamWorker> {
        self.workers.get(id).map(|e| e.state.lock().clone())
    }

    /// All tracked workers, newest first.
    pub fn list(&self) -> Vec<StreamWorker> {
        let mut workers: Vec<StreamWorker> = self
            .workers
            .iter()
            .map(|e| e.state.lock().clone())
            .collect();
        workers.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        workers
    }

    /// Cancel a worker. Returns `Ok(false)` if it had already finished.
    pub fn cancel(&self, id: &Uuid) -> Result<bool> {
        let entry = self
            .workers
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| Error::not_found("Worker", id.to_string()))?;
        let handle = WorkerHandle {
            entry,
            shared: self.shared.clone(),
        };
        let cancelled = handle.cancel();
        if cancelled {
            info!(worker_id = %id, "Worker cancelled");
        }
        Ok(cancelled)
    }

    /// Drop finished workers past the retention window and collect finished tasks.
    pub fn reap(&self) -> usize {
        let retention = chrono::Duration::milliseconds(self.config().cleanup_after_ms as i64);
        let cutoff = Utc::now() - retention;

        let before = self.workers.len();
        self.workers.retain(|_, entry| {
            let state = entry.state.lock();
            !matches!(state.completed_at, Some(done) if done <= cutoff)
        });

        if let Some(join_set) = self.tasks.lock().as_mut() {
            while let Some(joined) = join_set.try_join_next() {
                if let Err(e) = joined {
                    warn!(error = %e, "Background worker task ended abnormally");
                }
            }
        }

        before.saturating_sub(self.workers.len())
    }

    pub fn start_reaper(self: &Arc<Self>, cancel_token: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.reap_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Worker reaper shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let reaped = manager.reap();
                        if reaped > 0 {
                            debug!(reaped, "Reaped finished workers");
                        }
                    }
                }
            }
        });
    }

    /// Cancel every worker and wait for background tasks to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down worker manager");
        self.cancellation_token.cancel();

        for entry in self.workers.iter() {
            let handle = WorkerHandle {
                entry: entry.value().clone(),
                shared: self.shared.clone(),
            };
            handle.cancel();
        }

        let tasks = self.tasks.lock().take();
        if let Some(mut join_set) = tasks {
            while let Some(joined) = join_set.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Background worker task ended abnormally");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn manager(extraction_cap: usize) -> WorkerManager {
        let mut config = WorkerConfig::default();
        config
            .max_concurrent
            .insert(WorkerType::Extraction, extraction_cap);
        WorkerManager::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_spawn_records_success() {
        let manager = manager(2);
        let (handle, result) = manager
            .spawn(WorkerType::Extraction, json!({"id": "603"}), |worker| async move {
                worker.log("working");
                worker.set_progress(40);
                Ok(json!({"sources": 1}))
            })
            .await
            .unwrap();

        assert!(result.is_ok());
        let worker = manager.get(&handle.id()).unwrap();
        assert_eq!(worker.status, WorkerStatus::Succeeded);
        assert_eq!(worker.progress, 100);
        assert_eq!(worker.logs.len(), 1);
        assert!(worker.completed_at.is_some());
        assert_eq!(worker.result, Some(json!({"sources": 1})));
        assert_eq!(manager.running_count(WorkerType::Extraction), 0);
    }

    #[tokio::test]
    async fn test_spawn_records_failure() {
        let manager = manager(2);
        let (handle, result) = manager
            .spawn(WorkerType::Extraction, json!({}), |_| async {
                Err::<(), _>(Error::Other("nope".to_string()))
            })
            .await
            .unwrap();

        assert!(result.is_err());
        let worker = handle.snapshot();
        assert_eq!(worker.status, WorkerStatus::Failed);
        assert_eq!(worker.error.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn test_spawn_at_cap_rejects_without_running() {
        let manager = Arc::new(manager(1));
        let release = CancellationToken::new();

        let busy = {
            let manager = manager.clone();
            let release = release.clone();
            tokio::spawn(async move {
                manager
                    .spawn(WorkerType::Extraction, json!({}), |_| async move {
                        release.cancelled().await;
                        Ok(())
                    })
                    .await
            })
        };
        while manager.running_count(WorkerType::Extraction) == 0 {
            tokio::task::yield_now().await;
        }

        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        let rejected = manager
            .spawn(WorkerType::Extraction, json!({}), |_| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(rejected, Err(Error::WorkerCapacity { max: 1, .. })));
        assert!(!started.load(Ordering::SeqCst));

        // Other types have their own cap.
        assert!(
            manager
                .spawn(WorkerType::Validation, json!({}), |_| async { Ok(()) })
                .await
                .is_ok()
        );

        release.cancel();
        busy.await.unwrap().unwrap();
        assert_eq!(manager.running_count(WorkerType::Extraction), 0);
    }

    #[tokio::test]
    async fn test_dropped_foreground_future_cancels_worker() {
        let manager = manager(1);
        let observed = Arc::new(parking_lot::Mutex::new(None::<WorkerHandle>));
        let slot = observed.clone();

        let fut = manager.spawn(WorkerType::Extraction, json!({}), move |worker| {
            *slot.lock() = Some(worker.clone());
            async move {
                worker.cancellation_token().cancelled().await;
                Ok(())
            }
        });
        let _ = tokio::time::timeout(Duration::from_millis(20), fut).await;

        let worker = observed.lock().clone().unwrap();
        assert_eq!(worker.status(), WorkerStatus::Cancelled);
        assert!(worker.cancellation_token().is_cancelled());
        assert_eq!(manager.running_count(WorkerType::Extraction), 0);
    }

    #[tokio::test]
    async fn test_background_outcomes() {
        let manager = manager(4);

        let ok = manager
            .spawn_in_background(WorkerType::Extraction, json!({}), |_| async {
                Ok(json!("done"))
            })
            .unwrap();
        let panicked = manager
            .spawn_in_background(WorkerType::Extraction, json!({}), |_| async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .unwrap();
        let long = manager
            .spawn_in_background(WorkerType::Extraction, json!({}), |worker| async move {
                worker.cancellation_token().cancelled().await;
                Ok(())
            })
            .unwrap();

        while !ok.is_terminal() || !panicked.is_terminal() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(manager.cancel(&long.id()).unwrap());
        assert!(!manager.cancel(&long.id()).unwrap());
        manager.shutdown().await;

        assert_eq!(ok.status(), WorkerStatus::Succeeded);
        assert_eq!(panicked.status(), WorkerStatus::Failed);
        assert_eq!(long.status(), WorkerStatus::Cancelled);
        assert!(manager.cancel(&Uuid::new_v4()).is_err());

        // Admission is closed after shutdown.
        assert!(
            manager
                .spawn_in_background(WorkerType::Extraction, json!({}), |_| async { Ok(()) })
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_terminal_transition_happens_once() {
        let manager = manager(1);
        let (handle, _) = manager
            .spawn(WorkerType::Extraction, json!({}), |_| async { Ok(()) })
            .await
            .unwrap();
        let completed_at = handle.snapshot().completed_at;

        assert!(!handle.fail("late"));
        assert!(!handle.cancel());
        let worker = handle.snapshot();
        assert_eq!(worker.status, WorkerStatus::Succeeded);
        assert_eq!(worker.completed_at, completed_at);
        assert_eq!(manager.running_count(WorkerType::Extraction), 0);
    }

    #[tokio::test]
    async fn test_reap_respects_retention() {
        let mut config = WorkerConfig::default();
        config.cleanup_after_ms = 0;
        let manager = WorkerManager::new(config).unwrap();

        let (handle, result) = manager
            .spawn(WorkerType::Playlist, json!({}), |_| async { Ok(()) })
            .await
            .unwrap();
        assert!(result.is_ok());
        assert!(handle.is_terminal());
        assert_eq!(manager.list().len(), 1);
        assert_eq!(manager.reap(), 1);
        assert!(manager.list().is_empty());
    }

    #[test]
    fn test_update_config_validates() {
        let manager = manager(1);
        let mut config = manager.config();
        config.max_logs_per_worker = 0;
        assert!(manager.update_config(config).is_err());
        assert_eq!(manager.config().max_logs_per_worker, 100);
    }
}
