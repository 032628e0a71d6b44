use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Kind of unit of work, each with its own concurrency cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    Extraction,
    Validation,
    Playlist,
}

impl WorkerType {
    pub const ALL: [WorkerType; 3] = [
        WorkerType::Extraction,
        WorkerType::Validation,
        WorkerType::Playlist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Extraction => "extraction",
            WorkerType::Validation => "validation",
            WorkerType::Playlist => "playlist",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Succeeded | WorkerStatus::Failed | WorkerStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Observable state of one unit of work.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamWorker {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub worker_type: WorkerType,
    pub status: WorkerStatus,
    pub metadata: serde_json::Value,
    /// Ring buffer, oldest first.
    pub logs: VecDeque<WorkerLogEntry>,
    /// 0-100.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamWorker {
    pub(crate) fn new(worker_type: WorkerType, metadata: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_type,
            status: WorkerStatus::Pending,
            metadata,
            logs: VecDeque::new(),
            progress: 0,
            result: None,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub(crate) fn push_log(&mut self, message: String, max_logs: usize) {
        while self.logs.len() >= max_logs.max(1) {
            self.logs.pop_front();
        }
        self.logs.push_back(WorkerLogEntry {
            timestamp: Utc::now(),
            message,
        });
    }
}

pub const MAX_CONCURRENCY: usize = 100;
pub const MAX_CLEANUP_AFTER_MS: u64 = 7 * 24 * 60 * 60 * 1000;
pub const MAX_LOGS_PER_WORKER: usize = 10_000;

/// Worker manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Cap per type; 0 disables the type.
    pub max_concurrent: HashMap<WorkerType, usize>,
    /// Retention of finished workers.
    pub cleanup_after_ms: u64,
    pub max_logs_per_worker: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: HashMap::from([
                (WorkerType::Extraction, 10),
                (WorkerType::Validation, 20),
                (WorkerType::Playlist, 50),
            ]),
            cleanup_after_ms: 5 * 60 * 1000,
            max_logs_per_worker: 100,
        }
    }
}

impl WorkerConfig {
    pub fn max_for(&self, worker_type: WorkerType) -> usize {
        self.max_concurrent.get(&worker_type).copied().unwrap_or(0)
    }

    pub fn validate(&self) -> Result<()> {
        for (worker_type, max) in &self.max_concurrent {
            if *max > MAX_CONCURRENCY {
                return Err(Error::validation(format!(
                    "maxConcurrent.{worker_type} must be between 0 and {MAX_CONCURRENCY}"
                )));
            }
        }
        if self.cleanup_after_ms > MAX_CLEANUP_AFTER_MS {
            return Err(Error::validation(format!(
                "cleanupAfterMs must not exceed {MAX_CLEANUP_AFTER_MS}"
            )));
        }
        if !(1..=MAX_LOGS_PER_WORKER).contains(&self.max_logs_per_worker) {
            return Err(Error::validation(format!(
                "maxLogsPerWorker must be between 1 and {MAX_LOGS_PER_WORKER}"
            )));
        }
        Ok(())
    }

    /// Apply a partial update, validating the result.
    pub fn merged(&self, update: WorkerConfigUpdate) -> Result<Self> {
        let mut next = self.clone();
        if let Some(max_concurrent) = update.max_concurrent {
            next.max_concurrent.extend(max_concurrent);
        }
        if let Some(cleanup_after_ms) = update.cleanup_after_ms {
            next.cleanup_after_ms = cleanup_after_ms;
        }
        if let Some(max_logs) = update.max_logs_per_worker {
            next.max_logs_per_worker = max_logs;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Partial [`WorkerConfig`] as accepted by `PUT /workers/config`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfigUpdate {
    #[serde(default)]
    pub max_concurrent: Option<HashMap<WorkerType, usize>>,
    #[serde(default)]
    pub cleanup_after_ms: Option<u64>,
    #[serde(default)]
    pub max_logs_per_worker: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_bounds() {
        assert!(WorkerConfig::default().validate().is_ok());

        let base = WorkerConfig::default();
        let too_many: WorkerConfigUpdate =
            serde_json::from_value(json!({"maxConcurrent": {"extraction": 101}})).unwrap();
        assert!(base.merged(too_many).is_err());

        let zero_logs: WorkerConfigUpdate =
            serde_json::from_value(json!({"maxLogsPerWorker": 0})).unwrap();
        assert!(base.merged(zero_logs).is_err());

        let long_retention = WorkerConfigUpdate {
            cleanup_after_ms: Some(MAX_CLEANUP_AFTER_MS + 1),
            ..Default::default()
        };
        assert!(base.merged(long_retention).is_err());

        let ok: WorkerConfigUpdate = serde_json::from_value(json!({
            "maxConcurrent": {"playlist": 0},
            "cleanupAfterMs": MAX_CLEANUP_AFTER_MS,
        }))
        .unwrap();
        let merged = base.merged(ok).unwrap();
        assert_eq!(merged.max_for(WorkerType::Playlist), 0);
        assert_eq!(merged.max_for(WorkerType::Extraction), 10);
    }

    #[test]
    fn test_log_ring_buffer() {
        let mut worker = StreamWorker::new(WorkerType::Extraction, json!({}));
        for i in 0..5 {
            worker.push_log(format!("line {i}"), 3);
        }
        let lines: Vec<_> = worker.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_serialized_shape() {
        let worker = StreamWorker::new(WorkerType::Playlist, json!({"url": "x"}));
        let value = serde_json::to_value(&worker).unwrap();
        assert_eq!(value["type"], "playlist");
        assert_eq!(value["status"], "pending");
        assert!(value.get("completedAt").is_none());
        assert!(value.get("startedAt").is_some());
    }
}
