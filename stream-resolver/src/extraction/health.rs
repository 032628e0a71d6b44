//! Per-provider success/failure/latency tracking and scoring.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Score returned for providers with no recorded attempts.
pub const NEUTRAL_SCORE: f64 = 50.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    /// Average latency at which the full latency penalty applies.
    pub latency_ceiling_ms: f64,
    /// Maximum points subtracted for latency.
    pub latency_weight: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            latency_ceiling_ms: 10_000.0,
            latency_weight: 20.0,
        }
    }
}

/// Rolling health counters for one provider.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    /// Running mean over successful attempts.
    pub average_latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
}

impl ProviderHealth {
    pub fn attempts(&self) -> u64 {
        self.success_count + self.failure_count
    }

    fn refresh_rate(&mut self) {
        let attempts = self.attempts();
        self.success_rate = if attempts == 0 {
            0.0
        } else {
            self.success_count as f64 / attempts as f64
        };
    }
}

/// Tracks provider health. Every update happens under the map's entry lock.
pub struct HealthTracker {
    stats: DashMap<String, ProviderHealth>,
    config: HealthConfig,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            stats: DashMap::new(),
            config,
        }
    }

    pub fn record_success(&self, provider_id: &str, latency_ms: u64) {
        let mut entry = self.stats.entry(provider_id.to_string()).or_default();
        let health = entry.value_mut();
        health.success_count += 1;
        let n = health.success_count as f64;
        health.average_latency_ms += (latency_ms as f64 - health.average_latency_ms) / n;
        health.last_success = Some(Utc::now());
        health.refresh_rate();
    }

    pub fn record_failure(&self, provider_id: &str) {
        let mut entry = self.stats.entry(provider_id.to_string()).or_default();
        let health = entry.value_mut();
        health.failure_count += 1;
        health.last_failure = Some(Utc::now());
        health.refresh_rate();
    }

    /// Ranking score: `successRate * 100 - normalizedLatency`, or the neutral score
    /// for providers without history.
    pub fn score(&self, provider_id: &str) -> f64 {
        match self.stats.get(provider_id) {
            Some(health) if health.attempts() > 0 => score_of(&health, &self.config),
            _ => NEUTRAL_SCORE,
        }
    }

    pub fn snapshot(&self, provider_id: &str) -> ProviderHealth {
        self.stats
            .get(provider_id)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn reset(&self, provider_id: &str) {
        self.stats.remove(provider_id);
    }

    pub fn reset_all(&self) {
        self.stats.clear();
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

fn score_of(health: &ProviderHealth, config: &HealthConfig) -> f64 {
    let normalized_latency = if config.latency_ceiling_ms > 0.0 {
        (health.average_latency_ms / config.latency_ceiling_ms).min(1.0) * config.latency_weight
    } else {
        0.0
    };
    health.success_rate * 100.0 - normalized_latency
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_is_neutral() {
        let tracker = HealthTracker::default();
        assert_eq!(tracker.score("nobody"), NEUTRAL_SCORE);
        assert_eq!(tracker.snapshot("nobody").attempts(), 0);
    }

    #[test]
    fn test_running_mean_latency() {
        let tracker = HealthTracker::default();
        tracker.record_success("p", 100);
        tracker.record_success("p", 300);
        tracker.record_failure("p");

        let health = tracker.snapshot("p");
        assert_eq!(health.success_count, 2);
        assert_eq!(health.failure_count, 1);
        assert!((health.average_latency_ms - 200.0).abs() < 1e-9);
        assert!((health.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(health.last_success.is_some());
        assert!(health.last_failure.is_some());
    }

    #[test]
    fn test_score_formula() {
        let tracker = HealthTracker::default();
        tracker.record_success("fast", 0);
        assert!((tracker.score("fast") - 100.0).abs() < 1e-9);

        // 5s average is half the ceiling: 100 - 10.
        tracker.record_success("slow", 5_000);
        assert!((tracker.score("slow") - 90.0).abs() < 1e-9);

        // Latency penalty saturates at the weight.
        tracker.record_success("glacial", 60_000);
        assert!((tracker.score("glacial") - 80.0).abs() < 1e-9);

        tracker.record_failure("broken");
        assert!((tracker.score("broken") - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset() {
        let tracker = HealthTracker::default();
        tracker.record_failure("a");
        tracker.record_failure("b");

        tracker.reset("a");
        assert_eq!(tracker.score("a"), NEUTRAL_SCORE);
        assert!(tracker.score("b") < NEUTRAL_SCORE);

        tracker.reset_all();
        assert_eq!(tracker.score("b"), NEUTRAL_SCORE);
    }
}
