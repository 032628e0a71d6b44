use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CacheStats, SingleFlight, TtlCache};
use crate::domain::{ResolveKey, ResolvedStream};

/// Outcome shared with coalesced followers.
pub type FlightResult = std::result::Result<ResolvedStream, NegativeEntry>;

/// A "we tried and failed" marker.
#[derive(Debug, Clone, Serialize)]
pub struct NegativeEntry {
    pub message: String,
    pub attempts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CacheLayerConfig {
    pub stream_ttl: Duration,
    pub stream_max_size: usize,
    pub validation_ttl: Duration,
    pub validation_max_size: usize,
    pub negative_ttl: Duration,
    pub negative_max_size: usize,
    /// Interval of the expired-entry sweep.
    pub cleanup_interval: Duration,
}

impl Default for CacheLayerConfig {
    fn default() -> Self {
        Self {
            stream_ttl: Duration::from_secs(20 * 60),
            stream_max_size: 1000,
            validation_ttl: Duration::from_secs(5 * 60),
            validation_max_size: 5000,
            negative_ttl: Duration::from_secs(2 * 60),
            negative_max_size: 1000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Stream, validation and negative caches plus the in-flight map.
pub struct CacheLayer {
    pub stream: TtlCache<ResolveKey, ResolvedStream>,
    /// Keyed by source URL; `true` means playable.
    pub validation: TtlCache<String, bool>,
    pub negative: TtlCache<ResolveKey, NegativeEntry>,
    pub in_flight: SingleFlight<ResolveKey, FlightResult>,
    cleanup_interval: Duration,
}

impl CacheLayer {
    pub fn new(config: CacheLayerConfig) -> Self {
        Self {
            stream: TtlCache::new("stream", config.stream_ttl, config.stream_max_size),
            validation: TtlCache::new(
                "validation",
                config.validation_ttl,
                config.validation_max_size,
            ),
            negative: TtlCache::new("negative", config.negative_ttl, config.negative_max_size),
            in_flight: SingleFlight::new(),
            cleanup_interval: config.cleanup_interval,
        }
    }

    /// Empty all three namespaces and abandon in-flight resolutions.
    pub fn clear_all(&self) {
        self.stream.clear();
        self.validation.clear();
        self.negative.clear();
        self.in_flight.clear();
        info!("Cleared stream, validation and negative caches");
    }

    pub fn cleanup_expired(&self) -> usize {
        self.stream.cleanup_expired()
            + self.validation.cleanup_expired()
            + self.negative.cleanup_expired()
    }

    pub fn stats(&self) -> CacheLayerStats {
        CacheLayerStats {
            stream: self.stream.stats(),
            validation: self.validation.stats(),
            negative: self.negative.stats(),
        }
    }

    /// Start the periodic expired-entry sweep.
    pub fn start_cleanup(self: &Arc<Self>, cancel_token: CancellationToken) {
        let layer = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(layer.cleanup_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Cache cleanup task shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let removed = layer.cleanup_expired();
                        if removed > 0 {
                            debug!(removed, "Swept expired cache entries");
                        }
                    }
                }
            }
        });
    }
}

impl Default for CacheLayer {
    fn default() -> Self {
        Self::new(CacheLayerConfig::default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheLayerStats {
    pub stream: CacheStats,
    pub validation: CacheStats,
    pub negative: CacheStats,
}
