//! Playability probing for candidate sources.

use std::sync::Arc;
use std::time::Duration;

use hosters::StreamSource;
use reqwest::{Client, StatusCode, header};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::CacheLayer;
use crate::error::{Error, Result};
use crate::worker::{WorkerManager, WorkerType};

/// Probes source URLs, memoizing verdicts in the validation cache.
pub struct StreamValidator {
    client: Client,
    cache: Arc<CacheLayer>,
    timeout: Duration,
    workers: Option<Arc<WorkerManager>>,
}

impl StreamValidator {
    pub fn new(client: Client, cache: Arc<CacheLayer>, timeout: Duration) -> Self {
        Self {
            client,
            cache,
            timeout,
            workers: None,
        }
    }

    /// Run each probe as a tracked validation worker.
    pub fn with_workers(mut self, workers: Arc<WorkerManager>) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Whether `source` answers like a playable resource.
    ///
    /// With a worker manager attached, a source that cannot get a validation
    /// slot is accepted unprobed and its verdict is not cached.
    pub async fn is_playable(&self, source: &StreamSource, referer: Option<&str>) -> bool {
        if let Some(verdict) = self.cache.validation.get(&source.url) {
            return verdict;
        }

        let Some(workers) = &self.workers else {
            let verdict = self.probe(&source.url, referer).await;
            debug!(url = %source.url, playable = verdict, "Probed source");
            self.cache.validation.insert(source.url.clone(), verdict);
            return verdict;
        };

        let metadata = serde_json::json!({ "url": source.url, "referer": referer });
        let spawned = workers
            .spawn(WorkerType::Validation, metadata, |worker| async move {
                let token = worker.cancellation_token().clone();
                let verdict = tokio::select! {
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    verdict = self.probe(&source.url, referer) => verdict,
                };
                worker.log(if verdict { "Source is playable" } else { "Source did not answer" });
                Ok(verdict)
            })
            .await;

        match spawned {
            Ok((_, Ok(verdict))) => {
                debug!(url = %source.url, playable = verdict, "Probed source");
                self.cache.validation.insert(source.url.clone(), verdict);
                verdict
            }
            Ok((handle, Err(e))) => {
                debug!(url = %source.url, worker_id = %handle.id(), error = %e, "Validation worker ended without a verdict");
                false
            }
            Err(Error::WorkerCapacity { .. }) => {
                debug!(url = %source.url, "No validation slot; accepting source unprobed");
                true
            }
            Err(e) => {
                debug!(url = %source.url, error = %e, "Validation worker not admitted");
                false
            }
        }
    }

    async fn probe(&self, url: &str, referer: Option<&str>) -> bool {
        let head = self.request(self.client.head(url), referer).send().await;
        match head {
            Ok(resp) if resp.status().is_success() => true,
            // Some CDNs reject HEAD; retry with a one-byte ranged GET.
            Ok(resp)
                if resp.status() == StatusCode::METHOD_NOT_ALLOWED
                    || resp.status() == StatusCode::FORBIDDEN =>
            {
                self.request(self.client.get(url), referer)
                    .header(header::RANGE, "bytes=0-0")
                    .send()
                    .await
                    .is_ok_and(|r| r.status().is_success())
            }
            _ => false,
        }
    }

    fn request(
        &self,
        builder: reqwest::RequestBuilder,
        referer: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let builder = builder.timeout(self.timeout);
        match referer {
            Some(referer) => builder.header(header::REFERER, referer),
            None => builder,
        }
    }

    /// Keep only playable sources, preserving order.
    pub async fn filter(
        &self,
        sources: Vec<StreamSource>,
        referer: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamSource>> {
        let mut playable = Vec::with_capacity(sources.len());
        for source in sources {
            let ok = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                ok = self.is_playable(&source, referer) => ok,
            };
            if ok {
                playable.push(source);
            }
        }
        Ok(playable)
    }
}
