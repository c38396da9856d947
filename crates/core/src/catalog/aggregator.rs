//! Concurrent fan-out over catalog backends.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use super::{
    CatalogBackend, CatalogConfig, CatalogEntry, CatalogError, CatalogSource, CatalogTag,
    QueryCache, SkyRegion,
};
use crate::metrics;
use crate::sky::{SkyPosition, ARCSEC_PER_DEG};

/// Rounded sky position used to group catalog entries.
///
/// This is a lossy spatial bucket, not an identity: two distinct objects
/// closer than the bucket size can land in the same key, and one object can
/// straddle a bucket edge. Downstream matching works on the entries
/// themselves, so bucketing only affects grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub ra_bucket: i64,
    pub dec_bucket: i64,
}

impl PositionKey {
    pub fn from_position(position: &SkyPosition, bucket_arcsec: f64) -> Self {
        let bucket = |deg: f64| (deg * ARCSEC_PER_DEG / bucket_arcsec).round() as i64;
        Self {
            ra_bucket: bucket(position.ra_deg),
            dec_bucket: bucket(position.dec_deg),
        }
    }
}

/// A backend that failed during a fan-out. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFailure {
    pub tag: CatalogTag,
    pub error: String,
    pub retryable: bool,
}

/// Merged result of one region query across all backends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedCatalog {
    pub entries: BTreeMap<PositionKey, Vec<CatalogEntry>>,
    pub failures: Vec<BackendFailure>,
    /// Time-dependent backends not queried for lack of an observation time.
    pub skipped: Vec<CatalogTag>,
    /// Backends whose answer hit their row limit and may be incomplete.
    pub truncated: Vec<CatalogTag>,
}

impl AggregatedCatalog {
    /// All entries in key order.
    pub fn iter_entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values().flatten()
    }

    /// Total number of entries across buckets.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.entries.len()
    }

    fn insert(&mut self, entry: CatalogEntry, bucket_arcsec: f64) {
        let key = PositionKey::from_position(&entry.position, bucket_arcsec);
        self.entries.entry(key).or_default().push(entry);
    }
}

/// Queries every backend for a region concurrently and merges the results.
pub struct CatalogAggregator {
    backends: Vec<Arc<dyn CatalogBackend>>,
    max_concurrent: usize,
    bucket_arcsec: f64,
    cache: Option<Arc<QueryCache>>,
}

impl CatalogAggregator {
    pub fn new(
        backends: Vec<Arc<dyn CatalogBackend>>,
        max_concurrent: usize,
        bucket_arcsec: f64,
    ) -> Self {
        Self {
            backends,
            max_concurrent: max_concurrent.max(1),
            bucket_arcsec,
            cache: None,
        }
    }

    /// Build from configuration; a non-zero TTL enables the cache.
    pub fn from_config(backends: Vec<Arc<dyn CatalogBackend>>, config: &CatalogConfig) -> Self {
        let aggregator = Self::new(backends, config.max_concurrent, config.bucket_arcsec);
        if config.cache_ttl_secs > 0 {
            aggregator.with_cache(QueryCache::new(
                Duration::from_secs(config.cache_ttl_secs),
                config.bucket_arcsec,
            ))
        } else {
            aggregator
        }
    }

    pub fn with_cache(mut self, cache: QueryCache) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn backend_tags(&self) -> Vec<CatalogTag> {
        self.backends.iter().map(|b| b.tag()).collect()
    }

    /// Query a cone around `center`.
    pub async fn query(
        &self,
        center: SkyPosition,
        radius_arcsec: f64,
        observed_at: Option<DateTime<Utc>>,
    ) -> AggregatedCatalog {
        self.aggregate(&SkyRegion::new(center, radius_arcsec, observed_at))
            .await
    }

    async fn aggregate(&self, region: &SkyRegion) -> AggregatedCatalog {
        let started = Instant::now();
        let mut aggregated = AggregatedCatalog::default();

        let mut active = Vec::with_capacity(self.backends.len());
        for (idx, backend) in self.backends.iter().enumerate() {
            let tag = backend.tag();
            if backend.requires_observation_time() && region.observed_at.is_none() {
                debug!(backend = %tag, "Skipping time-dependent backend without observation time");
                metrics::CATALOG_QUERIES
                    .with_label_values(&[tag.as_str(), "skipped"])
                    .inc();
                aggregated.skipped.push(tag);
                continue;
            }
            active.push((idx, Arc::clone(backend)));
        }

        let region = *region;
        let queries: Vec<_> = active
            .into_iter()
            .map(|(idx, backend)| {
                let cache = self.cache.clone();
                async move {
                    let tag = backend.tag();
                    let limit = backend.row_limit();
                    let result = query_backend(backend, cache, region).await;
                    (idx, tag, limit, result)
                }
                .boxed()
            })
            .collect();
        let mut results: Vec<(
            usize,
            CatalogTag,
            Option<usize>,
            Result<Vec<CatalogEntry>, CatalogError>,
        )> = stream::iter(queries)
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        // Merge in backend order regardless of completion order.
        results.sort_by_key(|(idx, _, _, _)| *idx);

        for (_, tag, limit, result) in results {
            match result {
                Ok(entries) => {
                    debug!(backend = %tag, count = entries.len(), "Catalog backend returned");
                    if limit.is_some_and(|limit| entries.len() >= limit) {
                        warn!(
                            backend = %tag,
                            rows = entries.len(),
                            "Catalog backend hit its row limit, result may be incomplete"
                        );
                        aggregated.truncated.push(tag);
                    }
                    for entry in entries {
                        aggregated.insert(entry, self.bucket_arcsec);
                    }
                }
                Err(e) => {
                    warn!(backend = %tag, error = %e, "Catalog backend failed");
                    aggregated.failures.push(BackendFailure {
                        tag,
                        error: e.to_string(),
                        retryable: e.is_retryable(),
                    });
                }
            }
        }

        info!(
            entries = aggregated.len(),
            buckets = aggregated.bucket_count(),
            failed = aggregated.failures.len(),
            skipped = aggregated.skipped.len(),
            truncated = aggregated.truncated.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Catalog region query complete"
        );

        aggregated
    }
}

/// Run one backend query on its own task so a panic stays contained.
async fn query_backend(
    backend: Arc<dyn CatalogBackend>,
    cache: Option<Arc<QueryCache>>,
    region: SkyRegion,
) -> Result<Vec<CatalogEntry>, CatalogError> {
    let tag = backend.tag();

    if let Some(cache) = &cache {
        if let Some(entries) = cache.get(tag, &region).await {
            metrics::CATALOG_QUERIES
                .with_label_values(&[tag.as_str(), "cached"])
                .inc();
            return Ok(entries);
        }
    }

    let started = Instant::now();
    let handle = tokio::spawn(async move { backend.query(&region).await }.in_current_span());
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => Err(CatalogError::Aborted(e.to_string())),
    };

    metrics::CATALOG_DURATION
        .with_label_values(&[tag.as_str()])
        .observe(started.elapsed().as_secs_f64());
    let status = if result.is_ok() { "success" } else { "failure" };
    metrics::CATALOG_QUERIES
        .with_label_values(&[tag.as_str(), status])
        .inc();

    if let (Some(cache), Ok(entries)) = (&cache, &result) {
        cache.insert(tag, &region, entries.clone()).await;
    }

    result
}

#[async_trait]
impl CatalogSource for CatalogAggregator {
    async fn query_region(&self, region: &SkyRegion) -> AggregatedCatalog {
        self.aggregate(region).await
    }
}
