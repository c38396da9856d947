//! Mock catalog backend for testing.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::catalog::{CatalogBackend, CatalogEntry, CatalogError, CatalogTag, SkyRegion};

/// Mock implementation of the CatalogBackend trait.
///
/// Provides controllable behavior for testing:
/// - Return a fixed entry list for every region
/// - Track queried regions for assertions
/// - Simulate failures, panics and slow responses
///
/// # Example
///
/// ```rust,ignore
/// use skyrecon_core::testing::{MockCatalogBackend, fixtures};
///
/// let gaia = MockCatalogBackend::new(CatalogTag::GaiaDr3);
/// gaia.set_entries(vec![fixtures::catalog_entry(CatalogTag::GaiaDr3, 83.6, 22.0)]).await;
///
/// let entries = gaia.query(&region).await?;
/// assert_eq!(entries.len(), 1);
/// ```
#[derive(Debug)]
pub struct MockCatalogBackend {
    tag: CatalogTag,
    time_dependent: bool,
    row_limit: Option<usize>,
    /// Entries returned for every query.
    entries: Arc<RwLock<Vec<CatalogEntry>>>,
    /// Recorded query regions.
    queries: Arc<RwLock<Vec<SkyRegion>>>,
    /// If set, the next query will fail with this error.
    next_error: Arc<RwLock<Option<CatalogError>>>,
    /// If set, every query fails with a 503 carrying this message.
    always_fail: Arc<RwLock<Option<String>>>,
    panic: Arc<RwLock<bool>>,
    delay: Arc<RwLock<Option<Duration>>>,
}

impl MockCatalogBackend {
    /// Create a backend that needs no observation time.
    pub fn new(tag: CatalogTag) -> Self {
        Self {
            tag,
            time_dependent: false,
            row_limit: None,
            entries: Arc::new(RwLock::new(Vec::new())),
            queries: Arc::new(RwLock::new(Vec::new())),
            next_error: Arc::new(RwLock::new(None)),
            always_fail: Arc::new(RwLock::new(None)),
            panic: Arc::new(RwLock::new(false)),
            delay: Arc::new(RwLock::new(None)),
        }
    }

    /// Create a backend that is only queried with an observation time.
    pub fn time_dependent(tag: CatalogTag) -> Self {
        Self {
            time_dependent: true,
            ..Self::new(tag)
        }
    }

    /// Report a service row limit, as capped catalogs do.
    pub fn with_row_limit(mut self, limit: usize) -> Self {
        self.row_limit = Some(limit);
        self
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub async fn set_entries(&self, entries: Vec<CatalogEntry>) {
        *self.entries.write().await = entries;
    }

    /// Make the next query fail.
    pub async fn set_next_error(&self, error: CatalogError) {
        *self.next_error.write().await = Some(error);
    }

    /// Make every query fail with a retryable service error.
    pub async fn set_always_fail(&self, message: &str) {
        *self.always_fail.write().await = Some(message.to_string());
    }

    /// Make every query panic.
    pub async fn set_panic(&self, panic: bool) {
        *self.panic.write().await = panic;
    }

    /// Sleep before answering.
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = Some(delay);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub async fn queries(&self) -> Vec<SkyRegion> {
        self.queries.read().await.clone()
    }

    pub async fn query_count(&self) -> usize {
        self.queries.read().await.len()
    }

    pub async fn clear_queries(&self) {
        self.queries.write().await.clear();
    }
}

#[async_trait]
impl CatalogBackend for MockCatalogBackend {
    fn tag(&self) -> CatalogTag {
        self.tag
    }

    fn requires_observation_time(&self) -> bool {
        self.time_dependent
    }

    fn row_limit(&self) -> Option<usize> {
        self.row_limit
    }

    async fn query(&self, region: &SkyRegion) -> Result<Vec<CatalogEntry>, CatalogError> {
        self.queries.write().await.push(*region);

        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if *self.panic.read().await {
            panic!("mock catalog backend {} panicked", self.tag);
        }

        if let Some(error) = self.next_error.write().await.take() {
            return Err(error);
        }

        if let Some(message) = self.always_fail.read().await.clone() {
            return Err(CatalogError::Api {
                status: 503,
                message,
            });
        }

        Ok(self.entries.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sky::SkyPosition;
    use crate::testing::fixtures;

    fn region() -> SkyRegion {
        SkyRegion::new(SkyPosition::new(83.6, 22.0), 60.0, None)
    }

    #[tokio::test]
    async fn test_returns_entries_and_records_queries() {
        let backend = MockCatalogBackend::new(CatalogTag::Simbad);
        backend
            .set_entries(vec![fixtures::catalog_entry(CatalogTag::Simbad, 83.6, 22.0)])
            .await;

        let entries = backend.query(&region()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(backend.query_count().await, 1);
        assert_eq!(backend.queries().await[0], region());
    }

    #[tokio::test]
    async fn test_next_error_is_consumed() {
        let backend = MockCatalogBackend::new(CatalogTag::GaiaDr3);
        backend
            .set_next_error(CatalogError::Parse("broken".into()))
            .await;

        assert!(backend.query(&region()).await.is_err());
        assert!(backend.query(&region()).await.is_ok());
    }

    #[tokio::test]
    async fn test_always_fail_is_retryable() {
        let backend = MockCatalogBackend::new(CatalogTag::UsnoB1);
        backend.set_always_fail("down").await;

        for _ in 0..2 {
            let err = backend.query(&region()).await.unwrap_err();
            assert!(err.is_retryable());
        }
    }
}
