//! Time-bounded cache of backend query results.
//!
//! Keys are the backend tag plus the region rounded to the bucket size and
//! the observation time rounded to the minute. Concurrent misses for the same
//! key may each query the backend; queries are idempotent so the last writer
//! simply wins.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{CatalogEntry, CatalogTag, SkyRegion};
use crate::sky::ARCSEC_PER_DEG;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    tag: CatalogTag,
    ra: i64,
    dec: i64,
    radius: i64,
    minute: Option<i64>,
}

/// TTL cache for catalog query results.
pub struct QueryCache {
    ttl: Duration,
    bucket_arcsec: f64,
    entries: RwLock<HashMap<CacheKey, (Instant, Vec<CatalogEntry>)>>,
}

impl QueryCache {
    pub fn new(ttl: Duration, bucket_arcsec: f64) -> Self {
        Self {
            ttl,
            bucket_arcsec: bucket_arcsec.max(f64::EPSILON),
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn key(&self, tag: CatalogTag, region: &SkyRegion) -> CacheKey {
        let round = |deg: f64| (deg * ARCSEC_PER_DEG / self.bucket_arcsec).round() as i64;
        CacheKey {
            tag,
            ra: round(region.center.ra_deg),
            dec: round(region.center.dec_deg),
            radius: (region.radius_arcsec / self.bucket_arcsec).round() as i64,
            minute: region.observed_at.map(|t| t.timestamp().div_euclid(60)),
        }
    }

    /// Cached entries, if present and younger than the TTL.
    pub async fn get(&self, tag: CatalogTag, region: &SkyRegion) -> Option<Vec<CatalogEntry>> {
        let key = self.key(tag, region);
        let entries = self.entries.read().await;
        let (stored_at, cached) = entries.get(&key)?;
        if stored_at.elapsed() >= self.ttl {
            return None;
        }
        Some(cached.clone())
    }

    /// Store a result. Expired entries are dropped on the way, so the map
    /// only holds results younger than the TTL.
    pub async fn insert(&self, tag: CatalogTag, region: &SkyRegion, results: Vec<CatalogEntry>) {
        let key = self.key(tag, region);
        let mut entries = self.entries.write().await;
        entries.retain(|_, (stored_at, _)| stored_at.elapsed() < self.ttl);
        entries.insert(key, (Instant::now(), results));
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sky::SkyPosition;
    use crate::testing::fixtures;
    use chrono::{TimeZone, Utc};

    fn region(ra: f64, dec: f64) -> SkyRegion {
        SkyRegion::new(SkyPosition::new(ra, dec), 120.0, None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_then_expire() {
        let cache = QueryCache::new(Duration::from_secs(60), 1.0);
        let entries = vec![fixtures::catalog_entry(CatalogTag::GaiaDr3, 10.0, 20.0)];
        cache
            .insert(CatalogTag::GaiaDr3, &region(10.0, 20.0), entries.clone())
            .await;

        assert_eq!(
            cache.get(CatalogTag::GaiaDr3, &region(10.0, 20.0)).await,
            Some(entries)
        );
        assert!(cache.get(CatalogTag::UsnoB1, &region(10.0, 20.0)).await.is_none());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cache.get(CatalogTag::GaiaDr3, &region(10.0, 20.0)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_evicts_expired_entries() {
        let cache = QueryCache::new(Duration::from_secs(60), 1.0);
        cache
            .insert(CatalogTag::GaiaDr3, &region(10.0, 20.0), Vec::new())
            .await;
        cache
            .insert(CatalogTag::GaiaDr3, &region(30.0, 40.0), Vec::new())
            .await;
        assert_eq!(cache.len().await, 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache
            .insert(CatalogTag::GaiaDr3, &region(50.0, 60.0), Vec::new())
            .await;

        assert_eq!(cache.len().await, 1);
        assert!(cache.get(CatalogTag::GaiaDr3, &region(50.0, 60.0)).await.is_some());
        assert!(!cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_nearby_centers_share_key() {
        let cache = QueryCache::new(Duration::from_secs(60), 1.0);
        cache
            .insert(CatalogTag::Simbad, &region(10.0, 20.0), Vec::new())
            .await;

        // 0.2" away rounds to the same bucket, 5" away does not.
        let near = region(10.0, 20.0 + 0.2 / 3600.0);
        let far = region(10.0, 20.0 + 5.0 / 3600.0);
        assert!(cache.get(CatalogTag::Simbad, &near).await.is_some());
        assert!(cache.get(CatalogTag::Simbad, &far).await.is_none());
    }

    #[tokio::test]
    async fn test_observation_minute_is_part_of_key() {
        let cache = QueryCache::new(Duration::from_secs(60), 1.0);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap();
        let mut at_t0 = region(10.0, 20.0);
        at_t0.observed_at = Some(t0);
        cache.insert(CatalogTag::MinorPlanet, &at_t0, Vec::new()).await;

        let mut same_minute = at_t0;
        same_minute.observed_at = Some(t0 + chrono::Duration::seconds(30));
        let mut next_minute = at_t0;
        next_minute.observed_at = Some(t0 + chrono::Duration::seconds(60));

        assert!(cache.get(CatalogTag::MinorPlanet, &same_minute).await.is_some());
        assert!(cache.get(CatalogTag::MinorPlanet, &next_minute).await.is_none());
        assert_eq!(cache.len().await, 1);
    }
}
