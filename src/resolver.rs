//! Client IP to city resolution
//!
//! Consults the geolocation cache first, then each configured provider in
//! order. Resolution never fails: when nothing answers, the configured
//! fallback city is returned with [`UNKNOWN_COUNTRY`].

use chrono::Utc;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::GeoCache;
use crate::data::{GeoLocation, GeoProvider, IpCacheEntry};

/// Country reported when no provider could place the IP
pub const UNKNOWN_COUNTRY: &str = "Unknown Country";

/// Default freshness window for cached geolocations (one day)
pub const DEFAULT_GEO_STALE_SECS: u64 = 86_400;

/// Resolves client IPs to a city and country
pub struct GeoResolver {
    cache: Arc<dyn GeoCache>,
    providers: Vec<Arc<dyn GeoProvider>>,
    stale_after: Duration,
    fallback_city: String,
}

impl GeoResolver {
    /// Creates a resolver
    ///
    /// # Arguments
    /// * `cache` - Store for previously resolved IPs
    /// * `providers` - Geolocation services, tried in this order
    /// * `stale_after` - Age at which a cached entry is no longer served
    /// * `fallback_city` - City reported when every provider fails
    pub fn new(
        cache: Arc<dyn GeoCache>,
        providers: Vec<Arc<dyn GeoProvider>>,
        stale_after: Duration,
        fallback_city: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            providers,
            stale_after,
            fallback_city: fallback_city.into(),
        }
    }

    /// Resolve `ip` to a location
    pub async fn resolve(&self, ip: IpAddr) -> GeoLocation {
        let key = ip.to_string();
        let now = Utc::now().timestamp();

        match self.cache.get(&key) {
            Ok(Some(entry)) if entry.is_fresh(now, self.stale_after) => {
                tracing::debug!(ip = %key, city = %entry.city, "Geolocation cache hit");
                return GeoLocation {
                    city: entry.city,
                    country: entry.country,
                };
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(ip = %key, "Geolocation cache unreadable, treating as miss: {}", e);
            }
        }

        for provider in &self.providers {
            match provider.locate(ip).await {
                Ok(location) => {
                    tracing::info!(
                        ip = %key,
                        provider = provider.name(),
                        city = %location.city,
                        "Resolved client location"
                    );
                    let entry = IpCacheEntry {
                        ip: key.clone(),
                        city: location.city.clone(),
                        country: location.country.clone(),
                        last_updated: now,
                    };
                    if let Err(e) = self.cache.upsert(&entry) {
                        tracing::warn!(ip = %key, "Failed to cache geolocation: {}", e);
                    }
                    return location;
                }
                Err(e) => {
                    tracing::warn!(
                        ip = %key,
                        provider = provider.name(),
                        "Geolocation provider failed: {}",
                        e
                    );
                }
            }
        }

        tracing::warn!(ip = %key, "No provider could locate IP, using {}", self.fallback_city);
        GeoLocation {
            city: self.fallback_city.clone(),
            country: UNKNOWN_COUNTRY.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{SqliteStore, StorageError};
    use crate::data::GeoError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Provider returning a fixed answer and counting calls
    struct StubProvider {
        answer: Option<GeoLocation>,
        calls: AtomicU32,
    }

    impl StubProvider {
        fn answering(city: &str, country: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: Some(GeoLocation {
                    city: city.to_string(),
                    country: country.to_string(),
                }),
                calls: AtomicU32::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                answer: None,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GeoProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn locate(&self, _ip: IpAddr) -> Result<GeoLocation, GeoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
                .clone()
                .ok_or_else(|| GeoError::Unresolved("stub failure".to_string()))
        }
    }

    struct BrokenCache;

    impl GeoCache for BrokenCache {
        fn get(&self, _ip: &str) -> crate::cache::Result<Option<IpCacheEntry>> {
            Err(StorageError::Corrupt("disk on fire".to_string()))
        }

        fn upsert(&self, _entry: &IpCacheEntry) -> crate::cache::Result<()> {
            Err(StorageError::Corrupt("disk on fire".to_string()))
        }
    }

    fn ip() -> IpAddr {
        "203.0.113.7".parse().expect("valid IP literal")
    }

    fn store() -> Arc<SqliteStore> {
        Arc::new(SqliteStore::open_in_memory().expect("in-memory database"))
    }

    fn resolver(cache: Arc<dyn GeoCache>, providers: Vec<Arc<dyn GeoProvider>>) -> GeoResolver {
        GeoResolver::new(
            cache,
            providers,
            Duration::from_secs(DEFAULT_GEO_STALE_SECS),
            "London",
        )
    }

    #[tokio::test]
    async fn test_fresh_cache_entry_skips_providers() {
        let cache = store();
        GeoCache::upsert(
            cache.as_ref(),
            &IpCacheEntry {
                ip: ip().to_string(),
                city: "Lisbon".to_string(),
                country: "Portugal".to_string(),
                last_updated: Utc::now().timestamp() - 3600,
            },
        )
        .expect("seed cache");
        let provider = StubProvider::answering("Elsewhere", "Nowhere");

        let location = resolver(cache, vec![provider.clone()]).resolve(ip()).await;

        assert_eq!(location.city, "Lisbon");
        assert_eq!(location.country, "Portugal");
        assert_eq!(provider.calls(), 0, "Fresh entry should not hit providers");
    }

    #[tokio::test]
    async fn test_stale_entry_is_refreshed_and_cached() {
        let cache = store();
        GeoCache::upsert(
            cache.as_ref(),
            &IpCacheEntry {
                ip: ip().to_string(),
                city: "Lisbon".to_string(),
                country: "Portugal".to_string(),
                last_updated: Utc::now().timestamp() - 2 * 86_400,
            },
        )
        .expect("seed cache");
        let provider = StubProvider::answering("Porto", "Portugal");

        let location = resolver(cache.clone(), vec![provider.clone()])
            .resolve(ip())
            .await;

        assert_eq!(location.city, "Porto");
        assert_eq!(provider.calls(), 1);
        let cached = GeoCache::get(cache.as_ref(), &ip().to_string())
            .expect("read cache")
            .expect("entry cached");
        assert_eq!(cached.city, "Porto");
    }

    #[tokio::test]
    async fn test_falls_through_to_next_provider() {
        let first = StubProvider::failing();
        let second = StubProvider::answering("Oslo", "Norway");

        let location = resolver(store(), vec![first.clone(), second.clone()])
            .resolve(ip())
            .await;

        assert_eq!(location.city, "Oslo");
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
    }

    #[tokio::test]
    async fn test_all_providers_failing_returns_fallback_uncached() {
        let cache = store();
        let first = StubProvider::failing();
        let second = StubProvider::failing();

        let location = resolver(cache.clone(), vec![first, second])
            .resolve(ip())
            .await;

        assert_eq!(location.city, "London");
        assert_eq!(location.country, UNKNOWN_COUNTRY);
        assert!(GeoCache::get(cache.as_ref(), &ip().to_string())
            .expect("read cache")
            .is_none());
    }

    #[tokio::test]
    async fn test_broken_cache_still_resolves() {
        let provider = StubProvider::answering("Oslo", "Norway");

        let location = resolver(Arc::new(BrokenCache), vec![provider.clone()])
            .resolve(ip())
            .await;

        assert_eq!(location.city, "Oslo");
        assert_eq!(provider.calls(), 1);
    }
}
