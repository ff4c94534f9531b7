//! Cache-or-fetch weather lookup
//!
//! [`WeatherService`] turns a [`WeatherRequest`] into a
//! [`CanonicalWeatherResult`]. A stored record younger than the freshness
//! window is served as is. Otherwise the provider is asked (with retry and an
//! overall timeout), the answer is normalized, stored and returned.

use chrono::Utc;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{SearchLog, WeatherRecordStore};
use crate::data::country::country_code;
use crate::data::{
    normalize_key, CanonicalWeatherResult, ErrorKind, ProviderError, RawWeatherPayload,
    ResultSource, WeatherProvider, WeatherRecord,
};
use crate::resolver::{GeoResolver, UNKNOWN_COUNTRY};
use crate::retry::{with_retry, RetryPolicy};

/// Default freshness window for weather records (30 minutes)
pub const DEFAULT_WEATHER_STALE_SECS: u64 = 1800;

/// Default upper bound for one fetch including retries
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_FALLBACK_CITY: &str = "London";

/// IP recorded in the search log when the request carried none
const UNKNOWN_IP: &str = "unknown";

/// One inbound lookup. Coordinates win over a city name, which wins over the IP.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeatherRequest {
    pub city: Option<String>,
    pub ip: Option<IpAddr>,
    /// (latitude, longitude)
    pub coordinates: Option<(f64, f64)>,
}

impl WeatherRequest {
    pub fn for_city(city: impl Into<String>) -> Self {
        Self {
            city: Some(city.into()),
            ..Self::default()
        }
    }
}

/// Tunables for [`WeatherService`]
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Records at least this old are refetched
    pub stale_weather: Duration,
    pub retry: RetryPolicy,
    /// Bound on the whole fetch-with-retry sequence
    pub request_timeout: Duration,
    /// City used when the request names none and no IP is given
    pub fallback_city: String,
    /// Key records as `"city, country"` instead of the bare city
    pub country_keys: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            stale_weather: Duration::from_secs(DEFAULT_WEATHER_STALE_SECS),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            fallback_city: DEFAULT_FALLBACK_CITY.to_string(),
            country_keys: true,
        }
    }
}

/// Orchestrates store, provider and IP resolver for weather lookups
///
/// Holds no per-request state; share it behind an `Arc` and call
/// [`handle`](Self::handle) from as many tasks as needed.
pub struct WeatherService {
    store: Arc<dyn WeatherRecordStore>,
    provider: Arc<dyn WeatherProvider>,
    resolver: Arc<GeoResolver>,
    search_log: Option<Arc<dyn SearchLog>>,
    config: ServiceConfig,
}

impl WeatherService {
    pub fn new(
        store: Arc<dyn WeatherRecordStore>,
        provider: Arc<dyn WeatherProvider>,
        resolver: Arc<GeoResolver>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            provider,
            resolver,
            search_log: None,
            config,
        }
    }

    /// Record successful lookups in `log`
    pub fn with_search_log(mut self, log: Arc<dyn SearchLog>) -> Self {
        self.search_log = Some(log);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Answer one request.
    ///
    /// # Arguments
    /// * `request` - Coordinates, city name and/or client IP
    ///
    /// # Returns
    /// Weather tagged with its source, or an error carrying one of the fixed
    /// user-facing messages. Never panics and never returns a partial record.
    pub async fn handle(&self, request: &WeatherRequest) -> CanonicalWeatherResult {
        let city = request
            .city
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        let result = if let Some((lat, lon)) = request.coordinates {
            self.resolve_coordinates(lat, lon).await
        } else if let Some(city) = city {
            self.resolve_city(city, None).await
        } else if let Some(ip) = request.ip {
            let location = self.resolver.resolve(ip).await;
            let country = Some(location.country.as_str()).filter(|c| *c != UNKNOWN_COUNTRY);
            self.resolve_city(&location.city, country).await
        } else {
            self.resolve_city(&self.config.fallback_city, None).await
        };

        self.log_search(&result, request.ip);
        result
    }

    /// Serve `city` from the store when fresh, otherwise fetch and store it
    async fn resolve_city(&self, city: &str, country: Option<&str>) -> CanonicalWeatherResult {
        let lookup_key = match country {
            Some(country) if self.config.country_keys => {
                normalize_key(&format!("{}, {}", city, country))
            }
            _ => normalize_key(city),
        };
        let now = Utc::now().timestamp();

        match self.store.get(&lookup_key) {
            Ok(Some(record)) if record.is_fresh(now, self.config.stale_weather) => {
                tracing::debug!(key = %lookup_key, "Serving fresh record from store");
                return CanonicalWeatherResult::from_record(&record, ResultSource::Cache);
            }
            Ok(Some(record)) => {
                tracing::debug!(
                    key = %lookup_key,
                    age_secs = now - record.last_updated,
                    "Stored record is stale"
                );
            }
            Ok(None) => tracing::debug!(key = %lookup_key, "No stored record"),
            Err(e) => {
                tracing::warn!(key = %lookup_key, "Record store unavailable, serving placeholder: {}", e);
                let placeholder = WeatherRecord::placeholder(city, now);
                return CanonicalWeatherResult::from_record(&placeholder, ResultSource::Fallback);
            }
        }

        // Pin the upstream query to the country when its code is known
        let code = country.and_then(country_code);
        let query = match code {
            Some(code) => format!("{},{}", city, code),
            None => city.to_string(),
        };

        let payload = match self.fetch(|| self.provider.fetch_by_city(&query)).await {
            Ok(payload) => payload,
            Err(kind) => return CanonicalWeatherResult::error(kind),
        };

        let record = payload.normalize(self.config.country_keys, Utc::now().timestamp());
        self.store_record(&record);
        if record.key != lookup_key {
            if matches_country(&payload, country, code) {
                self.store_record(&record.with_key(&lookup_key));
            } else {
                tracing::warn!(
                    key = %lookup_key,
                    fetched = %record.key,
                    "Provider answered for another country, not aliasing"
                );
            }
        }

        CanonicalWeatherResult::from_record(&record, ResultSource::Provider)
    }

    /// Coordinate lookups always go to the provider
    async fn resolve_coordinates(&self, lat: f64, lon: f64) -> CanonicalWeatherResult {
        match self
            .fetch(|| self.provider.fetch_by_coordinates(lat, lon))
            .await
        {
            Ok(payload) => {
                let record = payload.normalize(self.config.country_keys, Utc::now().timestamp());
                self.store_record(&record);
                CanonicalWeatherResult::from_record(&record, ResultSource::Provider)
            }
            Err(kind) => CanonicalWeatherResult::error(kind),
        }
    }

    /// Run a provider call under the retry policy and the overall timeout
    async fn fetch<F, Fut>(&self, operation: F) -> Result<RawWeatherPayload, ErrorKind>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<RawWeatherPayload, ProviderError>>,
    {
        let attempt = with_retry(&self.config.retry, operation);
        match tokio::time::timeout(self.config.request_timeout, attempt).await {
            Ok(Ok(payload)) => {
                tracing::info!(city = %payload.name, "Fetched weather from provider");
                Ok(payload)
            }
            Ok(Err(e)) => {
                tracing::warn!("Weather fetch failed: {}", e);
                Err(e.kind())
            }
            Err(_) => {
                tracing::error!(
                    "Weather fetch timed out after {:?}",
                    self.config.request_timeout
                );
                Err(ErrorKind::Transient)
            }
        }
    }

    /// Upsert a fetched record; failures only cost the next request a refetch
    fn store_record(&self, record: &WeatherRecord) {
        match self.store.upsert(record) {
            Ok(()) => tracing::info!(key = %record.key, "Stored weather record"),
            Err(e) => tracing::warn!(key = %record.key, "Failed to store weather record: {}", e),
        }
    }

    fn log_search(&self, result: &CanonicalWeatherResult, ip: Option<IpAddr>) {
        let (Some(log), Some(weather)) = (&self.search_log, result.weather()) else {
            return;
        };
        let ip = ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_IP.to_string());
        if let Err(e) = log.record_search(&weather.city, &ip, Utc::now().timestamp()) {
            tracing::warn!("Failed to record search: {}", e);
        }
    }
}

/// Whether `payload` lies in the requested country (always true when none was requested)
fn matches_country(payload: &RawWeatherPayload, country: Option<&str>, code: Option<&str>) -> bool {
    let Some(country) = country else {
        return true;
    };
    match (code, payload.country_code.as_deref()) {
        (Some(wanted), Some(got)) => wanted.eq_ignore_ascii_case(got.trim()),
        _ => payload
            .country()
            .is_some_and(|name| name.eq_ignore_ascii_case(country.trim())),
    }
}
