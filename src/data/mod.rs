//! Core data models for cloudcast
//!
//! This module contains the records persisted by the caches and the canonical
//! result handed back to callers, plus the upstream provider clients that
//! produce them.

pub mod country;
pub mod geo;
pub mod weather;

pub use geo::{GeoError, GeoLocation, GeoProvider, IpApiProvider, IpInfoProvider};
pub use weather::{
    icon_code_to_category, OpenWeatherClient, ProviderError, RawWeatherPayload, WeatherProvider,
};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message for unknown cities and unusable upstream responses
pub const CITY_NOT_FOUND: &str = "City not Found";

/// Message for inputs that resolve to something other than a city
pub const NOT_A_VALID_CITY: &str = "This is not a valid city";

/// Message once transient failures have used up every attempt
pub const FETCH_EXHAUSTED: &str = "Unable to fetch weather data after multiple attempts.";

/// Normalizes a city (or `"City, Country"`) string into a cache key.
///
/// Trims, collapses inner whitespace and lowercases, so `"  New   York "` and
/// `"new york"` address the same record.
pub fn normalize_key(city: &str) -> String {
    city.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Returns true when `last_updated` is strictly younger than `window` at `now`
fn within_window(last_updated: i64, now: i64, window: Duration) -> bool {
    let window = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
    now.saturating_sub(last_updated) < window
}

/// Normalized weather-condition bucket derived from upstream icon codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IconCategory {
    Sunny,
    Moon,
    Cloudy,
    Scattered,
    Broken,
    Rainy,
    Thunder,
    Snowy,
    Foggy,
}

impl IconCategory {
    /// Every category, in display order
    pub const ALL: [IconCategory; 9] = [
        IconCategory::Sunny,
        IconCategory::Moon,
        IconCategory::Cloudy,
        IconCategory::Scattered,
        IconCategory::Broken,
        IconCategory::Rainy,
        IconCategory::Thunder,
        IconCategory::Snowy,
        IconCategory::Foggy,
    ];

    /// Stable lowercase name, as stored and serialized
    pub fn as_str(&self) -> &'static str {
        match self {
            IconCategory::Sunny => "sunny",
            IconCategory::Moon => "moon",
            IconCategory::Cloudy => "cloudy",
            IconCategory::Scattered => "scattered",
            IconCategory::Broken => "broken",
            IconCategory::Rainy => "rainy",
            IconCategory::Thunder => "thunder",
            IconCategory::Snowy => "snowy",
            IconCategory::Foggy => "foggy",
        }
    }

    /// Parses a stored category name; the inverse of [`IconCategory::as_str`]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

/// Last-known weather for one city key
///
/// Records are written whole on every refresh and never deleted; freshness is
/// decided at read time with [`WeatherRecord::is_fresh`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    /// Normalized lookup key (see [`normalize_key`])
    pub key: String,
    /// City name for display, original casing
    pub city: String,
    /// Temperature in Celsius
    pub temperature: f64,
    /// Short text description, e.g. "light rain"
    pub description: String,
    /// Relative humidity percentage (0-100)
    pub humidity: u8,
    /// Wind speed in m/s
    pub wind_speed: f64,
    /// Atmospheric pressure in hPa
    pub pressure: f64,
    /// Visibility in kilometers
    pub visibility_km: f64,
    /// Icon category
    pub icon: IconCategory,
    pub longitude: f64,
    pub latitude: f64,
    /// When this record was fetched, epoch seconds
    pub last_updated: i64,
}

impl WeatherRecord {
    /// Whether the record can be served without asking the provider
    pub fn is_fresh(&self, now: i64, window: Duration) -> bool {
        within_window(self.last_updated, now, window)
    }

    /// Fixed stand-in served when the record store cannot be reached
    pub fn placeholder(city: &str, now: i64) -> Self {
        Self {
            key: normalize_key(city),
            city: city.trim().to_string(),
            temperature: 0.0,
            description: "weather data unavailable".to_string(),
            humidity: 0,
            wind_speed: 0.0,
            pressure: 0.0,
            visibility_km: 0.0,
            icon: IconCategory::Cloudy,
            longitude: 0.0,
            latitude: 0.0,
            last_updated: now,
        }
    }

    /// Copy of this record addressed by another key
    pub fn with_key(&self, key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..self.clone()
        }
    }

    /// The caller-facing view of this record
    pub fn view(&self) -> WeatherView {
        WeatherView {
            city: self.city.clone(),
            temperature: self.temperature,
            description: self.description.clone(),
            humidity: self.humidity,
            windspeed: self.wind_speed,
            pressure: self.pressure,
            visibility: self.visibility_km,
            icon: self.icon,
            lon: self.longitude,
            lat: self.latitude,
        }
    }
}

/// Cached geolocation of one client IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpCacheEntry {
    pub ip: String,
    pub city: String,
    pub country: String,
    /// When this entry was resolved, epoch seconds
    pub last_updated: i64,
}

impl IpCacheEntry {
    /// Whether the entry can be served without asking a geolocation provider
    pub fn is_fresh(&self, now: i64, window: Duration) -> bool {
        within_window(self.last_updated, now, window)
    }
}

/// Populated weather as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherView {
    pub city: String,
    pub temperature: f64,
    pub description: String,
    pub humidity: u8,
    pub windspeed: f64,
    pub pressure: f64,
    /// Kilometers
    pub visibility: f64,
    pub icon: IconCategory,
    pub lon: f64,
    pub lat: f64,
}

/// Which source backs a populated result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// Served from a fresh stored record
    Cache,
    /// Fetched from the upstream provider during this request
    Provider,
    /// Placeholder served because the store was unreachable
    Fallback,
}

/// Failure categories surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Transient,
    Malformed,
}

impl ErrorKind {
    /// The fixed user-facing message for this kind
    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::NotFound | ErrorKind::Malformed => CITY_NOT_FOUND,
            ErrorKind::InvalidInput => NOT_A_VALID_CITY,
            ErrorKind::Transient => FETCH_EXHAUSTED,
        }
    }
}

/// The value handed back for one weather request: weather or an error, never both
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CanonicalWeatherResult {
    Weather {
        #[serde(flatten)]
        weather: WeatherView,
        source: ResultSource,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl CanonicalWeatherResult {
    /// Builds a populated result from a record
    pub fn from_record(record: &WeatherRecord, source: ResultSource) -> Self {
        CanonicalWeatherResult::Weather {
            weather: record.view(),
            source,
        }
    }

    /// Builds an error result carrying the kind's fixed message
    pub fn error(kind: ErrorKind) -> Self {
        CanonicalWeatherResult::Error {
            kind,
            message: kind.message().to_string(),
        }
    }

    pub fn weather(&self) -> Option<&WeatherView> {
        match self {
            CanonicalWeatherResult::Weather { weather, .. } => Some(weather),
            CanonicalWeatherResult::Error { .. } => None,
        }
    }

    pub fn source(&self) -> Option<ResultSource> {
        match self {
            CanonicalWeatherResult::Weather { source, .. } => Some(*source),
            CanonicalWeatherResult::Error { .. } => None,
        }
    }

    /// The user-facing error message, if this is an error result
    pub fn error_message(&self) -> Option<&str> {
        match self {
            CanonicalWeatherResult::Weather { .. } => None,
            CanonicalWeatherResult::Error { message, .. } => Some(message),
        }
    }
}
