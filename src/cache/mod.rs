//! Persistent stores for weather records and IP geolocations
//!
//! Stores are passive keyed collaborators: `get` and an atomic whole-record
//! `upsert`, with no business logic. Freshness is decided by the caller from
//! each record's `last_updated`. Two backends are provided: SQLite
//! ([`SqliteStore`]) and one JSON file per key ([`FileStore`]).

mod manager;
mod sqlite;

pub use manager::FileStore;
pub use sqlite::SqliteStore;

use thiserror::Error;

use crate::data::{IpCacheEntry, WeatherRecord};

/// Errors raised by a storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be turned back into a record
    #[error("corrupt entry: {0}")]
    Corrupt(String),

    /// The backend never opened
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Keyed store of last-known weather per city
pub trait WeatherRecordStore: Send + Sync {
    /// Exact, case-insensitive lookup by normalized key
    fn get(&self, key: &str) -> Result<Option<WeatherRecord>>;

    /// Insert or replace the record under its key in a single write
    ///
    /// A record older than the stored one is ignored, so `last_updated`
    /// never moves backwards.
    fn upsert(&self, record: &WeatherRecord) -> Result<()>;
}

/// Keyed store of IP geolocations
pub trait GeoCache: Send + Sync {
    fn get(&self, ip: &str) -> Result<Option<IpCacheEntry>>;

    /// Same replace and monotonicity rules as [`WeatherRecordStore::upsert`]
    fn upsert(&self, entry: &IpCacheEntry) -> Result<()>;
}

/// Log of successful lookups
pub trait SearchLog: Send + Sync {
    fn record_search(&self, city: &str, ip: &str, searched_at: i64) -> Result<()>;

    /// City searched most often; ties go to the most recently searched
    fn most_frequent(&self) -> Result<Option<String>>;

    fn most_recent(&self) -> Result<Option<String>>;
}

/// Stand-in wired in when the configured backend fails to open
///
/// Every call fails with [`StorageError::Unavailable`], so lookups degrade to
/// placeholder results instead of the process refusing to start.
#[derive(Debug, Clone)]
pub struct UnavailableStore {
    reason: String,
}

impl UnavailableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn error(&self) -> StorageError {
        StorageError::Unavailable(self.reason.clone())
    }
}

impl WeatherRecordStore for UnavailableStore {
    fn get(&self, _key: &str) -> Result<Option<WeatherRecord>> {
        Err(self.error())
    }

    fn upsert(&self, _record: &WeatherRecord) -> Result<()> {
        Err(self.error())
    }
}

impl GeoCache for UnavailableStore {
    fn get(&self, _ip: &str) -> Result<Option<IpCacheEntry>> {
        Err(self.error())
    }

    fn upsert(&self, _entry: &IpCacheEntry) -> Result<()> {
        Err(self.error())
    }
}

impl SearchLog for UnavailableStore {
    fn record_search(&self, _city: &str, _ip: &str, _searched_at: i64) -> Result<()> {
        Err(self.error())
    }

    fn most_frequent(&self) -> Result<Option<String>> {
        Err(self.error())
    }

    fn most_recent(&self) -> Result<Option<String>> {
        Err(self.error())
    }
}
