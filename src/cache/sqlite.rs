//! SQLite storage backend
//!
//! One table per store plus the search log. Every upsert is a single
//! `INSERT .. ON CONFLICT DO UPDATE` statement guarded on `last_updated`, so a
//! reader sees either the old row or the new one and timestamps never go back.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

use super::{GeoCache, Result, SearchLog, StorageError, WeatherRecordStore};
use crate::data::{IconCategory, IpCacheEntry, WeatherRecord};

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT_SECS: u64 = 10;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS weather_records (
        key TEXT PRIMARY KEY COLLATE NOCASE,
        city TEXT NOT NULL,
        temperature REAL NOT NULL,
        description TEXT NOT NULL,
        humidity INTEGER NOT NULL,
        wind_speed REAL NOT NULL,
        pressure REAL NOT NULL,
        visibility_km REAL NOT NULL,
        icon TEXT NOT NULL,
        longitude REAL NOT NULL,
        latitude REAL NOT NULL,
        last_updated INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS ip_cache (
        ip TEXT PRIMARY KEY,
        city TEXT NOT NULL,
        country TEXT NOT NULL,
        last_updated INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS searches (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        city TEXT NOT NULL,
        ip TEXT NOT NULL,
        searched_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_searches_searched_at ON searches(searched_at DESC);
"#;

/// Row shape before the icon and humidity columns are validated
struct WeatherRow {
    key: String,
    city: String,
    temperature: f64,
    description: String,
    humidity: i64,
    wind_speed: f64,
    pressure: f64,
    visibility_km: f64,
    icon: String,
    longitude: f64,
    latitude: f64,
    last_updated: i64,
}

impl TryFrom<WeatherRow> for WeatherRecord {
    type Error = StorageError;

    fn try_from(row: WeatherRow) -> Result<Self> {
        let icon = IconCategory::from_name(&row.icon)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown icon '{}'", row.icon)))?;
        let humidity = u8::try_from(row.humidity)
            .map_err(|_| StorageError::Corrupt(format!("humidity {}", row.humidity)))?;
        Ok(WeatherRecord {
            key: row.key,
            city: row.city,
            temperature: row.temperature,
            description: row.description,
            humidity,
            wind_speed: row.wind_speed,
            pressure: row.pressure,
            visibility_km: row.visibility_km,
            icon,
            longitude: row.longitude,
            latitude: row.latitude,
            last_updated: row.last_updated,
        })
    }
}

/// SQLite-backed weather store, geo cache and search log
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file, creating parent directories
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "Opened weather database");
        Self::with_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl WeatherRecordStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<WeatherRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT key, city, temperature, description, humidity, wind_speed, pressure, \
                 visibility_km, icon, longitude, latitude, last_updated \
                 FROM weather_records WHERE key = ?1",
                [key],
                |row| {
                    Ok(WeatherRow {
                        key: row.get(0)?,
                        city: row.get(1)?,
                        temperature: row.get(2)?,
                        description: row.get(3)?,
                        humidity: row.get(4)?,
                        wind_speed: row.get(5)?,
                        pressure: row.get(6)?,
                        visibility_km: row.get(7)?,
                        icon: row.get(8)?,
                        longitude: row.get(9)?,
                        latitude: row.get(10)?,
                        last_updated: row.get(11)?,
                    })
                },
            )
            .optional()?;
        row.map(WeatherRecord::try_from).transpose()
    }

    fn upsert(&self, record: &WeatherRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO weather_records (key, city, temperature, description, humidity, \
             wind_speed, pressure, visibility_km, icon, longitude, latitude, last_updated) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
             ON CONFLICT(key) DO UPDATE SET \
                city = excluded.city, \
                temperature = excluded.temperature, \
                description = excluded.description, \
                humidity = excluded.humidity, \
                wind_speed = excluded.wind_speed, \
                pressure = excluded.pressure, \
                visibility_km = excluded.visibility_km, \
                icon = excluded.icon, \
                longitude = excluded.longitude, \
                latitude = excluded.latitude, \
                last_updated = excluded.last_updated \
             WHERE excluded.last_updated >= weather_records.last_updated",
            params![
                record.key,
                record.city,
                record.temperature,
                record.description,
                record.humidity,
                record.wind_speed,
                record.pressure,
                record.visibility_km,
                record.icon.as_str(),
                record.longitude,
                record.latitude,
                record.last_updated,
            ],
        )?;
        Ok(())
    }
}

impl GeoCache for SqliteStore {
    fn get(&self, ip: &str) -> Result<Option<IpCacheEntry>> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                "SELECT ip, city, country, last_updated FROM ip_cache WHERE ip = ?1",
                [ip],
                |row| {
                    Ok(IpCacheEntry {
                        ip: row.get(0)?,
                        city: row.get(1)?,
                        country: row.get(2)?,
                        last_updated: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    fn upsert(&self, entry: &IpCacheEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ip_cache (ip, city, country, last_updated) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(ip) DO UPDATE SET \
                city = excluded.city, \
                country = excluded.country, \
                last_updated = excluded.last_updated \
             WHERE excluded.last_updated >= ip_cache.last_updated",
            params![entry.ip, entry.city, entry.country, entry.last_updated],
        )?;
        Ok(())
    }
}

impl SearchLog for SqliteStore {
    fn record_search(&self, city: &str, ip: &str, searched_at: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO searches (city, ip, searched_at) VALUES (?1, ?2, ?3)",
            params![city, ip, searched_at],
        )?;
        Ok(())
    }

    fn most_frequent(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let city = conn
            .query_row(
                "SELECT city FROM searches GROUP BY city \
                 ORDER BY COUNT(*) DESC, MAX(searched_at) DESC, MAX(id) DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(city)
    }

    fn most_recent(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let city = conn
            .query_row(
                "SELECT city FROM searches ORDER BY searched_at DESC, id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(city)
    }
}
