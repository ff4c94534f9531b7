//! JSON file storage backend
//!
//! Provides a `FileStore` that keeps one JSON file per record, split into a
//! `weather/` and a `geo/` directory. Writes go to a temporary file that is
//! then renamed over the old one, so a reader sees either the previous record
//! or the new one, never a partial file.

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{GeoCache, Result, WeatherRecordStore};
use crate::data::{IpCacheEntry, WeatherRecord};

/// Subdirectory for weather records
const WEATHER_DIR: &str = "weather";

/// Subdirectory for IP geolocations
const GEO_DIR: &str = "geo";

/// Wrapper struct for records stored on disk
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry<T> {
    /// Full key; file names are lossy, so reads check this
    key: String,
    /// The stored record
    data: T,
    /// When the file was written
    stored_at: DateTime<Utc>,
}

/// Reads and writes records as JSON files
///
/// The default location is an XDG-compliant data directory
/// (`~/.local/share/cloudcast/` on Linux). Writers are serialized within the
/// process so the read-compare-replace that keeps `last_updated` monotonic
/// cannot interleave.
#[derive(Debug)]
pub struct FileStore {
    /// Directory holding the `weather/` and `geo/` subdirectories
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Creates a new FileStore using the XDG-compliant data directory
    ///
    /// Returns `None` if the directory cannot be determined (e.g., no home directory).
    pub fn new() -> Option<Self> {
        let project_dirs = ProjectDirs::from("", "", "cloudcast")?;
        Some(Self::with_dir(project_dirs.data_dir().to_path_buf()))
    }

    /// Creates a new FileStore rooted at a custom directory
    pub fn with_dir(root: PathBuf) -> Self {
        Self {
            root,
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path of the file holding `key` in `kind`
    fn entry_path(&self, kind: &str, key: &str) -> PathBuf {
        let stem: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.root.join(kind).join(format!("{}.json", stem))
    }

    /// Reads the record stored under `key`, if any
    fn read<T: DeserializeOwned>(&self, kind: &str, key: &str) -> Result<Option<T>> {
        let key = key.to_lowercase();
        let content = match fs::read_to_string(self.entry_path(kind, &key)) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: StoredEntry<T> = serde_json::from_str(&content)?;

        // Another key that maps to the same file name
        if entry.key != key {
            return Ok(None);
        }
        Ok(Some(entry.data))
    }

    /// Replaces the record under `key` unless the stored one is newer
    fn write_if_newer<T, F>(&self, kind: &str, key: &str, data: &T, last_updated: F) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&T) -> i64,
    {
        let _guard = self.write_lock.lock();

        if let Some(existing) = self.read::<T>(kind, key)? {
            if last_updated(&existing) > last_updated(data) {
                tracing::debug!(kind, key, "Ignoring write older than the stored record");
                return Ok(());
            }
        }

        let key = key.to_lowercase();
        let path = self.entry_path(kind, &key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let entry = StoredEntry {
            key,
            data,
            stored_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&entry)?;

        let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl WeatherRecordStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<WeatherRecord>> {
        self.read(WEATHER_DIR, key)
    }

    fn upsert(&self, record: &WeatherRecord) -> Result<()> {
        self.write_if_newer(WEATHER_DIR, &record.key, record, |r: &WeatherRecord| {
            r.last_updated
        })
    }
}

impl GeoCache for FileStore {
    fn get(&self, ip: &str) -> Result<Option<IpCacheEntry>> {
        self.read(GEO_DIR, ip)
    }

    fn upsert(&self, entry: &IpCacheEntry) -> Result<()> {
        self.write_if_newer(GEO_DIR, &entry.ip, entry, |e: &IpCacheEntry| e.last_updated)
    }
}
