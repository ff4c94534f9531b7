//! Command-line interface parsing for cloudcast
//!
//! This module handles parsing of CLI arguments using clap. Every tunable can
//! also be set through the environment; [`Settings::from_cli`] validates the
//! parsed arguments and turns them into lookup requests plus service
//! configuration.

use clap::{Parser, ValueEnum};
use directories::ProjectDirs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::resolver::DEFAULT_GEO_STALE_SECS;
use crate::retry::{RetryPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS};
use crate::service::{
    ServiceConfig, WeatherRequest, DEFAULT_FALLBACK_CITY, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_WEATHER_STALE_SECS,
};

/// SQLite file name inside the data directory
const DB_FILE_NAME: &str = "cloudcast.db";

/// Error types for CLI argument validation
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid latitude: {0}. Must be between -90 and 90")]
    InvalidLatitude(f64),

    #[error("Invalid longitude: {0}. Must be between -180 and 180")]
    InvalidLongitude(f64),

    #[error("Invalid IP address: '{0}'")]
    InvalidIp(String),

    #[error("No OpenWeatherMap API key. Pass --api-key or set OPENWEATHER_API_KEY")]
    MissingApiKey,

    #[error("Could not determine a data directory. Pass --db <PATH>")]
    NoDataDir,
}

/// Storage backend for weather records and geolocations
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default)]
pub enum StoreKind {
    /// Single SQLite database file
    #[default]
    Sqlite,
    /// Directory of JSON files, one per key
    Json,
}

/// cloudcast - current weather by city, coordinates or client IP
#[derive(Parser, Debug)]
#[command(name = "cloudcast")]
#[command(about = "Current weather by city, coordinates or client IP, served from a local cache while fresh")]
#[command(version)]
pub struct Cli {
    /// City to look up; repeat to look up several at once
    ///
    /// Examples:
    ///   cloudcast --city London
    ///   cloudcast --city "New York" --city Tokyo
    #[arg(long = "city", value_name = "CITY")]
    pub cities: Vec<String>,

    /// Client IP to geolocate when no city or coordinates are given
    #[arg(long, env = "CLIENT_IP", value_name = "IP")]
    pub ip: Option<String>,

    /// Latitude for a coordinate lookup (requires --lon)
    #[arg(long, requires = "lon", allow_negative_numbers = true)]
    pub lat: Option<f64>,

    /// Longitude for a coordinate lookup (requires --lat)
    #[arg(long, requires = "lat", allow_negative_numbers = true)]
    pub lon: Option<f64>,

    /// Seconds before a stored weather record is refetched
    #[arg(long, env = "STALE_THRESHOLD_WEATHER", value_name = "SECS", default_value_t = DEFAULT_WEATHER_STALE_SECS)]
    pub stale_weather: u64,

    /// Seconds before a cached IP geolocation is refetched
    #[arg(long, env = "STALE_THRESHOLD_GEO", value_name = "SECS", default_value_t = DEFAULT_GEO_STALE_SECS)]
    pub stale_geo: u64,

    /// Total attempts per provider fetch
    #[arg(long, env = "MAX_RETRIES", value_name = "N", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_retries: u32,

    /// Delay after the first failed attempt; doubles each retry
    #[arg(long, env = "RETRY_BASE_DELAY_MS", value_name = "MS", default_value_t = DEFAULT_BASE_DELAY_MS)]
    pub retry_base_ms: u64,

    /// Upper bound in seconds for one fetch including retries
    #[arg(long, env = "REQUEST_TIMEOUT", value_name = "SECS", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub timeout: u64,

    /// City used when nothing else identifies a location
    #[arg(long, env = "FALLBACK_CITY", value_name = "CITY", default_value = DEFAULT_FALLBACK_CITY)]
    pub fallback_city: String,

    /// Key records by bare city name instead of "city, country"
    #[arg(long, env = "NO_COUNTRY_KEYS")]
    pub no_country_keys: bool,

    /// OpenWeatherMap API key
    #[arg(long, env = "OPENWEATHER_API_KEY", value_name = "KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Override the OpenWeatherMap endpoint
    #[arg(long, env = "OPENWEATHER_BASE_URL", value_name = "URL")]
    pub weather_url: Option<String>,

    /// Override the ip-api.com endpoint
    #[arg(long, env = "IP_API_BASE_URL", value_name = "URL")]
    pub ip_api_url: Option<String>,

    /// Override the ipinfo.io endpoint
    #[arg(long, env = "IPINFO_BASE_URL", value_name = "URL")]
    pub ipinfo_url: Option<String>,

    /// ipinfo.io access token
    #[arg(long, env = "IPINFO_TOKEN", value_name = "TOKEN", hide_env_values = true)]
    pub ipinfo_token: Option<String>,

    /// Storage backend
    #[arg(long, env = "CLOUDCAST_STORE", value_enum, default_value_t = StoreKind::Sqlite)]
    pub store: StoreKind,

    /// Database file (sqlite) or directory (json); defaults to the user data directory
    #[arg(long, env = "CLOUDCAST_DB", value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Print the most frequently and most recently searched cities
    #[arg(long)]
    pub history: bool,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long)]
    pub verbose: bool,
}

/// Endpoint overrides and credentials for the upstream services
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    pub api_key: Option<String>,
    pub weather_url: Option<String>,
    pub ip_api_url: Option<String>,
    pub ipinfo_url: Option<String>,
    pub ipinfo_token: Option<String>,
}

/// Validated configuration derived from CLI arguments
#[derive(Debug, Clone)]
pub struct Settings {
    /// Lookups to run; empty when only `--history` was asked for
    pub requests: Vec<WeatherRequest>,
    pub service: ServiceConfig,
    pub stale_geo: Duration,
    pub endpoints: Endpoints,
    pub store: StoreKind,
    /// Resolved database file or JSON directory
    pub store_path: PathBuf,
    pub history: bool,
}

/// Checks a coordinate pair against the valid ranges.
///
/// # Returns
/// * `Ok(())` when latitude is within [-90, 90] and longitude within [-180, 180]
/// * `Err(CliError)` naming the first value out of range
pub fn validate_coordinates(lat: f64, lon: f64) -> Result<(), CliError> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(CliError::InvalidLatitude(lat));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(CliError::InvalidLongitude(lon));
    }
    Ok(())
}

/// Parses a client IP argument.
pub fn parse_ip_arg(s: &str) -> Result<IpAddr, CliError> {
    s.trim()
        .parse()
        .map_err(|_| CliError::InvalidIp(s.to_string()))
}

impl Settings {
    /// Creates Settings from parsed CLI arguments.
    ///
    /// # Arguments
    /// * `cli` - The parsed CLI struct
    ///
    /// # Returns
    /// * `Ok(Settings)` with requests built in priority order: coordinates,
    ///   then one request per `--city`, then the client IP (or the fallback
    ///   city when no IP is given either)
    /// * `Err(CliError)` for out-of-range coordinates, a bad IP, a lookup
    ///   without an API key, or no usable data directory
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        let ip = cli.ip.as_deref().map(parse_ip_arg).transpose()?;

        let coordinates = match (cli.lat, cli.lon) {
            (Some(lat), Some(lon)) => {
                validate_coordinates(lat, lon)?;
                Some((lat, lon))
            }
            _ => None,
        };

        let requests = if coordinates.is_some() {
            vec![WeatherRequest {
                city: None,
                ip,
                coordinates,
            }]
        } else if !cli.cities.is_empty() {
            cli.cities
                .iter()
                .map(|city| WeatherRequest {
                    city: Some(city.clone()),
                    ip,
                    coordinates: None,
                })
                .collect()
        } else if cli.history && ip.is_none() {
            Vec::new()
        } else {
            vec![WeatherRequest {
                city: None,
                ip,
                coordinates: None,
            }]
        };

        if !requests.is_empty() && cli.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(CliError::MissingApiKey);
        }

        let store_path = match &cli.db {
            Some(path) => path.clone(),
            None => default_store_path(cli.store)?,
        };

        let service = ServiceConfig {
            stale_weather: Duration::from_secs(cli.stale_weather),
            retry: RetryPolicy::new(cli.max_retries, cli.retry_base_ms, DEFAULT_MAX_DELAY_MS),
            request_timeout: Duration::from_secs(cli.timeout),
            fallback_city: cli.fallback_city.clone(),
            country_keys: !cli.no_country_keys,
        };

        Ok(Settings {
            requests,
            service,
            stale_geo: Duration::from_secs(cli.stale_geo),
            endpoints: Endpoints {
                api_key: cli.api_key.clone(),
                weather_url: cli.weather_url.clone(),
                ip_api_url: cli.ip_api_url.clone(),
                ipinfo_url: cli.ipinfo_url.clone(),
                ipinfo_token: cli.ipinfo_token.clone(),
            },
            store: cli.store,
            store_path,
            history: cli.history,
        })
    }
}

/// Location under the XDG data directory (`~/.local/share/cloudcast/` on Linux)
fn default_store_path(kind: StoreKind) -> Result<PathBuf, CliError> {
    let dirs = ProjectDirs::from("", "", "cloudcast").ok_or(CliError::NoDataDir)?;
    let dir = dirs.data_dir().to_path_buf();
    Ok(match kind {
        StoreKind::Sqlite => dir.join(DB_FILE_NAME),
        StoreKind::Json => dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Parses `args` after pinning every env-backed option that has a
    /// command-line value, so the runner's environment cannot leak in.
    /// A flag that appears in `args` replaces its pinned value.
    fn parse(args: &[&str]) -> Cli {
        let pinned = [
            "--api-key",
            "test-key",
            "--db",
            "/tmp/cloudcast-test.db",
            "--store",
            "sqlite",
            "--stale-weather",
            "1800",
            "--stale-geo",
            "86400",
            "--max-retries",
            "3",
            "--retry-base-ms",
            "1000",
            "--timeout",
            "30",
            "--fallback-city",
            "London",
        ];
        let mut argv = vec!["cloudcast"];
        for pair in pinned.chunks(2) {
            if !args.contains(&pair[0]) {
                argv.extend_from_slice(pair);
            }
        }
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("arguments should parse")
    }

    #[test]
    fn test_validate_coordinates_bounds() {
        assert!(validate_coordinates(90.0, 180.0).is_ok());
        assert!(validate_coordinates(-90.0, -180.0).is_ok());
        assert!(matches!(
            validate_coordinates(90.5, 0.0),
            Err(CliError::InvalidLatitude(_))
        ));
        assert!(matches!(
            validate_coordinates(0.0, -180.1),
            Err(CliError::InvalidLongitude(_))
        ));
        assert!(validate_coordinates(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_parse_ip_arg() {
        assert_eq!(
            parse_ip_arg(" 1.2.3.4 ").expect("valid v4"),
            "1.2.3.4".parse::<IpAddr>().expect("literal")
        );
        assert!(parse_ip_arg("2001:db8::1").is_ok());
        assert!(matches!(
            parse_ip_arg("not-an-ip"),
            Err(CliError::InvalidIp(_))
        ));
    }

    #[test]
    fn test_one_request_per_city() {
        let settings = Settings::from_cli(&parse(&["--city", "Paris", "--city", "Oslo"]))
            .expect("valid arguments");
        let cities: Vec<_> = settings
            .requests
            .iter()
            .map(|r| r.city.as_deref())
            .collect();
        assert_eq!(cities, vec![Some("Paris"), Some("Oslo")]);
    }

    #[test]
    fn test_coordinates_replace_city_requests() {
        let settings = Settings::from_cli(&parse(&["--city", "Paris", "--lat", "-33.9", "--lon", "18.4"]))
            .expect("valid arguments");
        assert_eq!(settings.requests.len(), 1);
        assert_eq!(settings.requests[0].coordinates, Some((-33.9, 18.4)));
    }

    #[test]
    fn test_out_of_range_latitude_rejected() {
        let result = Settings::from_cli(&parse(&["--lat", "91", "--lon", "0"]));
        assert!(matches!(result, Err(CliError::InvalidLatitude(_))));
    }

    #[test]
    fn test_no_country_keys_flag() {
        let settings = Settings::from_cli(&parse(&["--city", "Paris", "--no-country-keys"]))
            .expect("valid arguments");
        assert!(!settings.service.country_keys);
    }

    #[test]
    fn test_retry_and_timeout_settings() {
        let settings = Settings::from_cli(&parse(&[
            "--city",
            "Paris",
            "--max-retries",
            "5",
            "--retry-base-ms",
            "250",
            "--timeout",
            "12",
        ]))
        .expect("valid arguments");
        assert_eq!(settings.service.retry.max_attempts, 5);
        assert_eq!(settings.service.retry.base_delay, Duration::from_millis(250));
        assert_eq!(settings.service.request_timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_history_alone_needs_no_requests() {
        let cli = Cli::parse_from(["cloudcast", "--history", "--db", "/tmp/cloudcast-test.db"]);
        if cli.ip.is_some() {
            // CLIENT_IP set in the environment turns this into a lookup
            return;
        }
        let settings = Settings::from_cli(&cli).expect("history needs no API key");
        assert!(settings.requests.is_empty());
        assert!(settings.history);
    }

    #[test]
    fn test_pinned_options_ignore_environment() {
        let settings = Settings::from_cli(&parse(&["--city", "Paris"])).expect("valid arguments");
        assert_eq!(settings.store, StoreKind::Sqlite);
        assert_eq!(settings.service.retry.max_attempts, 3);
        assert_eq!(settings.service.stale_weather, Duration::from_secs(1800));
        assert_eq!(settings.stale_geo, Duration::from_secs(86_400));
        assert_eq!(settings.service.fallback_city, "London");
    }

    #[test]
    fn test_explicit_db_path_used() {
        let settings = Settings::from_cli(&parse(&["--city", "Paris", "--store", "json"]))
            .expect("valid arguments");
        assert_eq!(settings.store, StoreKind::Json);
        assert_eq!(settings.store_path, PathBuf::from("/tmp/cloudcast-test.db"));
    }
}
