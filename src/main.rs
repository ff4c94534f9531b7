//! cloudcast - current weather by city, coordinates or client IP
//!
//! Resolves each request through the cache-or-fetch service and prints the
//! results as JSON on stdout. Logs go to stderr.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use futures::future::join_all;
use tracing_subscriber::EnvFilter;

use cloudcast::cache::{
    FileStore, GeoCache, SearchLog, SqliteStore, StorageError, UnavailableStore, WeatherRecordStore,
};
use cloudcast::cli::{Cli, Endpoints, Settings, StoreKind};
use cloudcast::data::{GeoProvider, IpApiProvider, IpInfoProvider, OpenWeatherClient};
use cloudcast::resolver::GeoResolver;
use cloudcast::service::WeatherService;

/// Store handles, one per concern, possibly backed by the same object
struct Stores {
    weather: Arc<dyn WeatherRecordStore>,
    geo: Arc<dyn GeoCache>,
    searches: Option<Arc<dyn SearchLog>>,
}

/// Sets up tracing on stderr so stdout stays machine-readable
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

impl Stores {
    /// Every handle fails, so lookups answer with placeholder results
    fn unavailable(reason: String) -> Self {
        let store = Arc::new(UnavailableStore::new(reason));
        Stores {
            weather: store.clone(),
            geo: store.clone(),
            searches: Some(store),
        }
    }
}

fn open_stores(kind: StoreKind, path: &Path) -> Result<Stores, StorageError> {
    match kind {
        StoreKind::Sqlite => {
            let store = Arc::new(SqliteStore::open(path)?);
            Ok(Stores {
                weather: store.clone(),
                geo: store.clone(),
                searches: Some(store),
            })
        }
        StoreKind::Json => {
            let store = Arc::new(FileStore::with_dir(path.to_path_buf()));
            Ok(Stores {
                weather: store.clone(),
                geo: store,
                searches: None,
            })
        }
    }
}

fn geo_providers(endpoints: &Endpoints) -> Result<Vec<Arc<dyn GeoProvider>>, reqwest::Error> {
    let mut ip_api = IpApiProvider::new()?;
    if let Some(url) = &endpoints.ip_api_url {
        ip_api = ip_api.with_base_url(url.clone());
    }
    let mut ipinfo = IpInfoProvider::new(endpoints.ipinfo_token.clone())?;
    if let Some(url) = &endpoints.ipinfo_url {
        ipinfo = ipinfo.with_base_url(url.clone());
    }
    let providers: Vec<Arc<dyn GeoProvider>> = vec![Arc::new(ip_api), Arc::new(ipinfo)];
    Ok(providers)
}

fn print_history(log: Option<&Arc<dyn SearchLog>>) -> Result<(), Box<dyn std::error::Error>> {
    let (most_frequent, most_recent) = match log {
        Some(log) => {
            let read = |result: cloudcast::cache::Result<Option<String>>| {
                result.unwrap_or_else(|e| {
                    tracing::warn!("Search history unavailable: {}", e);
                    None
                })
            };
            (read(log.most_frequent()), read(log.most_recent()))
        }
        None => {
            tracing::warn!("Search history is only kept by the sqlite store");
            (None, None)
        }
    };
    let history = serde_json::json!({
        "most_frequent": most_frequent,
        "most_recent": most_recent,
    });
    println!("{}", serde_json::to_string_pretty(&history)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = Settings::from_cli(&cli)?;
    let stores = match open_stores(settings.store, &settings.store_path) {
        Ok(stores) => {
            tracing::debug!(path = %settings.store_path.display(), store = ?settings.store, "Opened store");
            stores
        }
        Err(e) => {
            tracing::warn!(
                path = %settings.store_path.display(),
                "Could not open store, serving placeholders: {}",
                e
            );
            Stores::unavailable(e.to_string())
        }
    };

    if !settings.requests.is_empty() {
        let api_key = settings.endpoints.api_key.clone().unwrap_or_default();
        let mut weather = OpenWeatherClient::new(api_key)?;
        if let Some(url) = &settings.endpoints.weather_url {
            weather = weather.with_base_url(url.clone());
        }

        let resolver = GeoResolver::new(
            stores.geo.clone(),
            geo_providers(&settings.endpoints)?,
            settings.stale_geo,
            settings.service.fallback_city.clone(),
        );

        let mut service = WeatherService::new(
            stores.weather.clone(),
            Arc::new(weather),
            Arc::new(resolver),
            settings.service.clone(),
        );
        if let Some(log) = &stores.searches {
            service = service.with_search_log(log.clone());
        }

        let results = join_all(settings.requests.iter().map(|r| service.handle(r))).await;
        let output = if results.len() == 1 {
            serde_json::to_string_pretty(&results[0])?
        } else {
            serde_json::to_string_pretty(&results)?
        };
        println!("{}", output);
    }

    if settings.history {
        print_history(stores.searches.as_ref())?;
    }

    Ok(())
}
