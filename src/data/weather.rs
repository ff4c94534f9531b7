//! OpenWeatherMap current-weather client
//!
//! This module fetches current conditions by city name or coordinates,
//! validates the response shape and classifies failures so callers can tell a
//! retryable outage from a city that does not exist.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use super::country::{country_name, is_city_state};
use super::{normalize_key, ErrorKind, IconCategory, WeatherRecord};

/// Base URL for the OpenWeatherMap current-weather endpoint
const OPENWEATHER_BASE_URL: &str = "https://api.openweathermap.org/data/2.5/weather";

/// Per-request timeout for the upstream call
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Visibility assumed when the API omits it; the API caps reports at 10 km
const MAX_VISIBILITY_METERS: f64 = 10_000.0;

/// Upstream icon codes and the category each maps to
///
/// Day and night variants share a category except for clear sky.
static ICON_TABLE: [(&str, IconCategory); 18] = [
    ("01d", IconCategory::Sunny),
    ("01n", IconCategory::Moon),
    ("02d", IconCategory::Cloudy),
    ("02n", IconCategory::Cloudy),
    ("03d", IconCategory::Scattered),
    ("03n", IconCategory::Scattered),
    ("04d", IconCategory::Broken),
    ("04n", IconCategory::Broken),
    ("09d", IconCategory::Rainy),
    ("09n", IconCategory::Rainy),
    ("10d", IconCategory::Rainy),
    ("10n", IconCategory::Rainy),
    ("11d", IconCategory::Thunder),
    ("11n", IconCategory::Thunder),
    ("13d", IconCategory::Snowy),
    ("13n", IconCategory::Snowy),
    ("50d", IconCategory::Foggy),
    ("50n", IconCategory::Foggy),
];

/// Map an upstream icon code to its [`IconCategory`]
///
/// Total over all inputs: anything not in the table is `Cloudy`.
pub fn icon_code_to_category(code: &str) -> IconCategory {
    let code = code.trim();
    ICON_TABLE
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(code))
        .map(|(_, category)| *category)
        .unwrap_or(IconCategory::Cloudy)
}

/// Errors that can occur when fetching weather data
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider does not know the requested city
    #[error("City not found upstream: {0}")]
    NotFound(String),

    /// The provider resolved the input to something other than a city
    #[error("Not a city-level result: {0}")]
    InvalidCityInput(String),

    /// Network failure, timeout or 5xx; worth retrying
    #[error("Transient upstream failure: {0}")]
    Transient(String),

    /// Successful status but the body is missing required fields
    #[error("Malformed upstream response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// The caller-facing category for this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::NotFound(_) => ErrorKind::NotFound,
            ProviderError::InvalidCityInput(_) => ErrorKind::InvalidInput,
            ProviderError::Transient(_) => ErrorKind::Transient,
            ProviderError::MalformedResponse(_) => ErrorKind::Malformed,
        }
    }

    /// Classify a transport-level reqwest error
    fn from_request(error: reqwest::Error) -> Self {
        if error.is_builder() {
            return ProviderError::MalformedResponse(format!("invalid request: {}", error));
        }
        if error.is_decode() {
            return ProviderError::MalformedResponse(error.to_string());
        }
        if let Some(status) = error.status() {
            if let Some(classified) = classify_status(status) {
                return classified;
            }
        }
        // Timeouts, refused connections and resets
        ProviderError::Transient(error.to_string())
    }
}

/// Classify a non-success HTTP status; `None` for success
fn classify_status(status: StatusCode) -> Option<ProviderError> {
    if status.is_success() {
        return None;
    }
    if status == StatusCode::NOT_FOUND {
        return Some(ProviderError::NotFound(status.to_string()));
    }
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return Some(ProviderError::Transient(format!("status {}", status)));
    }
    Some(ProviderError::MalformedResponse(format!(
        "unexpected status {}",
        status
    )))
}

/// Validated upstream observation, still in provider units
#[derive(Debug, Clone, PartialEq)]
pub struct RawWeatherPayload {
    /// Place name as reported by the provider
    pub name: String,
    /// ISO 3166-1 alpha-2 code, when reported
    pub country_code: Option<String>,
    /// Temperature in Celsius (requests use metric units)
    pub temperature: f64,
    pub description: String,
    /// Relative humidity percentage
    pub humidity: f64,
    /// Wind speed in m/s
    pub wind_speed: f64,
    /// Pressure in hPa
    pub pressure: f64,
    /// Visibility in meters
    pub visibility_m: f64,
    /// Provider icon code, e.g. "01d"
    pub icon_code: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl RawWeatherPayload {
    /// Full country name, falling back to the raw code when the table lacks it
    pub fn country(&self) -> Option<String> {
        let code = self.country_code.as_deref()?;
        Some(
            country_name(code)
                .map(str::to_string)
                .unwrap_or_else(|| code.trim().to_uppercase()),
        )
    }

    /// Display name, `"City, Country"` when disambiguating and the country is known
    pub fn display_name(&self, with_country: bool) -> String {
        match self.country() {
            Some(country) if with_country => format!("{}, {}", self.name, country),
            _ => self.name.clone(),
        }
    }

    /// The record key this observation is stored under
    pub fn canonical_key(&self, with_country: bool) -> String {
        normalize_key(&self.display_name(with_country))
    }

    /// Normalize into a [`WeatherRecord`] stamped at `now`
    ///
    /// Icon codes go through the category table and visibility is converted
    /// from meters to kilometers here, so stored records are always in km.
    pub fn normalize(&self, with_country: bool, now: i64) -> WeatherRecord {
        WeatherRecord {
            key: self.canonical_key(with_country),
            city: self.display_name(with_country),
            temperature: self.temperature,
            description: self.description.clone(),
            humidity: self.humidity.round().clamp(0.0, 100.0) as u8,
            wind_speed: self.wind_speed,
            pressure: self.pressure,
            visibility_km: self.visibility_m / 1000.0,
            icon: icon_code_to_category(&self.icon_code),
            longitude: self.longitude,
            latitude: self.latitude,
            last_updated: now,
        }
    }
}

/// Upstream weather API abstraction
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// Fetch current conditions for a city name
    async fn fetch_by_city(&self, city: &str) -> Result<RawWeatherPayload, ProviderError>;

    /// Fetch current conditions for a coordinate pair
    async fn fetch_by_coordinates(
        &self,
        lat: f64,
        lon: f64,
    ) -> Result<RawWeatherPayload, ProviderError>;
}

/// What a single upstream call asks for
#[derive(Debug, Clone, Copy)]
enum Lookup<'a> {
    City(&'a str),
    Coordinates(f64, f64),
}

/// Client for fetching current weather from OpenWeatherMap
#[derive(Debug, Clone)]
pub struct OpenWeatherClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenWeatherClient {
    /// Create a new client with the default endpoint and request timeout
    pub fn new(api_key: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self::with_client(client, api_key))
    }

    /// Create a new client around an existing HTTP client
    pub fn with_client(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: OPENWEATHER_BASE_URL.to_string(),
        }
    }

    /// Point the client at another endpoint (mirrors, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn fetch(&self, lookup: Lookup<'_>) -> Result<RawWeatherPayload, ProviderError> {
        let request = self
            .client
            .get(&self.base_url)
            .query(&[("appid", self.api_key.as_str()), ("units", "metric")]);
        let request = match lookup {
            Lookup::City(city) => request.query(&[("q", city)]),
            Lookup::Coordinates(lat, lon) => {
                request.query(&[("lat", lat.to_string()), ("lon", lon.to_string())])
            }
        };

        let response = request.send().await.map_err(ProviderError::from_request)?;
        let status = response.status();
        let text = response.text().await.map_err(ProviderError::from_request)?;

        if let Some(error) = classify_status(status) {
            tracing::debug!(%status, body = %text, "Weather provider returned an error status");
            return Err(error);
        }

        let api_response: OpenWeatherResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        parse_response(api_response, lookup)
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherClient {
    async fn fetch_by_city(&self, city: &str) -> Result<RawWeatherPayload, ProviderError> {
        self.fetch(Lookup::City(city)).await
    }

    async fn fetch_by_coordinates(
        &self,
        lat: f64,
        lon: f64,
    ) -> Result<RawWeatherPayload, ProviderError> {
        self.fetch(Lookup::Coordinates(lat, lon)).await
    }
}

/// Whether the body-level `cod` field reports a missing city
fn cod_is_not_found(cod: &serde_json::Value) -> bool {
    match cod {
        serde_json::Value::String(code) => code.trim() == "404",
        serde_json::Value::Number(code) => code.as_u64() == Some(404),
        _ => false,
    }
}

/// A place named exactly like its own country is a country-level match
fn is_country_level(name: &str, country_code: Option<&str>) -> bool {
    let Some(code) = country_code else {
        return false;
    };
    !is_city_state(code)
        && country_name(code).is_some_and(|country| country.eq_ignore_ascii_case(name))
}

/// Validate an OpenWeatherMap response into a [`RawWeatherPayload`]
fn parse_response(
    response: OpenWeatherResponse,
    lookup: Lookup<'_>,
) -> Result<RawWeatherPayload, ProviderError> {
    if response.cod.as_ref().is_some_and(cod_is_not_found) {
        return Err(ProviderError::NotFound("cod 404 in response body".to_string()));
    }

    let main = response
        .main
        .ok_or_else(|| ProviderError::MalformedResponse("main".to_string()))?;
    let condition = response
        .weather
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::MalformedResponse("weather".to_string()))?;
    let coord = response
        .coord
        .ok_or_else(|| ProviderError::MalformedResponse("coord".to_string()))?;
    let wind = response
        .wind
        .ok_or_else(|| ProviderError::MalformedResponse("wind".to_string()))?;

    let country_code = response
        .sys
        .and_then(|sys| sys.country)
        .map(|code| code.trim().to_string())
        .filter(|code| !code.is_empty());
    let name = response
        .name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());

    let name = match lookup {
        Lookup::City(query) => {
            let name = name.ok_or_else(|| {
                ProviderError::InvalidCityInput(format!("no place name returned for '{}'", query))
            })?;
            if is_country_level(&name, country_code.as_deref()) {
                return Err(ProviderError::InvalidCityInput(format!(
                    "'{}' resolved to the country {}",
                    query, name
                )));
            }
            name
        }
        Lookup::Coordinates(..) => {
            name.unwrap_or_else(|| format!("{:.2}, {:.2}", coord.lat, coord.lon))
        }
    };

    Ok(RawWeatherPayload {
        name,
        country_code,
        temperature: main.temp,
        description: condition.description,
        humidity: main.humidity,
        wind_speed: wind.speed,
        pressure: main.pressure,
        visibility_m: response.visibility.unwrap_or(MAX_VISIBILITY_METERS),
        icon_code: condition.icon,
        latitude: coord.lat,
        longitude: coord.lon,
    })
}

/// OpenWeatherMap response structure
///
/// Every section is optional so that a missing one is reported as a
/// malformed response naming the section, rather than a generic parse error.
#[derive(Debug, Deserialize)]
struct OpenWeatherResponse {
    #[serde(default)]
    cod: Option<serde_json::Value>,
    coord: Option<Coord>,
    #[serde(default)]
    weather: Vec<Condition>,
    main: Option<MainReadings>,
    visibility: Option<f64>,
    wind: Option<Wind>,
    sys: Option<Sys>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Coord {
    lon: f64,
    lat: f64,
}

#[derive(Debug, Deserialize)]
struct Condition {
    description: String,
    icon: String,
}

#[derive(Debug, Deserialize)]
struct MainReadings {
    temp: f64,
    humidity: f64,
    pressure: f64,
}

#[derive(Debug, Deserialize)]
struct Wind {
    speed: f64,
}

#[derive(Debug, Deserialize)]
struct Sys {
    country: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn testville_json() -> serde_json::Value {
        serde_json::json!({
            "coord": { "lon": 2.0, "lat": 1.0 },
            "weather": [
                { "id": 800, "main": "Clear", "description": "clear", "icon": "01d" }
            ],
            "base": "stations",
            "main": { "temp": 15, "feels_like": 14.2, "humidity": 50, "pressure": 1000 },
            "visibility": 10000,
            "wind": { "speed": 3, "deg": 250 },
            "dt": 1_721_052_000,
            "name": "Testville",
            "cod": 200
        })
    }

    fn parse(json: serde_json::Value, lookup: Lookup<'_>) -> Result<RawWeatherPayload, ProviderError> {
        let response: OpenWeatherResponse =
            serde_json::from_value(json).expect("Failed to deserialize response");
        parse_response(response, lookup)
    }

    async fn client_for(server: &MockServer) -> OpenWeatherClient {
        OpenWeatherClient::new("test-key")
            .expect("Failed to build client")
            .with_base_url(format!("{}/data/2.5/weather", server.uri()))
    }

    #[test]
    fn test_icon_code_mapping() {
        assert_eq!(icon_code_to_category("01d"), IconCategory::Sunny);
        assert_eq!(icon_code_to_category("01n"), IconCategory::Moon);
        assert_eq!(icon_code_to_category("02d"), IconCategory::Cloudy);
        assert_eq!(icon_code_to_category("03n"), IconCategory::Scattered);
        assert_eq!(icon_code_to_category("04d"), IconCategory::Broken);
        assert_eq!(icon_code_to_category("09d"), IconCategory::Rainy);
        assert_eq!(icon_code_to_category("10n"), IconCategory::Rainy);
        assert_eq!(icon_code_to_category("11d"), IconCategory::Thunder);
        assert_eq!(icon_code_to_category("13n"), IconCategory::Snowy);
        assert_eq!(icon_code_to_category("50d"), IconCategory::Foggy);
        assert_eq!(icon_code_to_category(" 01D "), IconCategory::Sunny);
    }

    #[test]
    fn test_icon_code_mapping_defaults_to_cloudy() {
        for code in ["", "99x", "01", "sunny", "🌧", "01dd"] {
            assert_eq!(
                icon_code_to_category(code),
                IconCategory::Cloudy,
                "Unknown code {:?} should map to cloudy",
                code
            );
        }
    }

    #[test]
    fn test_parse_testville_response() {
        let payload = parse(testville_json(), Lookup::City("Testville")).expect("Should parse");

        assert_eq!(payload.name, "Testville");
        assert_eq!(payload.country_code, None);
        assert!((payload.temperature - 15.0).abs() < 0.01);
        assert_eq!(payload.description, "clear");
        assert!((payload.visibility_m - 10_000.0).abs() < 0.01);
        assert_eq!(payload.icon_code, "01d");
        assert!((payload.latitude - 1.0).abs() < 0.0001);
        assert!((payload.longitude - 2.0).abs() < 0.0001);
    }

    #[test]
    fn test_normalize_converts_units_and_icon() {
        let payload = parse(testville_json(), Lookup::City("Testville")).expect("Should parse");
        let record = payload.normalize(true, 1_700_000_000);

        assert_eq!(record.key, "testville");
        assert_eq!(record.city, "Testville");
        assert!((record.visibility_km - 10.0).abs() < 0.0001);
        assert_eq!(record.icon, IconCategory::Sunny);
        assert_eq!(record.humidity, 50);
        assert!((record.wind_speed - 3.0).abs() < 0.01);
        assert!((record.pressure - 1000.0).abs() < 0.01);
        assert_eq!(record.last_updated, 1_700_000_000);
    }

    #[test]
    fn test_normalize_with_country_suffix() {
        let mut json = testville_json();
        json["name"] = "Paris".into();
        json["sys"] = serde_json::json!({ "country": "FR" });
        let payload = parse(json, Lookup::City("paris")).expect("Should parse");

        let record = payload.normalize(true, 0);
        assert_eq!(record.city, "Paris, France");
        assert_eq!(record.key, "paris, france");

        let bare = payload.normalize(false, 0);
        assert_eq!(bare.city, "Paris");
        assert_eq!(bare.key, "paris");
    }

    #[test]
    fn test_unknown_country_code_is_kept_verbatim() {
        let mut json = testville_json();
        json["sys"] = serde_json::json!({ "country": "xk" });
        let payload = parse(json, Lookup::City("Testville")).expect("Should parse");
        assert_eq!(payload.display_name(true), "Testville, XK");
    }

    #[test]
    fn test_humidity_is_clamped() {
        let mut json = testville_json();
        json["main"]["humidity"] = 140.into();
        let payload = parse(json, Lookup::City("Testville")).expect("Should parse");
        assert_eq!(payload.normalize(false, 0).humidity, 100);
    }

    #[test]
    fn test_missing_visibility_assumes_cap() {
        let mut json = testville_json();
        json.as_object_mut().expect("object").remove("visibility");
        let payload = parse(json, Lookup::City("Testville")).expect("Should parse");
        assert!((payload.normalize(false, 0).visibility_km - 10.0).abs() < 0.0001);
    }

    #[test]
    fn test_missing_main_is_malformed() {
        let mut json = testville_json();
        json.as_object_mut().expect("object").remove("main");
        match parse(json, Lookup::City("Testville")) {
            Err(ProviderError::MalformedResponse(field)) => assert_eq!(field, "main"),
            other => panic!("Expected MalformedResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_weather_array_is_malformed() {
        let mut json = testville_json();
        json["weather"] = serde_json::json!([]);
        match parse(json, Lookup::City("Testville")) {
            Err(ProviderError::MalformedResponse(field)) => assert_eq!(field, "weather"),
            other => panic!("Expected MalformedResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_body_cod_404_is_not_found() {
        let json = serde_json::json!({ "cod": "404", "message": "city not found" });
        assert!(matches!(
            parse(json, Lookup::City("Atlantis")),
            Err(ProviderError::NotFound(_))
        ));
    }

    #[test]
    fn test_blank_name_is_not_a_city() {
        let mut json = testville_json();
        json["name"] = "".into();
        assert!(matches!(
            parse(json, Lookup::City("Testville")),
            Err(ProviderError::InvalidCityInput(_))
        ));
    }

    #[test]
    fn test_country_level_result_is_not_a_city() {
        let mut json = testville_json();
        json["name"] = "France".into();
        json["sys"] = serde_json::json!({ "country": "FR" });
        let result = parse(json, Lookup::City("france"));
        assert!(matches!(result, Err(ProviderError::InvalidCityInput(_))));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_city_state_is_a_city() {
        let mut json = testville_json();
        json["name"] = "Singapore".into();
        json["sys"] = serde_json::json!({ "country": "SG" });
        let payload = parse(json, Lookup::City("singapore")).expect("City-states are cities");
        assert_eq!(payload.display_name(true), "Singapore, Singapore");
    }

    #[test]
    fn test_coordinates_without_name_use_coordinates() {
        let mut json = testville_json();
        json["name"] = "".into();
        let payload = parse(json, Lookup::Coordinates(1.0, 2.0)).expect("Should parse");
        assert_eq!(payload.name, "1.00, 2.00");
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::OK).is_none());
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            Some(ProviderError::NotFound(_))
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY)
            .expect("error")
            .is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS)
            .expect("error")
            .is_transient());
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED),
            Some(ProviderError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_by_city_sends_metric_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/weather"))
            .and(query_param("q", "Testville"))
            .and(query_param("appid", "test-key"))
            .and(query_param("units", "metric"))
            .respond_with(ResponseTemplate::new(200).set_body_json(testville_json()))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let payload = client.fetch_by_city("Testville").await.expect("Should fetch");
        assert_eq!(payload.name, "Testville");
    }

    #[tokio::test]
    async fn test_fetch_by_coordinates_sends_lat_lon() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/weather"))
            .and(query_param("lat", "1.5"))
            .and(query_param("lon", "-2.25"))
            .respond_with(ResponseTemplate::new(200).set_body_json(testville_json()))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let payload = client
            .fetch_by_coordinates(1.5, -2.25)
            .await
            .expect("Should fetch");
        assert_eq!(payload.icon_code, "01d");
    }

    #[tokio::test]
    async fn test_fetch_404_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "cod": "404",
                "message": "city not found"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let result = client.fetch_by_city("Atlantis").await;
        assert!(matches!(result, Err(ProviderError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fetch_503_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let error = client.fetch_by_city("Testville").await.unwrap_err();
        assert!(error.is_transient());
    }

    #[tokio::test]
    async fn test_fetch_invalid_json_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{ invalid json }"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let result = client.fetch_by_city("Testville").await;
        assert!(matches!(result, Err(ProviderError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(testville_json())
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let http = Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .expect("Failed to build HTTP client");
        let client = OpenWeatherClient::with_client(http, "test-key")
            .with_base_url(format!("{}/data/2.5/weather", server.uri()));

        let error = client.fetch_by_city("Testville").await.unwrap_err();
        assert!(error.is_transient(), "Timeout should be transient: {:?}", error);
    }
}
