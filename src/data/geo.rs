//! IP geolocation providers
//!
//! Each provider turns a client IP into a (city, country) pair. Providers are
//! interchangeable behind [`GeoProvider`] so the resolver can try them in
//! order and fall through on failure.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

use super::country::country_name;

/// Default endpoint for ip-api.com
const IP_API_BASE_URL: &str = "http://ip-api.com/json";

/// Default endpoint for ipinfo.io
const IPINFO_BASE_URL: &str = "https://ipinfo.io";

/// Per-request timeout for geolocation lookups
const REQUEST_TIMEOUT_SECS: u64 = 5;

/// A resolved location for a client IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub city: String,
    pub country: String,
}

/// Errors that can occur when geolocating an IP
#[derive(Debug, Error)]
pub enum GeoError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Provider answered with a non-success status
    #[error("Provider returned status {0}")]
    Status(reqwest::StatusCode),

    /// Provider answered but could not place the IP
    #[error("IP could not be resolved: {0}")]
    Unresolved(String),
}

/// One upstream geolocation service
#[async_trait]
pub trait GeoProvider: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &str;

    /// Resolve an IP to a city and country
    async fn locate(&self, ip: IpAddr) -> Result<GeoLocation, GeoError>;
}

fn build_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
}

/// Trimmed, non-empty string or `None`
fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Fields requested from ip-api.com
const IP_API_FIELDS: &str = "status,message,country,countryCode,city";

/// ip-api.com response structure
#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    message: Option<String>,
    city: Option<String>,
    country: Option<String>,
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
}

/// Geolocation via ip-api.com
#[derive(Debug, Clone)]
pub struct IpApiProvider {
    client: Client,
    base_url: String,
}

impl IpApiProvider {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client()?,
            base_url: IP_API_BASE_URL.to_string(),
        })
    }

    /// Point the provider at another endpoint (mirrors, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl GeoProvider for IpApiProvider {
    fn name(&self) -> &str {
        "ip-api"
    }

    async fn locate(&self, ip: IpAddr) -> Result<GeoLocation, GeoError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), ip);
        let response = self
            .client
            .get(&url)
            .query(&[("fields", IP_API_FIELDS)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GeoError::Status(response.status()));
        }

        let body: IpApiResponse = response.json().await?;
        if body.status != "success" {
            return Err(GeoError::Unresolved(
                body.message.unwrap_or_else(|| body.status.clone()),
            ));
        }

        // Spell the country the way weather keys do whenever a code is given
        let country = non_empty(body.country_code)
            .and_then(|code| country_name(&code))
            .map(str::to_string)
            .or_else(|| non_empty(body.country));

        match (non_empty(body.city), country) {
            (Some(city), Some(country)) => Ok(GeoLocation { city, country }),
            _ => Err(GeoError::Unresolved("missing city or country".to_string())),
        }
    }
}

/// ipinfo.io response structure
#[derive(Debug, Deserialize)]
struct IpInfoResponse {
    city: Option<String>,
    country: Option<String>,
    #[serde(default)]
    bogon: bool,
}

/// Geolocation via ipinfo.io
#[derive(Debug, Clone)]
pub struct IpInfoProvider {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl IpInfoProvider {
    pub fn new(token: Option<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client()?,
            base_url: IPINFO_BASE_URL.to_string(),
            token,
        })
    }

    /// Point the provider at another endpoint (mirrors, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl GeoProvider for IpInfoProvider {
    fn name(&self) -> &str {
        "ipinfo"
    }

    async fn locate(&self, ip: IpAddr) -> Result<GeoLocation, GeoError> {
        let url = format!("{}/{}/json", self.base_url.trim_end_matches('/'), ip);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.query(&[("token", token.as_str())]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(GeoError::Status(response.status()));
        }

        let body: IpInfoResponse = response.json().await?;
        if body.bogon {
            return Err(GeoError::Unresolved("bogon address".to_string()));
        }

        let city = non_empty(body.city)
            .ok_or_else(|| GeoError::Unresolved("missing city".to_string()))?;
        let code = non_empty(body.country)
            .ok_or_else(|| GeoError::Unresolved("missing country".to_string()))?;
        // ipinfo reports ISO codes; keys use full names
        let country = country_name(&code)
            .map(str::to_string)
            .unwrap_or(code);

        Ok(GeoLocation { city, country })
    }
}
