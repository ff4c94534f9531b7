//! cloudcast library
//!
//! Weather lookups served from a local store while fresh and fetched from
//! OpenWeatherMap otherwise, with client IPs geolocated through a cached
//! chain of providers. The binary is a thin shell over these modules.

pub mod cache;
pub mod cli;
pub mod data;
pub mod resolver;
pub mod retry;
pub mod service;
