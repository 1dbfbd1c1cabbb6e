use async_trait::async_trait;
use serde::Deserialize;

use crate::error::FlowError;
use crate::error::FlowResult;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// First match for `address`, or `None` when nothing matches.
    async fn geocode(&self, address: &str) -> FlowResult<Option<Coordinates>>;
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: Location,
}

#[derive(Debug, Deserialize)]
struct Location {
    lat: f64,
    lng: f64,
}

/// Google Maps Geocoding API.
#[derive(Debug, Clone)]
pub struct GoogleMapsGeocoder {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GoogleMapsGeocoder {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_key: String) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl Geocoder for GoogleMapsGeocoder {
    async fn geocode(&self, address: &str) -> FlowResult<Option<Coordinates>> {
        let url = format!("{}/maps/api/geocode/json", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(url)
            .query(&[("address", address), ("key", self.api_key.as_str())])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(FlowError::Api {
                service: "geocoding",
                status: status.as_u16(),
                message: body,
            });
        }
        let parsed: GeocodeResponse = serde_json::from_str(&body)?;
        match parsed.status.as_str() {
            "OK" => Ok(parsed.results.first().map(|result| Coordinates {
                latitude: result.geometry.location.lat,
                longitude: result.geometry.location.lng,
            })),
            "ZERO_RESULTS" => Ok(None),
            other => Err(FlowError::Api {
                service: "geocoding",
                status: status.as_u16(),
                message: format!("{other}: {}", parsed.error_message.unwrap_or_default()),
            }),
        }
    }
}
