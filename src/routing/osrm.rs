//! Primary provider: an OSRM-compatible road network service.
//!
//! `GET {base}/route/v1/driving/{lng},{lat};{lng},{lat}?overview=full&geometries=geojson`

use serde::Deserialize;

use super::{GeoJsonLine, ProviderRoute};
use crate::error::{Result, TrackerError};

pub const PROVIDER_NAME: &str = "osrm";

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    distance: f64,
    duration: f64,
    geometry: GeoJsonLine,
}

/// Normalize an OSRM `route` response body.
pub fn parse_response(body: &str) -> Result<ProviderRoute> {
    let response: OsrmResponse = serde_json::from_str(body)
        .map_err(|e| TrackerError::provider(PROVIDER_NAME, format!("Parse error: {}", e)))?;

    if response.code != "Ok" {
        return Err(TrackerError::provider(
            PROVIDER_NAME,
            format!(
                "{}: {}",
                response.code,
                response.message.unwrap_or_default()
            ),
        ));
    }

    let route = response
        .routes
        .into_iter()
        .next()
        .ok_or_else(|| TrackerError::provider(PROVIDER_NAME, "no routes in response"))?;

    Ok(ProviderRoute {
        coordinates: route.geometry.into_points(),
        distance_meters: route.distance,
        duration_seconds: route.duration,
    })
}

#[cfg(feature = "http")]
pub use self::client::OsrmProvider;

#[cfg(feature = "http")]
mod client {
    use std::time::Duration;

    use futures::future::BoxFuture;
    use reqwest::Client;

    use super::{parse_response, PROVIDER_NAME};
    use crate::error::{Result, TrackerError};
    use crate::routing::{ProviderRoute, RoutingProvider};
    use crate::GpsPoint;

    pub struct OsrmProvider {
        client: Client,
        base_url: String,
    }

    impl OsrmProvider {
        pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| TrackerError::config(format!("Failed to create HTTP client: {}", e)))?;

            Ok(Self {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
            })
        }

        pub(crate) fn url(&self, start: &GpsPoint, end: &GpsPoint) -> String {
            format!(
                "{}/route/v1/driving/{},{};{},{}?overview=full&geometries=geojson",
                self.base_url, start.longitude, start.latitude, end.longitude, end.latitude
            )
        }

        async fn fetch(&self, start: GpsPoint, end: GpsPoint) -> Result<ProviderRoute> {
            let response = self
                .client
                .get(self.url(&start, &end))
                .send()
                .await
                .map_err(|e| TrackerError::provider(PROVIDER_NAME, format!("Request error: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                return Err(TrackerError::Provider {
                    provider: PROVIDER_NAME.to_string(),
                    message: format!("HTTP {}", status),
                    status_code: Some(status.as_u16()),
                });
            }

            let body = response
                .text()
                .await
                .map_err(|e| TrackerError::provider(PROVIDER_NAME, format!("Body error: {}", e)))?;
            parse_response(&body)
        }
    }

    impl RoutingProvider for OsrmProvider {
        fn name(&self) -> &str {
            PROVIDER_NAME
        }

        fn route<'a>(&'a self, start: GpsPoint, end: GpsPoint) -> BoxFuture<'a, Result<ProviderRoute>> {
            Box::pin(self.fetch(start, end))
        }
    }

}
