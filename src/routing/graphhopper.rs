//! Secondary provider: a GraphHopper-compatible routing API.
//!
//! `GET {base}/route?point={lat},{lng}&point={lat},{lng}&profile=car&points_encoded=false&key=..`
//!
//! The service refuses requests without a key. When none is configured the
//! provider sends the shared demo credential instead, and relies on the
//! resolver's fallback once its quota is spent.

use serde::Deserialize;

use super::{GeoJsonLine, ProviderRoute};
use crate::error::{Result, TrackerError};

pub const PROVIDER_NAME: &str = "graphhopper";

#[derive(Debug, Deserialize)]
struct GraphHopperResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    paths: Vec<GraphHopperPath>,
}

#[derive(Debug, Deserialize)]
struct GraphHopperPath {
    distance: f64,
    /// Milliseconds
    time: f64,
    points: GeoJsonLine,
}

/// Normalize a GraphHopper `route` response body (unencoded points).
pub fn parse_response(body: &str) -> Result<ProviderRoute> {
    let response: GraphHopperResponse = serde_json::from_str(body)
        .map_err(|e| TrackerError::provider(PROVIDER_NAME, format!("Parse error: {}", e)))?;

    let Some(path) = response.paths.into_iter().next() else {
        return Err(TrackerError::provider(
            PROVIDER_NAME,
            response
                .message
                .unwrap_or_else(|| "no paths in response".to_string()),
        ));
    };

    Ok(ProviderRoute {
        coordinates: path.points.into_points(),
        distance_meters: path.distance,
        duration_seconds: path.time / 1000.0,
    })
}

#[cfg(feature = "http")]
pub use self::client::GraphHopperProvider;

#[cfg(feature = "http")]
mod client {
    use std::time::Duration;

    use futures::future::BoxFuture;
    use log::warn;
    use reqwest::Client;

    use super::{parse_response, PROVIDER_NAME};
    use crate::error::{Result, TrackerError};
    use crate::routing::{ProviderRoute, RoutingProvider};
    use crate::GpsPoint;

    pub struct GraphHopperProvider {
        client: Client,
        base_url: String,
        api_key: String,
    }

    impl GraphHopperProvider {
        pub fn new(
            base_url: &str,
            api_key: Option<String>,
            demo_key: &str,
            timeout: Duration,
        ) -> Result<Self> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| TrackerError::config(format!("Failed to create HTTP client: {}", e)))?;

            let api_key = match api_key {
                Some(key) => key,
                None => {
                    warn!("[GraphHopperProvider] No API key configured, using the demo credential");
                    demo_key.to_string()
                }
            };

            Ok(Self {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key,
            })
        }

        pub(crate) fn query(&self, start: &GpsPoint, end: &GpsPoint) -> Vec<(&'static str, String)> {
            vec![
                ("point", format!("{},{}", start.latitude, start.longitude)),
                ("point", format!("{},{}", end.latitude, end.longitude)),
                ("profile", "car".to_string()),
                ("points_encoded", "false".to_string()),
                ("key", self.api_key.clone()),
            ]
        }

        async fn fetch(&self, start: GpsPoint, end: GpsPoint) -> Result<ProviderRoute> {
            let response = self
                .client
                .get(format!("{}/route", self.base_url))
                .query(&self.query(&start, &end))
                .send()
                .await
                .map_err(|e| TrackerError::provider(PROVIDER_NAME, format!("Request error: {}", e)))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| TrackerError::provider(PROVIDER_NAME, format!("Body error: {}", e)))?;

            if !status.is_success() {
                return Err(TrackerError::Provider {
                    provider: PROVIDER_NAME.to_string(),
                    message: format!("HTTP {}", status),
                    status_code: Some(status.as_u16()),
                });
            }
            parse_response(&body)
        }
    }

    impl RoutingProvider for GraphHopperProvider {
        fn name(&self) -> &str {
            PROVIDER_NAME
        }

        fn route<'a>(&'a self, start: GpsPoint, end: GpsPoint) -> BoxFuture<'a, Result<ProviderRoute>> {
            Box::pin(self.fetch(start, end))
        }
    }

}
