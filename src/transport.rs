//! Location push boundary.
//!
//! Every accepted sample is pushed to the remote location store. The transport
//! itself makes a single attempt; retry and failure counting live in the
//! tracker so the policy is the same for every transport.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::PushError;
use crate::LocationSample;

/// Body of a location push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    #[serde(skip)]
    pub employee_id: String,
    pub lat: f64,
    pub lng: f64,
    pub accuracy: Option<f64>,
}

impl LocationUpdate {
    pub fn from_sample(employee_id: &str, sample: &LocationSample) -> Self {
        Self {
            employee_id: employee_id.to_string(),
            lat: sample.lat,
            lng: sample.lng,
            accuracy: sample.accuracy,
        }
    }
}

pub trait LocationPusher: Send + Sync {
    fn push<'a>(&'a self, update: &'a LocationUpdate) -> BoxFuture<'a, Result<(), PushError>>;
}

#[cfg(feature = "http")]
pub use self::http::HttpLocationPusher;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use futures::future::BoxFuture;
    use log::debug;
    use reqwest::Client;

    use super::{LocationPusher, LocationUpdate};
    use crate::error::{PushError, Result, TrackerError};

    /// Pushes updates with `PUT {base_url}/employees/{id}/location`.
    pub struct HttpLocationPusher {
        client: Client,
        base_url: String,
        auth_header: Option<String>,
    }

    impl HttpLocationPusher {
        pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| TrackerError::config(format!("Failed to create HTTP client: {}", e)))?;

            Ok(Self {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                auth_header: None,
            })
        }

        /// Attach a bearer token to every push.
        pub fn with_bearer_token(mut self, token: &str) -> Self {
            self.auth_header = Some(format!("Bearer {}", token));
            self
        }

        fn url(&self, employee_id: &str) -> String {
            format!("{}/employees/{}/location", self.base_url, employee_id)
        }

        async fn send(&self, update: &LocationUpdate) -> std::result::Result<(), PushError> {
            let mut request = self.client.put(self.url(&update.employee_id)).json(update);
            if let Some(auth) = &self.auth_header {
                request = request.header("Authorization", auth);
            }

            let response = request.send().await.map_err(classify)?;
            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(PushError::Rejected {
                    status_code: status.as_u16(),
                    message,
                });
            }

            debug!(
                "[HttpLocationPusher] Pushed {:.5},{:.5} for {}",
                update.lat, update.lng, update.employee_id
            );
            Ok(())
        }
    }

    fn classify(e: reqwest::Error) -> PushError {
        if e.is_timeout() {
            PushError::Timeout
        } else {
            PushError::Network {
                message: e.to_string(),
            }
        }
    }

    impl LocationPusher for HttpLocationPusher {
        fn push<'a>(
            &'a self,
            update: &'a LocationUpdate,
        ) -> BoxFuture<'a, std::result::Result<(), PushError>> {
            Box::pin(self.send(update))
        }
    }

}
