//! # Route Tracker
//!
//! Field-session GPS tracking with resilient road-route resolution.
//!
//! This library provides:
//! - A persistent tracking session state machine (`Idle -> Active -> Completed`)
//! - Rate-limited sample ingestion with incremental Haversine distance
//! - Road-following route resolution through an ordered provider chain,
//!   terminating in a straight-line fallback that cannot fail
//! - A bounded, time-windowed cache of resolved segments
//!
//! ## Features
//!
//! - **`http`** - Enable the HTTP routing providers and the HTTP push transport
//! - **`persistence`** - Enable the SQLite-backed session store
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use route_tracker::{geo_utils, LocationSample};
//! use chrono::{TimeZone, Utc};
//!
//! let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
//! let route = vec![
//!     LocationSample::new(28.6139, 77.2090, t0),
//!     LocationSample::new(28.6200, 77.2100, t0 + chrono::Duration::seconds(10)),
//! ];
//!
//! let meters = geo_utils::accumulate(&route);
//! assert!(meters > 600.0 && meters < 700.0);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{AcquisitionError, PushError, Result, TrackerError};

// Configuration
pub mod config;
pub use config::{PositionOptions, RoutingConfig, TrackerConfig};

// Injectable wall clock
pub mod clock;
pub use clock::{Clock, ManualClock, SystemClock};

// Geographic utilities (distance, bounds, rounding)
pub mod geo_utils;

// Minimum-interval sample filter
pub mod sample_filter;
pub use sample_filter::{DiscardReason, FilterDecision, SampleFilter};

// Collaborator boundaries
pub mod position;
pub use position::{FeedPositionSource, PositionEvent, PositionSink, PositionSource, WatchHandle};

pub mod transport;
pub use transport::{LocationPusher, LocationUpdate};
#[cfg(feature = "http")]
pub use transport::HttpLocationPusher;

pub mod store;
pub use store::{KeyValueStore, MemoryStore, PersistedSession, SessionStore};
#[cfg(feature = "persistence")]
pub use store::SqliteStore;

// Session data model
pub mod session;
pub use session::{
    SessionArtifact, SessionId, SessionState, SessionStatus, StopReason, TrackingSession,
};

// Tracking session manager
pub mod tracker;
pub use tracker::{SampleOutcome, TrackerDeps, TrackingEvent, TrackingManager};

// Segment cache for the routing resolver
pub mod route_cache;
pub use route_cache::{RouteCache, SegmentKey};

// Routing resolver and providers
pub mod routing;
pub use routing::{
    enrich_session, Confidence, EnrichedRoute, RouteResult, RoutingProvider, RoutingResolver,
    SegmentRoute, SegmentSummary,
};

/// Initialize logging for Android hosts.
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("RouteTracker"),
    );
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use route_tracker::GpsPoint;
/// let point = GpsPoint::new(28.6139, 77.2090); // New Delhi
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A single position fix as recorded on a session route.
///
/// Samples are immutable once created. They are produced by a
/// [`PositionSource`] or synthesized for a session's start/end edge when no
/// real fix is available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub lat: f64,
    pub lng: f64,
    pub address: String,
    pub timestamp: DateTime<Utc>,
    /// Horizontal accuracy in meters, when the source reports one
    #[serde(default)]
    pub accuracy: Option<f64>,
}

impl LocationSample {
    /// Create a sample whose address is the formatted coordinate pair.
    pub fn new(lat: f64, lng: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            lat,
            lng,
            address: geo_utils::coordinate_address(lat, lng),
            timestamp,
            accuracy: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Placeholder used when a session starts before any fix has landed.
    pub fn placeholder(timestamp: DateTime<Utc>) -> Self {
        Self {
            lat: 0.0,
            lng: 0.0,
            address: geo_utils::PLACEHOLDER_ADDRESS.to_string(),
            timestamp,
            accuracy: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.address == geo_utils::PLACEHOLDER_ADDRESS && self.lat == 0.0 && self.lng == 0.0
    }

    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.lat, self.lng)
    }
}

/// Bounding box for a route.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_gps_point_validity() {
        assert!(GpsPoint::new(28.6139, 77.2090).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, f64::NAN).is_valid());
    }

    #[test]
    fn test_placeholder_sample() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let placeholder = LocationSample::placeholder(t);
        assert!(placeholder.is_placeholder());
        assert!(!LocationSample::new(28.6139, 77.2090, t).is_placeholder());
    }

    #[test]
    fn test_sample_address() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let sample = LocationSample::new(28.6139, 77.209, t);
        assert_eq!(sample.address, "28.61390, 77.20900");

        let named = sample.with_address("Connaught Place");
        assert_eq!(named.address, "Connaught Place");
        assert!(!named.is_placeholder());
    }

    #[test]
    fn test_bounds_center() {
        let bounds = Bounds {
            min_lat: 28.0,
            max_lat: 29.0,
            min_lng: 77.0,
            max_lng: 78.0,
        };
        assert_eq!(bounds.center(), GpsPoint::new(28.5, 77.5));
    }
}
