//! # Routing Resolver
//!
//! Turns waypoints into a road-following path for display.
//!
//! ## Fallback chain
//!
//! Each segment is attempted against the configured providers in order; the
//! first well-formed answer wins. Every attempt is bounded by
//! `provider_timeout`, and a timeout counts as a failure. When every provider
//! fails the resolver returns a two-point straight line with a Haversine
//! distance and a duration at the assumed average speed, so
//! [`RoutingResolver::resolve_segment`] always produces a result.
//!
//! Provider degradation is visible only through [`SegmentRoute::source`] and
//! [`Confidence`]; it is never surfaced as an error.
//!
//! ## Caching
//!
//! Provider answers are cached by endpoints rounded to ~1 m (see
//! [`SegmentKey`]). Straight-line fallbacks are not cached, so a recovered
//! provider is used on the next request.
//!
//! Road-network distances produced here are estimates. They never replace the
//! distance recorded by live tracking.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::RoutingConfig;
use crate::error::{Result, TrackerError};
use crate::geo_utils;
use crate::route_cache::{RouteCache, SegmentKey};
use crate::session::{SessionId, TrackingSession};
use crate::{Bounds, GpsPoint, LocationSample};

pub mod graphhopper;
pub mod osrm;

#[cfg(feature = "http")]
pub use graphhopper::GraphHopperProvider;
#[cfg(feature = "http")]
pub use osrm::OsrmProvider;

/// Source tag used for straight-line fallbacks.
pub const STRAIGHT_LINE_SOURCE: &str = "straight_line";

// ============================================================================
// Types
// ============================================================================

/// How much a resolved path can be trusted to follow real roads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Confidence {
    /// Straight-line estimate
    Low,
    /// Road-following path from a backup provider
    Medium,
    /// Road-following path from the primary provider
    High,
}

/// Normalized answer from a routing provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRoute {
    pub coordinates: Vec<GpsPoint>,
    pub distance_meters: f64,
    pub duration_seconds: f64,
}

impl ProviderRoute {
    /// Reject answers that cannot be drawn or summed.
    fn validate(self, provider: &str) -> Result<Self> {
        if self.coordinates.len() < 2 {
            return Err(TrackerError::provider(
                provider,
                format!("route has {} coordinates", self.coordinates.len()),
            ));
        }
        if !self.coordinates.iter().all(GpsPoint::is_valid) {
            return Err(TrackerError::provider(provider, "route has invalid coordinates"));
        }
        if !(self.distance_meters.is_finite() && self.distance_meters >= 0.0)
            || !(self.duration_seconds.is_finite() && self.duration_seconds >= 0.0)
        {
            return Err(TrackerError::provider(provider, "route has invalid distance or duration"));
        }
        Ok(self)
    }
}

/// GeoJSON LineString geometry, shared by providers that return one.
#[derive(Debug, Deserialize)]
pub(crate) struct GeoJsonLine {
    coordinates: Vec<[f64; 2]>,
}

impl GeoJsonLine {
    /// GeoJSON positions are `[lng, lat]`.
    pub(crate) fn into_points(self) -> Vec<GpsPoint> {
        self.coordinates
            .into_iter()
            .map(|[lng, lat]| GpsPoint::new(lat, lng))
            .collect()
    }
}

/// A road network query service.
pub trait RoutingProvider: Send + Sync {
    fn name(&self) -> &str;

    fn route<'a>(&'a self, start: GpsPoint, end: GpsPoint) -> BoxFuture<'a, Result<ProviderRoute>>;
}

/// One resolved segment between two waypoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRoute {
    pub coordinates: Vec<GpsPoint>,
    pub distance_meters: f64,
    pub duration_seconds: f64,
    /// Provider name, or [`STRAIGHT_LINE_SOURCE`]
    pub source: String,
    pub confidence: Confidence,
}

impl SegmentRoute {
    pub fn is_fallback(&self) -> bool {
        self.source == STRAIGHT_LINE_SOURCE
    }
}

/// Per-segment provenance inside a [`RouteResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSummary {
    pub source: String,
    pub confidence: Confidence,
    pub distance_meters: f64,
    pub duration_seconds: f64,
}

/// A multi-waypoint route assembled from resolved segments.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RouteResult {
    pub coordinates: Vec<GpsPoint>,
    pub distance_meters: f64,
    pub duration_seconds: f64,
    pub segments: Vec<SegmentSummary>,
    /// Lowest segment confidence, `None` for an empty route
    pub confidence: Option<Confidence>,
    pub bounds: Option<Bounds>,
}

impl RouteResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }

    fn from_segments(segments: Vec<SegmentRoute>) -> Self {
        let mut result = RouteResult::empty();

        for (i, segment) in segments.into_iter().enumerate() {
            // Segment i starts where segment i-1 ended; keep the junction once
            let skip = usize::from(i > 0 && !segment.coordinates.is_empty());
            result
                .coordinates
                .extend(segment.coordinates.iter().skip(skip).copied());
            result.distance_meters += segment.distance_meters;
            result.duration_seconds += segment.duration_seconds;
            result.confidence = Some(match result.confidence {
                Some(c) => c.min(segment.confidence),
                None => segment.confidence,
            });
            result.segments.push(SegmentSummary {
                source: segment.source,
                confidence: segment.confidence,
                distance_meters: segment.distance_meters,
                duration_seconds: segment.duration_seconds,
            });
        }

        result.bounds = geo_utils::compute_bounds(&result.coordinates);
        result
    }
}

/// Two-point straight line at an assumed average speed. Cannot fail.
pub fn straight_line(start: &GpsPoint, end: &GpsPoint, speed_kmh: f64) -> SegmentRoute {
    let distance_meters = geo_utils::haversine_points(start, end);
    let speed_ms = speed_kmh / 3.6;
    let duration_seconds = if speed_ms > 0.0 {
        distance_meters / speed_ms
    } else {
        0.0
    };

    SegmentRoute {
        coordinates: vec![*start, *end],
        distance_meters,
        duration_seconds,
        source: STRAIGHT_LINE_SOURCE.to_string(),
        confidence: Confidence::Low,
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Ordered provider chain with a shared segment cache.
pub struct RoutingResolver {
    providers: Vec<Arc<dyn RoutingProvider>>,
    cache: Mutex<RouteCache<SegmentKey, SegmentRoute>>,
    clock: Arc<dyn Clock>,
    provider_timeout: Duration,
    fallback_speed_kmh: f64,
}

impl RoutingResolver {
    /// Build a resolver over `providers`, tried in the given order.
    pub fn new(
        providers: Vec<Arc<dyn RoutingProvider>>,
        config: &RoutingConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            providers,
            cache: Mutex::new(RouteCache::new(config.cache_capacity, config.cache_ttl)),
            clock,
            provider_timeout: config.provider_timeout,
            fallback_speed_kmh: config.fallback_speed_kmh,
        }
    }

    /// Primary OSRM provider followed by GraphHopper, on the system clock.
    #[cfg(feature = "http")]
    pub fn from_config(config: &RoutingConfig) -> Result<Self> {
        config.validate()?;
        let primary = OsrmProvider::new(&config.primary_url, config.provider_timeout)?;
        let secondary = GraphHopperProvider::new(
            &config.secondary_url,
            config.secondary_api_key.clone(),
            &config.secondary_demo_key,
            config.provider_timeout,
        )?;
        let providers: Vec<Arc<dyn RoutingProvider>> = vec![Arc::new(primary), Arc::new(secondary)];
        Ok(Self::new(
            providers,
            config,
            Arc::new(crate::clock::SystemClock),
        ))
    }

    /// Resolve one segment. Always succeeds.
    pub async fn resolve_segment(&self, start: &GpsPoint, end: &GpsPoint) -> SegmentRoute {
        if !start.is_valid() || !end.is_valid() {
            warn!("[RoutingResolver] Invalid waypoint, using straight line");
            return straight_line(start, end, self.fallback_speed_kmh);
        }

        let key = SegmentKey::new(start, end);
        if let Some(hit) = self.lock_cache().get_cloned(&key, self.clock.now()) {
            debug!("[RoutingResolver] Cache hit ({})", hit.source);
            return hit;
        }

        for (rank, provider) in self.providers.iter().enumerate() {
            let attempt = tokio::time::timeout(self.provider_timeout, provider.route(*start, *end)).await;

            let route = match attempt {
                Ok(Ok(route)) => route.validate(provider.name()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(TrackerError::provider(
                    provider.name(),
                    format!("timed out after {:?}", self.provider_timeout),
                )),
            };

            match route {
                Ok(route) => {
                    let segment = SegmentRoute {
                        coordinates: route.coordinates,
                        distance_meters: route.distance_meters,
                        duration_seconds: route.duration_seconds,
                        source: provider.name().to_string(),
                        confidence: if rank == 0 {
                            Confidence::High
                        } else {
                            Confidence::Medium
                        },
                    };
                    self.lock_cache()
                        .insert(key, segment.clone(), self.clock.now());
                    debug!(
                        "[RoutingResolver] {} resolved segment: {:.0}m",
                        provider.name(),
                        segment.distance_meters
                    );
                    return segment;
                }
                Err(e) => {
                    warn!("[RoutingResolver] {}; falling through", e);
                }
            }
        }

        info!("[RoutingResolver] All providers failed, using straight line");
        straight_line(start, end, self.fallback_speed_kmh)
    }

    /// Resolve consecutive waypoint pairs and stitch them into one route.
    ///
    /// Fewer than two points yields an empty result.
    pub async fn resolve_route(&self, points: &[LocationSample]) -> RouteResult {
        if points.len() < 2 {
            return RouteResult::empty();
        }

        let waypoints: Vec<GpsPoint> = points.iter().map(LocationSample::point).collect();
        let segments = join_all(
            waypoints
                .windows(2)
                .map(|w| self.resolve_segment(&w[0], &w[1])),
        )
        .await;

        RouteResult::from_segments(segments)
    }

    /// Number of cached segments (stale ones included until looked up).
    pub fn cached_segments(&self) -> usize {
        self.lock_cache().len()
    }

    pub fn clear_cache(&self) {
        self.lock_cache().clear();
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, RouteCache<SegmentKey, SegmentRoute>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Session Enrichment
// ============================================================================

/// A completed session paired with its road-network route for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRoute {
    pub session_id: SessionId,
    /// Distance recorded by live tracking, authoritative
    pub tracked_distance_meters: f64,
    /// Road-network estimate, for display only
    pub road: RouteResult,
}

/// Resolve a road path through a session's recorded route.
///
/// Sessions with fewer than two accepted samples are resolved between their
/// start and end locations instead. The session itself is never modified.
pub async fn enrich_session(resolver: &RoutingResolver, session: &TrackingSession) -> EnrichedRoute {
    let road = if session.route.len() >= 2 {
        resolver.resolve_route(&session.route).await
    } else {
        let edges: Vec<LocationSample> = std::iter::once(session.start_location.clone())
            .chain(session.end_location.clone())
            .filter(|s| !s.is_placeholder())
            .collect();
        resolver.resolve_route(&edges).await
    };

    EnrichedRoute {
        session_id: session.id.clone(),
        tracked_distance_meters: session.total_distance_meters,
        road,
    }
}
