//! Shared fakes and fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::{self, BoxFuture};
use route_tracker::routing::ProviderRoute;
use route_tracker::{
    AcquisitionError, FeedPositionSource, GpsPoint, KeyValueStore, LocationPusher,
    LocationSample, LocationUpdate, ManualClock, MemoryStore, PositionOptions, PositionSink,
    PositionSource, PushError, Result, RoutingProvider, TrackerConfig, TrackerDeps, TrackerError,
    TrackingManager, WatchHandle,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::seconds(secs)
}

// Three fixes along a short drive in central Delhi
pub const P0: (f64, f64) = (28.6139, 77.2090);
pub const P1: (f64, f64) = (28.6200, 77.2100);
pub const P2: (f64, f64) = (28.6300, 77.2150);
pub const P0_P1_METERS: f64 = 685.28;
pub const P1_P2_METERS: f64 = 1214.33;

pub fn sample(point: (f64, f64), secs: i64) -> LocationSample {
    LocationSample::new(point.0, point.1, at(secs))
}

pub fn gps(point: (f64, f64)) -> GpsPoint {
    GpsPoint::new(point.0, point.1)
}

pub fn assert_close(actual: f64, expected: f64, tolerance: f64) {
    assert!(
        (actual - expected).abs() <= tolerance,
        "expected {} within {} of {}",
        actual,
        tolerance,
        expected
    );
}

// ============================================================================
// Push transport
// ============================================================================

/// Pusher that answers from a script, then succeeds once the script runs out.
#[derive(Default)]
pub struct ScriptedPusher {
    script: Mutex<VecDeque<std::result::Result<(), PushError>>>,
    calls: AtomicUsize,
    pushed: Mutex<Vec<LocationUpdate>>,
}

impl ScriptedPusher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, results: impl IntoIterator<Item = std::result::Result<(), PushError>>) {
        self.script.lock().unwrap().extend(results);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn pushed(&self) -> Vec<LocationUpdate> {
        self.pushed.lock().unwrap().clone()
    }
}

impl LocationPusher for ScriptedPusher {
    fn push<'a>(&'a self, update: &'a LocationUpdate) -> BoxFuture<'a, std::result::Result<(), PushError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.pushed.lock().unwrap().push(update.clone());
        }
        Box::pin(future::ready(result))
    }
}

pub fn rejected() -> std::result::Result<(), PushError> {
    Err(PushError::Rejected {
        status_code: 500,
        message: "internal error".to_string(),
    })
}

pub fn network_down() -> std::result::Result<(), PushError> {
    Err(PushError::Network {
        message: "connection refused".to_string(),
    })
}

// ============================================================================
// Tracking harness
// ============================================================================

pub struct Harness {
    pub manager: TrackingManager,
    pub source: Arc<FeedPositionSource>,
    pub pusher: Arc<ScriptedPusher>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
}

pub fn fast_config() -> TrackerConfig {
    TrackerConfig {
        push_retry_delay: Duration::ZERO,
        start_fix_timeout: Duration::from_millis(200),
        ..TrackerConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(Arc::new(MemoryStore::new()), Arc::new(ManualClock::new(t0())))
}

/// Build a manager over an existing store and clock, as a restarted process would.
pub fn harness_with(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> Harness {
    init_logging();
    let source = Arc::new(FeedPositionSource::new());
    let pusher = Arc::new(ScriptedPusher::new());
    let kv: Arc<dyn KeyValueStore> = store.clone();
    let deps = TrackerDeps {
        source: source.clone(),
        pusher: pusher.clone(),
        store: kv,
        clock: clock.clone(),
    };
    let manager = TrackingManager::new(fast_config(), deps).unwrap();
    Harness {
        manager,
        source,
        pusher,
        clock,
        store,
    }
}

/// Position source whose one-shot request never answers.
pub struct SilentPositionSource;

impl PositionSource for SilentPositionSource {
    fn current_position<'a>(
        &'a self,
        _options: &'a PositionOptions,
    ) -> BoxFuture<'a, std::result::Result<LocationSample, AcquisitionError>> {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(AcquisitionError::Timeout)
        })
    }

    fn watch(&self, _options: &PositionOptions, _sink: PositionSink) -> WatchHandle {
        WatchHandle(0)
    }

    fn cancel(&self, _handle: WatchHandle) {}
}

// ============================================================================
// Routing providers
// ============================================================================

/// Provider that returns a fixed road route and counts its calls.
pub struct CountingProvider {
    name: &'static str,
    calls: AtomicUsize,
}

impl CountingProvider {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RoutingProvider for CountingProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn route<'a>(&'a self, start: GpsPoint, end: GpsPoint) -> BoxFuture<'a, Result<ProviderRoute>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // A dog-leg through the corner of the bounding box
        let corner = GpsPoint::new(start.latitude, end.longitude);
        let distance = route_tracker::geo_utils::polyline_length(&[start, corner, end]);
        Box::pin(future::ready(Ok(ProviderRoute {
            coordinates: vec![start, corner, end],
            distance_meters: distance,
            duration_seconds: distance / 10.0,
        })))
    }
}

/// Provider that always errors.
pub struct FailingProvider {
    name: &'static str,
    calls: AtomicUsize,
}

impl FailingProvider {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RoutingProvider for FailingProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn route<'a>(&'a self, _start: GpsPoint, _end: GpsPoint) -> BoxFuture<'a, Result<ProviderRoute>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(future::ready(Err(TrackerError::Provider {
            provider: self.name.to_string(),
            message: "HTTP 503 Service Unavailable".to_string(),
            status_code: Some(503),
        })))
    }
}

/// Provider that never answers within any sane timeout.
pub struct StalledProvider;

impl RoutingProvider for StalledProvider {
    fn name(&self) -> &str {
        "stalled"
    }

    fn route<'a>(&'a self, _start: GpsPoint, _end: GpsPoint) -> BoxFuture<'a, Result<ProviderRoute>> {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(TrackerError::Provider {
                provider: "stalled".to_string(),
                message: "gave up".to_string(),
                status_code: None,
            })
        })
    }
}
