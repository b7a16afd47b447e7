//! Tracking session data model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AcquisitionError;
use crate::{geo_utils, LocationSample};

/// Session identifier, derived from the employee id and the start instant.
///
/// Sessions after the first one started by a manager carry a sequence suffix,
/// so back-to-back starts within one millisecond still get distinct ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(employee_id: &str, start_time: DateTime<Utc>) -> Self {
        Self::with_sequence(employee_id, start_time, 0)
    }

    pub fn with_sequence(employee_id: &str, start_time: DateTime<Utc>, sequence: u64) -> Self {
        let millis = start_time.timestamp_millis();
        match sequence {
            0 => SessionId(format!("{}-{}", employee_id, millis)),
            n => SessionId(format!("{}-{}-{}", employee_id, millis, n)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Active,
    Completed,
}

/// Why a session was completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The caller asked for it
    Requested,
    /// Too many consecutive failed pushes to the remote location store
    PushFailures,
    /// Left active by a previous process and closed when a new session started
    Abandoned,
}

/// Live annotation shown alongside an active session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Ok,
    /// A transient push failure is being retried
    Retrying,
    LastUpdateFailed { consecutive_failures: u32 },
    AcquisitionFailed(AcquisitionError),
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Ok => write!(f, "tracking"),
            SessionStatus::Retrying => write!(f, "last update failed, retrying"),
            SessionStatus::LastUpdateFailed {
                consecutive_failures,
            } => write!(f, "last update failed ({} in a row)", consecutive_failures),
            SessionStatus::AcquisitionFailed(e) => write!(f, "no position: {}", e),
        }
    }
}

/// One continuous tracked interval for one employee.
///
/// `route` and `total_distance_meters` are only ever mutated by the tracking
/// manager. While active, `total_distance_meters` equals
/// `geo_utils::accumulate(&route)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSession {
    pub id: SessionId,
    pub employee_id: String,
    pub state: SessionState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub start_location: LocationSample,
    pub end_location: Option<LocationSample>,
    pub route: Vec<LocationSample>,
    pub total_distance_meters: f64,
    pub duration_seconds: Option<i64>,
    pub stop_reason: Option<StopReason>,
}

impl TrackingSession {
    /// A freshly started session with a placeholder start location.
    pub fn begin(employee_id: &str, start_time: DateTime<Utc>) -> Self {
        Self::begin_with_id(SessionId::new(employee_id, start_time), employee_id, start_time)
    }

    pub(crate) fn begin_with_id(id: SessionId, employee_id: &str, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            employee_id: employee_id.to_string(),
            state: SessionState::Active,
            start_time,
            end_time: None,
            start_location: LocationSample::placeholder(start_time),
            end_location: None,
            route: Vec::new(),
            total_distance_meters: 0.0,
            duration_seconds: None,
            stop_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Append an accepted sample and return the distance it added.
    pub(crate) fn append(&mut self, sample: LocationSample) -> f64 {
        let added = self
            .route
            .last()
            .map(|prev| geo_utils::haversine_meters(prev, &sample))
            .unwrap_or(0.0);
        if self.start_location.is_placeholder() {
            self.start_location = sample.clone();
        }
        self.route.push(sample);
        self.total_distance_meters += added;
        added
    }

    /// Move to `Completed`, stamping end time, end location and duration.
    pub(crate) fn finalize(&mut self, end_time: DateTime<Utc>, reason: StopReason) {
        let end_location = self
            .route
            .last()
            .cloned()
            .unwrap_or_else(|| self.start_location.clone());

        self.end_time = Some(end_time);
        self.end_location = Some(end_location);
        self.duration_seconds = Some((end_time - self.start_time).num_seconds().max(0));
        self.state = SessionState::Completed;
        self.stop_reason = Some(reason);
    }

    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        let end = self.end_time.unwrap_or(now);
        (end - self.start_time).num_seconds().max(0)
    }

    /// Average speed over the session, `None` until finalized or if instantaneous.
    pub fn average_speed_kmh(&self) -> Option<f64> {
        let secs = self.duration_seconds.filter(|d| *d > 0)?;
        Some(self.total_distance_meters / secs as f64 * 3.6)
    }

    pub fn start_artifact(&self) -> SessionArtifact {
        SessionArtifact {
            session_id: self.id.clone(),
            employee_id: self.employee_id.clone(),
            timestamp: self.start_time,
            location: self.start_location.clone(),
        }
    }

    /// End-edge artifact, `None` while the session is still running.
    pub fn end_artifact(&self) -> Option<SessionArtifact> {
        Some(SessionArtifact {
            session_id: self.id.clone(),
            employee_id: self.employee_id.clone(),
            timestamp: self.end_time?,
            location: self.end_location.clone()?,
        })
    }
}

/// Record of a session edge (start or end) handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionArtifact {
    pub session_id: SessionId,
    pub employee_id: String,
    pub timestamp: DateTime<Utc>,
    pub location: LocationSample,
}
