//! # Tracking Session Manager
//!
//! Owns the session state machine and everything that feeds it.
//!
//! ## State machine
//!
//! `Idle --start()--> Active --stop()--> Completed`. A completed session is
//! never reopened; the next `start()` creates a new session id. Calling
//! `start()` while a session is active is rejected with
//! [`TrackerError::AlreadyActive`] and leaves the running session untouched.
//! A session that a previous process left active in the store is completed
//! with [`StopReason::Abandoned`] and published before a new one starts.
//!
//! ## Event flow
//!
//! The position source delivers fixes into a channel drained by a single pump
//! task, so fixes are handled one at a time in arrival order. Each fix passes
//! the [`SampleFilter`]; accepted fixes are appended to the route, the running
//! distance grows by the Haversine distance from the previous fix, a snapshot is
//! persisted and the fix is pushed to the remote location store. A separate
//! ticker task reports elapsed time once per `tick_interval`. All session state
//! sits behind one mutex that is never held across an await point.
//!
//! ## Failure containment
//!
//! A transient push failure is retried once after `push_retry_delay`; other
//! failures count immediately. `max_push_failures` consecutive counted failures
//! complete the session through the normal stop path. A successful push resets
//! the count.
//!
//! ## Recovery
//!
//! The tracking flag and a snapshot of the running session are persisted on
//! start and after every accepted fix. [`TrackingManager::restore`] rehydrates
//! an active session from them after a restart, and `stop()` deletes them.
//! Store failures are logged and otherwise ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::error::{AcquisitionError, PushError, Result, TrackerError};
use crate::position::{PositionEvent, PositionSource, WatchHandle};
use crate::sample_filter::{DiscardReason, FilterDecision, SampleFilter};
use crate::session::{SessionArtifact, SessionId, SessionStatus, StopReason, TrackingSession};
use crate::store::{KeyValueStore, PersistedSession, SessionStore};
use crate::transport::{LocationPusher, LocationUpdate};
use crate::LocationSample;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Collaborators the manager drives.
#[derive(Clone)]
pub struct TrackerDeps {
    pub source: Arc<dyn PositionSource>,
    pub pusher: Arc<dyn LocationPusher>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
}

/// Live progress published to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackingEvent {
    Started(SessionArtifact),
    Resumed {
        session_id: SessionId,
        elapsed_seconds: i64,
    },
    SampleAccepted {
        sample: LocationSample,
        total_distance_meters: f64,
        elapsed_seconds: i64,
    },
    SampleDiscarded {
        sample: LocationSample,
        reason: DiscardReason,
    },
    Tick {
        session_id: SessionId,
        elapsed_seconds: i64,
    },
    StatusChanged(SessionStatus),
    Completed {
        session: TrackingSession,
        reason: StopReason,
    },
}

/// What happened to a sample handed to [`TrackingManager::process_sample`].
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    Accepted {
        total_distance_meters: f64,
        pushed: bool,
    },
    Discarded(DiscardReason),
    /// No session was active to receive the sample
    NotActive,
    /// The sample was accepted but its push exhausted the failure budget
    ForcedStop(TrackingSession),
}

struct ActiveRun {
    session: TrackingSession,
    filter: SampleFilter,
    failure_count: u32,
    status: SessionStatus,
    watch: Option<WatchHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveRun {
    fn new(session: TrackingSession, filter: SampleFilter) -> Self {
        Self {
            session,
            filter,
            failure_count: 0,
            status: SessionStatus::Ok,
            watch: None,
            tasks: Vec::new(),
        }
    }
}

struct Shared {
    config: TrackerConfig,
    deps: TrackerDeps,
    store: SessionStore,
    run: Mutex<Option<ActiveRun>>,
    events: broadcast::Sender<TrackingEvent>,
    /// Sessions started by this manager, used to keep ids distinct
    started: AtomicU64,
}

impl Drop for Shared {
    // Dropping the manager without stop() behaves like a crash: background
    // work ends but persisted state is left for restore().
    fn drop(&mut self) {
        let run = match self.run.get_mut() {
            Ok(run) => run.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(run) = run {
            if let Some(handle) = run.watch {
                self.deps.source.cancel(handle);
            }
            for task in run.tasks {
                task.abort();
            }
        }
    }
}

/// Tracking session manager. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct TrackingManager {
    shared: Arc<Shared>,
}

impl TrackingManager {
    pub fn new(config: TrackerConfig, deps: TrackerDeps) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = SessionStore::new(deps.store.clone());

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                deps,
                store,
                run: Mutex::new(None),
                events,
                started: AtomicU64::new(0),
            }),
        })
    }

    /// Receive live progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackingEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.lock_run().is_some()
    }

    /// Snapshot of the active session, if any.
    pub fn current_session(&self) -> Option<TrackingSession> {
        self.lock_run().as_ref().map(|run| run.session.clone())
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.lock_run().as_ref().map(|run| run.status.clone())
    }

    /// Consecutive counted push failures for the active session.
    pub fn failure_count(&self) -> Option<u32> {
        self.lock_run().as_ref().map(|run| run.failure_count)
    }

    pub fn elapsed_seconds(&self) -> Option<i64> {
        let now = self.shared.deps.clock.now();
        self.lock_run()
            .as_ref()
            .map(|run| run.session.elapsed_seconds(now))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a new session for `employee_id`.
    ///
    /// The session is persisted before anything is awaited. A seeding fix is
    /// requested for up to `start_fix_timeout`; if none arrives the session keeps
    /// a placeholder start location until the first accepted fix replaces it.
    pub async fn start(&self, employee_id: &str) -> Result<TrackingSession> {
        if let Some(active) = self.lock_run().as_ref() {
            return Err(TrackerError::AlreadyActive {
                session_id: active.session.id.to_string(),
            });
        }

        match self.shared.store.load_active(employee_id) {
            Ok(Some(persisted)) => self.close_abandoned(persisted),
            Ok(None) => {}
            Err(e) => warn!("[Tracker] Could not read persisted session for {}: {}", employee_id, e),
        }

        let now = self.shared.deps.clock.now();
        let sequence = self.shared.started.fetch_add(1, Ordering::Relaxed);
        let session_id = SessionId::with_sequence(employee_id, now, sequence);
        let session = TrackingSession::begin_with_id(session_id.clone(), employee_id, now);

        {
            let mut run = self.lock_run();
            if let Some(active) = run.as_ref() {
                return Err(TrackerError::AlreadyActive {
                    session_id: active.session.id.to_string(),
                });
            }
            *run = Some(ActiveRun::new(session.clone(), self.new_filter()));
        }

        if let Err(e) = self.shared.store.mark_active(&session) {
            warn!("[Tracker] Could not persist new session {}: {}", session_id, e);
        }
        info!("[Tracker] Started session {} for {}", session_id, employee_id);

        let tx = self.spawn_workers(&session_id);

        let options = self.shared.config.position.clone();
        let seed = tokio::time::timeout(
            self.shared.config.start_fix_timeout,
            self.shared.deps.source.current_position(&options),
        )
        .await;

        let forced = match seed {
            Ok(Ok(sample)) => match self.ingest(Some(&session_id), sample).await {
                SampleOutcome::ForcedStop(session) => Some(session),
                _ => None,
            },
            Ok(Err(e)) => {
                self.record_acquisition_error(&session_id, e);
                None
            }
            Err(_) => {
                self.record_acquisition_error(&session_id, AcquisitionError::Timeout);
                None
            }
        };
        if let Some(session) = forced {
            return Ok(session);
        }

        let handle = self.shared.deps.source.watch(&options, tx);
        let session = {
            let mut run = self.lock_run();
            match run.as_mut() {
                Some(active) if active.session.id == session_id => {
                    active.watch = Some(handle);
                    Some(active.session.clone())
                }
                _ => None,
            }
        };

        match session {
            Some(session) => {
                self.emit(TrackingEvent::Started(session.start_artifact()));
                Ok(session)
            }
            None => {
                // Stopped while the seeding fix was pending
                self.shared.deps.source.cancel(handle);
                Err(TrackerError::StoppedDuringStart {
                    session_id: session_id.to_string(),
                })
            }
        }
    }

    /// Complete a session a previous process left active and drop its records.
    ///
    /// The end is stamped at its last accepted fix, the last moment it is
    /// known to have been tracking.
    fn close_abandoned(&self, persisted: PersistedSession) {
        let mut session = persisted.into_session();
        let ended = session
            .route
            .last()
            .map_or(session.start_time, |sample| sample.timestamp);
        session.finalize(ended, StopReason::Abandoned);

        warn!(
            "[Tracker] Closing abandoned session {} ({} points, {:.1}m)",
            session.id,
            session.route.len(),
            session.total_distance_meters
        );
        if let Err(e) = self.shared.store.clear(&session.employee_id, &session.id) {
            warn!("[Tracker] Could not clear abandoned session {}: {}", session.id, e);
        }
        self.emit(TrackingEvent::Completed {
            session,
            reason: StopReason::Abandoned,
        });
    }

    /// Rehydrate the persisted active session for `employee_id`, if tracking
    /// was enabled when the process went away.
    ///
    /// The ticker resumes relative to the original start time.
    pub async fn restore(&self, employee_id: &str) -> Result<Option<TrackingSession>> {
        if let Some(active) = self.lock_run().as_ref() {
            if active.session.employee_id == employee_id {
                return Ok(Some(active.session.clone()));
            }
            return Err(TrackerError::AlreadyActive {
                session_id: active.session.id.to_string(),
            });
        }

        let persisted = match self.shared.store.load_active(employee_id) {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!("[Tracker] Could not read persisted session for {}: {}", employee_id, e);
                None
            }
        };
        let Some(persisted) = persisted else {
            debug!("[Tracker] Nothing to restore for {}", employee_id);
            return Ok(None);
        };

        let filter = self.new_filter().resume_from(persisted.last_accepted);
        let session = persisted.into_session();
        let session_id = session.id.clone();

        {
            let mut run = self.lock_run();
            if let Some(active) = run.as_ref() {
                return Err(TrackerError::AlreadyActive {
                    session_id: active.session.id.to_string(),
                });
            }
            *run = Some(ActiveRun::new(session.clone(), filter));
        }

        let tx = self.spawn_workers(&session_id);
        let handle = self
            .shared
            .deps
            .source
            .watch(&self.shared.config.position, tx);
        self.attach_watch(&session_id, handle);

        let elapsed_seconds = session.elapsed_seconds(self.shared.deps.clock.now());
        info!(
            "[Tracker] Restored session {} ({} points, {:.1}m, {}s elapsed)",
            session_id,
            session.route.len(),
            session.total_distance_meters,
            elapsed_seconds
        );
        self.emit(TrackingEvent::Resumed {
            session_id,
            elapsed_seconds,
        });
        Ok(Some(session))
    }

    /// Stop the active session and return it finalized.
    ///
    /// Returns `None` when there was nothing to end.
    pub fn stop(&self) -> Option<TrackingSession> {
        self.finish(None, StopReason::Requested)
    }

    fn finish(&self, expected: Option<&SessionId>, reason: StopReason) -> Option<TrackingSession> {
        let run = {
            let mut run = self.lock_run();
            let matches = run
                .as_ref()
                .is_some_and(|active| expected.map_or(true, |id| *id == active.session.id));
            if matches {
                run.take()
            } else {
                None
            }
        };
        let Some(run) = run else {
            info!("[Tracker] Stop requested with no active session");
            return None;
        };

        if let Some(handle) = run.watch {
            self.shared.deps.source.cancel(handle);
        }
        for task in run.tasks {
            task.abort();
        }

        let mut session = run.session;
        session.finalize(self.shared.deps.clock.now(), reason);

        if let Err(e) = self
            .shared
            .store
            .clear(&session.employee_id, &session.id)
        {
            warn!("[Tracker] Could not clear persisted state for {}: {}", session.id, e);
        }

        info!(
            "[Tracker] Completed session {} ({:?}): {} points, {:.1}m, {}s",
            session.id,
            reason,
            session.route.len(),
            session.total_distance_meters,
            session.duration_seconds.unwrap_or(0)
        );
        self.emit(TrackingEvent::Completed {
            session: session.clone(),
            reason,
        });
        Some(session)
    }

    // ========================================================================
    // Sample Ingestion
    // ========================================================================

    /// Run one raw fix through rate limiting, accumulation, persistence and push.
    pub async fn process_sample(&self, sample: LocationSample) -> SampleOutcome {
        self.ingest(None, sample).await
    }

    async fn ingest(&self, expected: Option<&SessionId>, sample: LocationSample) -> SampleOutcome {
        let now = self.shared.deps.clock.now();

        let accepted = {
            let mut guard = self.lock_run();
            let run = match guard.as_mut() {
                Some(run) if expected.map_or(true, |id| *id == run.session.id) => run,
                _ => return SampleOutcome::NotActive,
            };
            if !run.session.is_active() {
                return SampleOutcome::NotActive;
            }

            match run.filter.offer(&sample) {
                FilterDecision::Discard(reason) => {
                    debug!("[Tracker] Discarded sample at {}: {:?}", sample.timestamp, reason);
                    drop(guard);
                    self.emit(TrackingEvent::SampleDiscarded { sample, reason });
                    return SampleOutcome::Discarded(reason);
                }
                FilterDecision::Accept => {}
            }

            let added = run.session.append(sample.clone());
            let total = run.session.total_distance_meters;
            debug!(
                "[Tracker] Accepted sample #{} (+{:.1}m, total {:.1}m)",
                run.session.route.len(),
                added,
                total
            );

            if let Err(e) = self
                .shared
                .store
                .save_snapshot(&run.session, run.filter.last_accepted())
            {
                warn!("[Tracker] Could not persist snapshot for {}: {}", run.session.id, e);
            }

            (
                run.session.id.clone(),
                LocationUpdate::from_sample(&run.session.employee_id, &sample),
                total,
                run.session.elapsed_seconds(now),
            )
        };
        let (session_id, update, total, elapsed_seconds) = accepted;

        self.emit(TrackingEvent::SampleAccepted {
            sample,
            total_distance_meters: total,
            elapsed_seconds,
        });

        let result = self.push_with_retry(&session_id, &update).await;
        self.record_push_result(&session_id, result, total)
    }

    async fn push_with_retry(
        &self,
        session_id: &SessionId,
        update: &LocationUpdate,
    ) -> std::result::Result<(), PushError> {
        let first = self.shared.deps.pusher.push(update).await;
        let error = match first {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(e),
        };

        warn!(
            "[Tracker] Push failed ({}), retrying after {:?}",
            error, self.shared.config.push_retry_delay
        );
        self.set_status(session_id, SessionStatus::Retrying);
        tokio::time::sleep(self.shared.config.push_retry_delay).await;

        if !self.is_current(session_id) {
            return Err(error);
        }
        self.shared.deps.pusher.push(update).await
    }

    fn record_push_result(
        &self,
        session_id: &SessionId,
        result: std::result::Result<(), PushError>,
        total_distance_meters: f64,
    ) -> SampleOutcome {
        let pushed = result.is_ok();
        let exhausted = {
            let mut guard = self.lock_run();
            let run = match guard.as_mut() {
                Some(run) if run.session.id == *session_id => run,
                // Session ended while the push was in flight
                _ => {
                    return SampleOutcome::Accepted {
                        total_distance_meters,
                        pushed,
                    }
                }
            };

            match result {
                Ok(()) => {
                    run.failure_count = 0;
                    if run.status != SessionStatus::Ok {
                        run.status = SessionStatus::Ok;
                        drop(guard);
                        self.emit(TrackingEvent::StatusChanged(SessionStatus::Ok));
                    }
                    false
                }
                Err(e) => {
                    run.failure_count += 1;
                    let consecutive_failures = run.failure_count;
                    let status = SessionStatus::LastUpdateFailed {
                        consecutive_failures,
                    };
                    run.status = status.clone();
                    drop(guard);

                    warn!(
                        "[Tracker] Push failed for {}: {} ({}/{})",
                        session_id, e, consecutive_failures, self.shared.config.max_push_failures
                    );
                    self.emit(TrackingEvent::StatusChanged(status));
                    consecutive_failures >= self.shared.config.max_push_failures
                }
            }
        };

        if exhausted {
            warn!("[Tracker] Push failure budget exhausted, stopping {}", session_id);
            if let Some(session) = self.finish(Some(session_id), StopReason::PushFailures) {
                return SampleOutcome::ForcedStop(session);
            }
        }

        SampleOutcome::Accepted {
            total_distance_meters,
            pushed,
        }
    }

    fn record_acquisition_error(&self, session_id: &SessionId, error: AcquisitionError) {
        warn!("[Tracker] Position acquisition failed for {}: {}", session_id, error);
        self.set_status(session_id, SessionStatus::AcquisitionFailed(error));
    }

    // ========================================================================
    // Background Workers
    // ========================================================================

    /// Spawn the pump and ticker for a session and return the pump's sender.
    fn spawn_workers(&self, session_id: &SessionId) -> mpsc::UnboundedSender<PositionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(&self.shared);

        let pump = tokio::spawn(run_pump(weak.clone(), session_id.clone(), rx));
        let ticker = tokio::spawn(run_ticker(
            weak,
            session_id.clone(),
            self.shared.config.tick_interval,
        ));

        let mut guard = self.lock_run();
        match guard.as_mut() {
            Some(run) if run.session.id == *session_id => {
                run.tasks.push(pump);
                run.tasks.push(ticker);
            }
            _ => {
                pump.abort();
                ticker.abort();
            }
        }
        tx
    }

    fn attach_watch(&self, session_id: &SessionId, handle: WatchHandle) {
        let attached = {
            let mut guard = self.lock_run();
            match guard.as_mut() {
                Some(run) if run.session.id == *session_id => {
                    run.watch = Some(handle);
                    true
                }
                _ => false,
            }
        };
        if !attached {
            self.shared.deps.source.cancel(handle);
        }
    }

    async fn handle_event(&self, session_id: &SessionId, event: PositionEvent) {
        match event {
            PositionEvent::Fix(sample) => {
                self.ingest(Some(session_id), sample).await;
            }
            PositionEvent::Error(e) => self.record_acquisition_error(session_id, e),
        }
    }

    /// Publish a tick; false once the session is gone.
    fn tick(&self, session_id: &SessionId) -> bool {
        let now = self.shared.deps.clock.now();
        let elapsed_seconds = match self.lock_run().as_ref() {
            Some(run) if run.session.id == *session_id => run.session.elapsed_seconds(now),
            _ => return false,
        };
        self.emit(TrackingEvent::Tick {
            session_id: session_id.clone(),
            elapsed_seconds,
        });
        true
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn new_filter(&self) -> SampleFilter {
        SampleFilter::new(
            self.shared.config.min_sample_interval,
            self.shared.config.drop_out_of_order,
        )
    }

    fn is_current(&self, session_id: &SessionId) -> bool {
        self.lock_run()
            .as_ref()
            .is_some_and(|run| run.session.id == *session_id)
    }

    fn set_status(&self, session_id: &SessionId, status: SessionStatus) {
        let changed = {
            let mut guard = self.lock_run();
            match guard.as_mut() {
                Some(run) if run.session.id == *session_id && run.status != status => {
                    run.status = status.clone();
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit(TrackingEvent::StatusChanged(status));
        }
    }

    fn emit(&self, event: TrackingEvent) {
        // No subscribers is fine
        let _ = self.shared.events.send(event);
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.shared.run.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn run_pump(
    shared: Weak<Shared>,
    session_id: SessionId,
    mut rx: mpsc::UnboundedReceiver<PositionEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(strong) = shared.upgrade() else {
            break;
        };
        let manager = TrackingManager { shared: strong };
        if !manager.is_current(&session_id) {
            break;
        }
        manager.handle_event(&session_id, event).await;
    }
    debug!("[Tracker] Event pump for {} finished", session_id);
}

async fn run_ticker(shared: Weak<Shared>, session_id: SessionId, period: Duration) {
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(strong) = shared.upgrade() else {
            break;
        };
        if !(TrackingManager { shared: strong }).tick(&session_id) {
            break;
        }
    }
}
