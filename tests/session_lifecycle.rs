//! End-to-end tracking session behavior: lifecycle, rate limiting, push
//! failure containment and restart recovery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use route_tracker::{
    AcquisitionError, DiscardReason, KeyValueStore, ManualClock, MemoryStore, SampleOutcome,
    SessionState, SessionStatus, SessionStore, StopReason, TrackerDeps, TrackerError,
    TrackingEvent, TrackingManager, TrackingSession,
};
use tokio::sync::broadcast;

const EMPLOYEE: &str = "emp-7";

async fn next_matching<F>(rx: &mut broadcast::Receiver<TrackingEvent>, mut pred: F) -> TrackingEvent
where
    F: FnMut(&TrackingEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// p0 at start, p1 at +10s, p2 at +20s, stop at +25s.
async fn drive_reference_session(h: &Harness) -> TrackingSession {
    h.source.set_current(Ok(sample(P0, 0)));
    h.manager.start(EMPLOYEE).await.unwrap();

    h.clock.set(at(10));
    h.manager.process_sample(sample(P1, 10)).await;
    h.clock.set(at(20));
    h.manager.process_sample(sample(P2, 20)).await;

    h.clock.set(at(25));
    h.manager.stop().unwrap()
}

#[tokio::test]
async fn test_three_sample_session() {
    let h = harness();
    let session = drive_reference_session(&h).await;

    assert_eq!(session.state, SessionState::Completed);
    assert_eq!(session.stop_reason, Some(StopReason::Requested));
    assert_eq!(session.route.len(), 3);
    assert_close(session.total_distance_meters, P0_P1_METERS + P1_P2_METERS, 0.1);
    assert_eq!(session.duration_seconds, Some(25));
    assert_eq!(session.start_location, sample(P0, 0));
    assert_eq!(session.end_location, Some(sample(P2, 20)));
    assert_eq!(session.end_time, Some(at(25)));

    assert_eq!(h.pusher.calls(), 3);
    let pushed = h.pusher.pushed();
    assert_eq!(pushed[1].lat, P1.0);
    assert_eq!(pushed[1].employee_id, EMPLOYEE);

    // Stop clears the persisted flag and snapshot
    assert!(h.store.is_empty());
    assert!(!h.manager.is_active());
}

#[tokio::test]
async fn test_distance_is_running_sum_of_accepted_samples() {
    let h = harness();
    h.source.set_current(Ok(sample(P0, 0)));
    h.manager.start(EMPLOYEE).await.unwrap();

    h.clock.set(at(10));
    let outcome = h.manager.process_sample(sample(P1, 10)).await;
    match outcome {
        SampleOutcome::Accepted {
            total_distance_meters,
            pushed,
        } => {
            assert_close(total_distance_meters, P0_P1_METERS, 0.05);
            assert!(pushed);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let current = h.manager.current_session().unwrap();
    assert_close(
        current.total_distance_meters,
        route_tracker::geo_utils::accumulate(&current.route),
        1e-9,
    );
}

#[tokio::test]
async fn test_rate_limiting() {
    let h = harness();
    h.source.set_current(Ok(sample(P0, 0)));
    h.manager.start(EMPLOYEE).await.unwrap();

    h.clock.set(at(3));
    assert_eq!(
        h.manager.process_sample(sample(P1, 3)).await,
        SampleOutcome::Discarded(DiscardReason::TooSoon)
    );

    h.clock.set(at(11));
    assert!(matches!(
        h.manager.process_sample(sample(P1, 11)).await,
        SampleOutcome::Accepted { .. }
    ));

    let session = h.manager.current_session().unwrap();
    assert_eq!(session.route.len(), 2);
    assert_close(session.total_distance_meters, P0_P1_METERS, 0.05);
    // The discarded sample was never pushed
    assert_eq!(h.pusher.calls(), 2);
}

#[tokio::test]
async fn test_out_of_order_sample_dropped() {
    let h = harness();
    h.source.set_current(Ok(sample(P0, 30)));
    h.clock.set(at(30));
    h.manager.start(EMPLOYEE).await.unwrap();

    h.clock.set(at(45));
    assert_eq!(
        h.manager.process_sample(sample(P1, 5)).await,
        SampleOutcome::Discarded(DiscardReason::OutOfOrder)
    );
    assert_eq!(h.manager.current_session().unwrap().route.len(), 1);
}

#[tokio::test]
async fn test_start_while_active_is_rejected() {
    let h = harness();
    let first = h.manager.start(EMPLOYEE).await.unwrap();

    h.clock.set(at(5));
    match h.manager.start(EMPLOYEE).await {
        Err(TrackerError::AlreadyActive { session_id }) => {
            assert_eq!(session_id, first.id.to_string());
        }
        other => panic!("expected AlreadyActive, got {:?}", other),
    }
    assert_eq!(h.manager.current_session().unwrap().id, first.id);
}

#[tokio::test]
async fn test_stop_with_nothing_active() {
    let h = harness();
    assert!(h.manager.stop().is_none());

    h.manager.start(EMPLOYEE).await.unwrap();
    assert!(h.manager.stop().is_some());
    assert!(h.manager.stop().is_none());
}

#[tokio::test]
async fn test_sample_after_stop_is_ignored() {
    let h = harness();
    h.source.set_current(Ok(sample(P0, 0)));
    h.manager.start(EMPLOYEE).await.unwrap();
    h.clock.set(at(10));
    let stopped = h.manager.stop().unwrap();

    h.clock.set(at(20));
    assert_eq!(
        h.manager.process_sample(sample(P1, 20)).await,
        SampleOutcome::NotActive
    );
    assert_eq!(stopped.route.len(), 1);
    assert_eq!(h.pusher.calls(), 1);
}

#[tokio::test]
async fn test_start_without_fix_keeps_placeholder() {
    let h = harness();
    let session = h.manager.start(EMPLOYEE).await.unwrap();

    assert!(session.start_location.is_placeholder());
    assert!(session.route.is_empty());
    assert_eq!(
        h.manager.status(),
        Some(SessionStatus::AcquisitionFailed(AcquisitionError::PositionUnavailable))
    );

    h.clock.set(at(4));
    h.manager.process_sample(sample(P0, 4)).await;
    let session = h.manager.current_session().unwrap();
    assert_eq!(session.start_location, sample(P0, 4));
    assert_eq!(session.total_distance_meters, 0.0);
}

// ============================================================================
// Push failure containment
// ============================================================================

#[tokio::test]
async fn test_three_push_failures_force_stop() {
    let h = harness();
    let mut events = h.manager.subscribe();
    h.pusher.script([rejected(), rejected(), rejected()]);

    h.source.set_current(Ok(sample(P0, 0)));
    h.manager.start(EMPLOYEE).await.unwrap();
    assert_eq!(h.manager.failure_count(), Some(1));

    h.clock.set(at(10));
    h.manager.process_sample(sample(P1, 10)).await;
    assert_eq!(
        h.manager.status(),
        Some(SessionStatus::LastUpdateFailed {
            consecutive_failures: 2
        })
    );

    h.clock.set(at(20));
    let session = match h.manager.process_sample(sample(P2, 20)).await {
        SampleOutcome::ForcedStop(session) => session,
        other => panic!("expected forced stop, got {:?}", other),
    };

    assert_eq!(session.state, SessionState::Completed);
    assert_eq!(session.stop_reason, Some(StopReason::PushFailures));
    // The sample whose push failed was still recorded
    assert_eq!(session.route.len(), 3);
    assert_eq!(session.duration_seconds, Some(20));
    assert!(!h.manager.is_active());
    assert!(h.store.is_empty());
    assert_eq!(h.source.subscriber_count(), 0);

    let completed = next_matching(&mut events, |e| matches!(e, TrackingEvent::Completed { .. })).await;
    if let TrackingEvent::Completed { reason, .. } = completed {
        assert_eq!(reason, StopReason::PushFailures);
    }
}

#[tokio::test]
async fn test_successful_push_resets_failure_count() {
    let h = harness();
    h.pusher
        .script([rejected(), rejected(), Ok(()), rejected(), rejected()]);

    h.source.set_current(Ok(sample(P0, 0)));
    h.manager.start(EMPLOYEE).await.unwrap();
    for step in 1..=4 {
        let secs = step * 10;
        h.clock.set(at(secs));
        let point = (P0.0 + 0.001 * step as f64, P0.1);
        let outcome = h.manager.process_sample(sample(point, secs)).await;
        assert!(
            matches!(outcome, SampleOutcome::Accepted { .. }),
            "step {}: {:?}",
            step,
            outcome
        );
        if step == 2 {
            assert_eq!(h.manager.failure_count(), Some(0));
            assert_eq!(h.manager.status(), Some(SessionStatus::Ok));
        }
    }

    assert!(h.manager.is_active());
    assert_eq!(h.manager.failure_count(), Some(2));
}

#[tokio::test]
async fn test_transient_push_failure_retried_once() {
    let h = harness();
    h.pusher.script([network_down(), Ok(())]);
    h.source.set_current(Ok(sample(P0, 0)));
    h.manager.start(EMPLOYEE).await.unwrap();

    assert_eq!(h.pusher.calls(), 2);
    assert_eq!(h.manager.failure_count(), Some(0));
    assert_eq!(h.manager.status(), Some(SessionStatus::Ok));

    // Both attempts failing counts once
    h.pusher.script([network_down(), network_down()]);
    h.clock.set(at(10));
    let outcome = h.manager.process_sample(sample(P1, 10)).await;
    assert!(matches!(outcome, SampleOutcome::Accepted { pushed: false, .. }));
    assert_eq!(h.pusher.calls(), 4);
    assert_eq!(h.manager.failure_count(), Some(1));
}

#[tokio::test]
async fn test_rejected_push_not_retried() {
    let h = harness();
    h.pusher.script([rejected()]);
    h.source.set_current(Ok(sample(P0, 0)));
    h.manager.start(EMPLOYEE).await.unwrap();

    assert_eq!(h.pusher.calls(), 1);
    assert_eq!(h.manager.failure_count(), Some(1));
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_snapshot_persisted_after_each_accepted_sample() {
    let h = harness();
    h.source.set_current(Ok(sample(P0, 0)));
    h.manager.start(EMPLOYEE).await.unwrap();
    h.clock.set(at(10));
    h.manager.process_sample(sample(P1, 10)).await;

    let persisted = SessionStore::new(h.store.clone())
        .load_active(EMPLOYEE)
        .unwrap()
        .unwrap();
    assert_eq!(persisted.route.len(), 2);
    assert_eq!(persisted.last_accepted, Some(at(10)));
    assert_close(persisted.total_distance_meters, P0_P1_METERS, 0.05);
}

#[tokio::test]
async fn test_restart_matches_uninterrupted_session() {
    let reference = drive_reference_session(&harness()).await;

    let first = harness();
    let store = first.store.clone();
    let clock = first.clock.clone();
    first.source.set_current(Ok(sample(P0, 0)));
    first.manager.start(EMPLOYEE).await.unwrap();
    clock.set(at(10));
    first.manager.process_sample(sample(P1, 10)).await;
    // Process dies without stopping
    drop(first);
    assert!(!store.is_empty());

    clock.set(at(15));
    let second = harness_with(store, clock.clone());
    let restored = second.manager.restore(EMPLOYEE).await.unwrap().unwrap();
    assert_eq!(restored.id, reference.id);
    assert_eq!(restored.route.len(), 2);
    assert_eq!(second.manager.elapsed_seconds(), Some(15));
    assert_eq!(second.source.subscriber_count(), 1);

    // Rate limiting resumes from the last accepted sample
    assert_eq!(
        second.manager.process_sample(sample(P2, 15)).await,
        SampleOutcome::Discarded(DiscardReason::TooSoon)
    );

    clock.set(at(20));
    second.manager.process_sample(sample(P2, 20)).await;
    clock.set(at(25));
    let resumed = second.manager.stop().unwrap();

    assert_eq!(resumed.route, reference.route);
    assert_eq!(resumed.start_time, reference.start_time);
    assert_eq!(resumed.start_location, reference.start_location);
    assert_eq!(resumed.end_location, reference.end_location);
    assert_eq!(resumed.duration_seconds, reference.duration_seconds);
    assert_close(
        resumed.total_distance_meters,
        reference.total_distance_meters,
        1e-6,
    );
}

#[tokio::test]
async fn test_start_after_crash_closes_abandoned_session() {
    let first = harness();
    let store = first.store.clone();
    let clock = first.clock.clone();
    first.source.set_current(Ok(sample(P0, 0)));
    let crashed = first.manager.start(EMPLOYEE).await.unwrap();
    clock.set(at(10));
    first.manager.process_sample(sample(P1, 10)).await;
    drop(first);

    // The host starts afresh instead of restoring
    clock.set(at(60));
    let second = harness_with(store.clone(), clock.clone());
    let mut events = second.manager.subscribe();
    let fresh = second.manager.start(EMPLOYEE).await.unwrap();
    assert_ne!(fresh.id, crashed.id);
    assert!(fresh.route.is_empty());

    let completed = next_matching(&mut events, |e| {
        matches!(
            e,
            TrackingEvent::Completed {
                reason: StopReason::Abandoned,
                ..
            }
        )
    })
    .await;
    if let TrackingEvent::Completed { session, .. } = completed {
        assert_eq!(session.id, crashed.id);
        assert_eq!(session.route, vec![sample(P0, 0), sample(P1, 10)]);
        assert_close(session.total_distance_meters, P0_P1_METERS, 0.05);
        assert_eq!(session.end_time, Some(at(10)));
        assert_eq!(session.duration_seconds, Some(10));
    }

    let persisted = SessionStore::new(store.clone())
        .load_active(EMPLOYEE)
        .unwrap()
        .unwrap();
    assert_eq!(persisted.session_id, fresh.id);
    assert!(!store
        .keys()
        .contains(&SessionStore::snapshot_key(&crashed.id)));

    clock.set(at(90));
    second.manager.stop().unwrap();
    assert!(store.is_empty(), "left behind: {:?}", store.keys());
}

#[tokio::test(start_paused = true)]
async fn test_restored_ticker_counts_from_original_start() {
    let first = harness();
    let store = first.store.clone();
    let clock = first.clock.clone();
    first.source.set_current(Ok(sample(P0, 0)));
    first.manager.start(EMPLOYEE).await.unwrap();
    clock.set(at(10));
    first.manager.process_sample(sample(P1, 10)).await;
    drop(first);

    clock.set(at(95));
    let second = harness_with(store, clock.clone());
    let mut events = second.manager.subscribe();
    let restored = second.manager.restore(EMPLOYEE).await.unwrap().unwrap();

    let tick = next_matching(&mut events, |e| matches!(e, TrackingEvent::Tick { .. })).await;
    assert_eq!(
        tick,
        TrackingEvent::Tick {
            session_id: restored.id.clone(),
            elapsed_seconds: 95,
        }
    );

    clock.set(at(97));
    let tick = next_matching(&mut events, |e| matches!(e, TrackingEvent::Tick { .. })).await;
    assert!(matches!(tick, TrackingEvent::Tick { elapsed_seconds: 97, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_waiting_for_first_fix() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let kv: Arc<dyn KeyValueStore> = store.clone();
    let deps = TrackerDeps {
        source: Arc::new(SilentPositionSource),
        pusher: Arc::new(ScriptedPusher::new()),
        store: kv,
        clock: Arc::new(ManualClock::new(t0())),
    };
    let manager = TrackingManager::new(fast_config(), deps).unwrap();

    let stopper = async {
        while !manager.is_active() {
            tokio::task::yield_now().await;
        }
        manager.stop()
    };
    let (started, stopped) = tokio::join!(manager.start(EMPLOYEE), stopper);

    let stopped = stopped.unwrap();
    assert_eq!(stopped.state, SessionState::Completed);
    match started {
        Err(TrackerError::StoppedDuringStart { session_id }) => {
            assert_eq!(session_id, stopped.id.to_string());
        }
        other => panic!("unexpected start result: {:?}", other),
    }
    assert!(!manager.is_active());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_restore_with_nothing_persisted() {
    let h = harness();
    assert!(h.manager.restore(EMPLOYEE).await.unwrap().is_none());
    assert!(!h.manager.is_active());
}

#[tokio::test]
async fn test_restore_other_employee_finds_nothing() {
    let first = harness();
    first.manager.start(EMPLOYEE).await.unwrap();
    let store = first.store.clone();
    drop(first);

    let second = harness_with(store, Arc::new(route_tracker::ManualClock::new(at(60))));
    assert!(second.manager.restore("emp-8").await.unwrap().is_none());
    assert!(second.manager.restore(EMPLOYEE).await.unwrap().is_some());
}

// ============================================================================
// Position source and events
// ============================================================================

#[tokio::test]
async fn test_watched_fixes_flow_through_pump() {
    let h = harness();
    let mut events = h.manager.subscribe();
    h.manager.start(EMPLOYEE).await.unwrap();
    assert_eq!(h.source.subscriber_count(), 1);

    h.source.feed(sample(P0, 0));
    let accepted = next_matching(&mut events, |e| {
        matches!(e, TrackingEvent::SampleAccepted { .. })
    })
    .await;
    if let TrackingEvent::SampleAccepted { sample: fix, .. } = accepted {
        assert_eq!(fix, sample(P0, 0));
    }
    assert_eq!(h.manager.current_session().unwrap().start_location, sample(P0, 0));

    h.source.feed(sample(P1, 2));
    let discarded = next_matching(&mut events, |e| {
        matches!(e, TrackingEvent::SampleDiscarded { .. })
    })
    .await;
    assert!(matches!(
        discarded,
        TrackingEvent::SampleDiscarded {
            reason: DiscardReason::TooSoon,
            ..
        }
    ));

    h.source.fail(AcquisitionError::PermissionDenied);
    next_matching(&mut events, |e| {
        *e == TrackingEvent::StatusChanged(SessionStatus::AcquisitionFailed(
            AcquisitionError::PermissionDenied,
        ))
    })
    .await;
    assert!(h.manager.is_active());

    h.manager.stop();
    assert_eq!(h.source.subscriber_count(), 0);
}

#[tokio::test]
async fn test_started_event_carries_start_artifact() {
    let h = harness();
    let mut events = h.manager.subscribe();
    h.source.set_current(Ok(sample(P0, 0)));
    let session = h.manager.start(EMPLOYEE).await.unwrap();

    let started = next_matching(&mut events, |e| matches!(e, TrackingEvent::Started(_))).await;
    if let TrackingEvent::Started(artifact) = started {
        assert_eq!(artifact.session_id, session.id);
        assert_eq!(artifact.location, sample(P0, 0));
        assert_eq!(artifact.timestamp, t0());
    }
}

#[tokio::test(start_paused = true)]
async fn test_ticker_reports_elapsed_from_start() {
    let h = harness();
    let mut events = h.manager.subscribe();
    h.manager.start(EMPLOYEE).await.unwrap();

    h.clock.set(at(42));
    let tick = next_matching(&mut events, |e| matches!(e, TrackingEvent::Tick { .. })).await;
    if let TrackingEvent::Tick { elapsed_seconds, .. } = tick {
        assert_eq!(elapsed_seconds, 42);
    }
}
