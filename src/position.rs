//! Geolocation source boundary.
//!
//! The device position API is modelled as a one-shot request plus a
//! subscription that delivers [`PositionEvent`]s into a channel. Delivering into
//! a channel rather than invoking a callback lets the tracker serialize fixes,
//! errors and its own ticker through a single event queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use futures::future::{self, BoxFuture};
use log::debug;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::PositionOptions;
use crate::error::AcquisitionError;
use crate::LocationSample;

/// Something the position source observed.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Fix(LocationSample),
    Error(AcquisitionError),
}

pub type PositionSink = UnboundedSender<PositionEvent>;

/// Opaque subscription token returned by [`PositionSource::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(pub u64);

pub trait PositionSource: Send + Sync {
    /// Request a single fix.
    fn current_position<'a>(
        &'a self,
        options: &'a PositionOptions,
    ) -> BoxFuture<'a, Result<LocationSample, AcquisitionError>>;

    /// Start delivering fixes into `sink` until [`cancel`](Self::cancel) is called.
    fn watch(&self, options: &PositionOptions, sink: PositionSink) -> WatchHandle;

    /// Stop a subscription. Unknown handles are ignored.
    fn cancel(&self, handle: WatchHandle);
}

/// A position source driven by its host.
///
/// Platform bridges (or tests) push fixes in with [`feed`](Self::feed); every
/// live subscriber receives them. One-shot requests answer with the most
/// recently fed fix, or the configured error when none is available.
#[derive(Debug, Default)]
pub struct FeedPositionSource {
    next_handle: AtomicU64,
    subscribers: Mutex<HashMap<u64, PositionSink>>,
    current: Mutex<Option<Result<LocationSample, AcquisitionError>>>,
}

impl FeedPositionSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set what the next one-shot request returns.
    pub fn set_current(&self, result: Result<LocationSample, AcquisitionError>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
    }

    /// Deliver a fix to every subscriber and remember it as the current position.
    pub fn feed(&self, sample: LocationSample) {
        self.set_current(Ok(sample.clone()));
        self.broadcast(PositionEvent::Fix(sample));
    }

    /// Deliver an acquisition error to every subscriber.
    pub fn fail(&self, error: AcquisitionError) {
        self.broadcast(PositionEvent::Error(error));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn broadcast(&self, event: PositionEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        // Drop subscribers whose receiver has gone away
        subscribers.retain(|_, sink| sink.send(event.clone()).is_ok());
    }
}

impl PositionSource for FeedPositionSource {
    fn current_position<'a>(
        &'a self,
        _options: &'a PositionOptions,
    ) -> BoxFuture<'a, Result<LocationSample, AcquisitionError>> {
        let current = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or(Err(AcquisitionError::PositionUnavailable));
        Box::pin(future::ready(current))
    }

    fn watch(&self, _options: &PositionOptions, sink: PositionSink) -> WatchHandle {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, sink);
        debug!("[FeedPositionSource] Subscriber {} attached", id);
        WatchHandle(id)
    }

    fn cancel(&self, handle: WatchHandle) {
        if self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.0)
            .is_some()
        {
            debug!("[FeedPositionSource] Subscriber {} detached", handle.0);
        }
    }
}
