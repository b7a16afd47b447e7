//! Minimum-interval filter for raw position samples.
//!
//! A sample is accepted only if at least `min_interval` has passed since the
//! last *accepted* sample. Discarded samples never move the reference point, so
//! a burst of fixes 3 s apart yields one acceptance every `min_interval`.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::LocationSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Arrived sooner than the minimum interval after the last accepted sample
    TooSoon,
    /// Timestamp precedes the last accepted sample
    OutOfOrder,
    /// Coordinates are not finite or out of range
    InvalidCoordinates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    Discard(DiscardReason),
}

#[derive(Debug, Clone)]
pub struct SampleFilter {
    min_interval: chrono::Duration,
    drop_out_of_order: bool,
    last_accepted: Option<DateTime<Utc>>,
}

impl SampleFilter {
    pub fn new(min_interval: Duration, drop_out_of_order: bool) -> Self {
        Self {
            min_interval: chrono::Duration::from_std(min_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(10)),
            drop_out_of_order,
            last_accepted: None,
        }
    }

    /// Resume filtering from a previously accepted timestamp (after rehydration).
    pub fn resume_from(mut self, last_accepted: Option<DateTime<Utc>>) -> Self {
        self.last_accepted = last_accepted;
        self
    }

    pub fn last_accepted(&self) -> Option<DateTime<Utc>> {
        self.last_accepted
    }

    /// Decide on a sample without recording it.
    pub fn check(&self, sample: &LocationSample) -> FilterDecision {
        if !sample.point().is_valid() {
            return FilterDecision::Discard(DiscardReason::InvalidCoordinates);
        }

        let Some(last) = self.last_accepted else {
            return FilterDecision::Accept;
        };

        let elapsed = sample.timestamp - last;
        if elapsed < chrono::Duration::zero() {
            if self.drop_out_of_order {
                return FilterDecision::Discard(DiscardReason::OutOfOrder);
            }
            // Treated as too soon when reordering is tolerated; never reordered
            return FilterDecision::Discard(DiscardReason::TooSoon);
        }
        if elapsed < self.min_interval {
            return FilterDecision::Discard(DiscardReason::TooSoon);
        }
        FilterDecision::Accept
    }

    /// Decide on a sample and, if accepted, make it the new reference point.
    pub fn offer(&mut self, sample: &LocationSample) -> FilterDecision {
        let decision = self.check(sample);
        if decision == FilterDecision::Accept {
            self.last_accepted = Some(sample.timestamp);
        }
        decision
    }
}
