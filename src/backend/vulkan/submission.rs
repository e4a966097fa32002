//! Submission serial tracking.
//!
//! The device owns a single queue, so every submission is identified by one
//! strictly increasing [`Serial`] and guarded by one fence. Fences signal in
//! submission order, which lets completion polling stop at the first fence
//! that has not signaled yet: everything before it is guaranteed done.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::serial::Serial;

/// Shared view of the device's execution timeline.
///
/// `next_serial` is the serial the currently recording submission will receive
/// at submit time; `completed_serial` is the watermark of GPU progress. The
/// watermark only ever advances, and never past the last submitted serial.
#[derive(Debug)]
pub struct Timeline {
    next_serial: AtomicU64,
    completed_serial: AtomicU64,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeline {
    /// Create a timeline with no submissions and nothing completed.
    pub fn new() -> Self {
        Self {
            next_serial: AtomicU64::new(Serial::FIRST.value()),
            completed_serial: AtomicU64::new(Serial::ZERO.value()),
        }
    }

    /// The serial the pending submission will be assigned.
    pub fn pending_serial(&self) -> Serial {
        Serial::from_raw(self.next_serial.load(Ordering::Relaxed))
    }

    /// The serial of the most recent submission, or [`Serial::ZERO`] if
    /// nothing was ever submitted.
    pub fn last_submitted(&self) -> Serial {
        self.pending_serial().previous()
    }

    /// The watermark of completed GPU work.
    pub fn completed(&self) -> Serial {
        Serial::from_raw(self.completed_serial.load(Ordering::Relaxed))
    }

    /// Assign the pending serial to a submission and advance the counter.
    fn advance_submit(&self) -> Serial {
        Serial::from_raw(self.next_serial.fetch_add(1, Ordering::SeqCst))
    }

    /// Advance the completed watermark.
    fn set_completed(&self, serial: Serial) {
        debug_assert!(serial >= self.completed());
        debug_assert!(serial <= self.last_submitted());
        self.completed_serial.store(serial.value(), Ordering::SeqCst);
    }
}

/// Ordered queue of in-flight submissions, each guarded by a fence.
#[derive(Debug)]
pub struct SubmissionTracker<F> {
    in_flight: VecDeque<(F, Serial)>,
}

impl<F> Default for SubmissionTracker<F> {
    fn default() -> Self {
        Self {
            in_flight: VecDeque::new(),
        }
    }
}

impl<F> SubmissionTracker<F> {
    /// Create a tracker with no submissions in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a submission guarded by `fence` and return its assigned serial.
    pub fn submit(&mut self, fence: F, timeline: &Timeline) -> Serial {
        let serial = timeline.advance_submit();
        self.in_flight.push_back((fence, serial));
        serial
    }

    /// Poll in-flight fences in submission order and advance the completed
    /// watermark to the last one found signaled.
    ///
    /// `signaled` reports whether a fence has signaled; an unsignaled fence
    /// stops the poll early (everything after it is still in flight). Retired
    /// fences are returned in submission order for recycling.
    pub fn poll<E>(
        &mut self,
        timeline: &Timeline,
        mut signaled: impl FnMut(&F) -> Result<bool, E>,
    ) -> Result<Vec<F>, E> {
        let mut retired = Vec::new();
        while let Some((fence, serial)) = self.in_flight.front() {
            if !signaled(fence)? {
                break;
            }
            let serial = *serial;
            timeline.set_completed(serial);
            let (fence, _) = self.in_flight.pop_front().expect("front checked above");
            retired.push(fence);
        }
        Ok(retired)
    }

    /// Number of submissions still in flight.
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether no submissions are in flight.
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Fences of all in-flight submissions, in submission order.
    pub fn fences(&self) -> impl Iterator<Item = &F> {
        self.in_flight.iter().map(|(fence, _)| fence)
    }
}
