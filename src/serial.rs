//! Execution-timeline serials and serial-tagged queues.
//!
//! Work handed to the GPU is identified by a strictly increasing [`Serial`].
//! Anything that must wait for the GPU (deferred destruction, memory
//! reclamation, command recycling) is tagged with the serial of the submission
//! it belongs to and parked in a [`SerialQueue`] until the device observes
//! that serial as completed.

use std::collections::VecDeque;

/// A point on the device's execution timeline.
///
/// The first submission gets serial 1; [`Serial::ZERO`] is reserved for
/// "nothing has completed yet". Serials are totally ordered and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Serial(u64);

impl Serial {
    /// The serial before any submission.
    pub const ZERO: Serial = Serial(0);

    /// The serial assigned to the first submission.
    pub const FIRST: Serial = Serial(1);

    /// Create a serial from a raw counter value.
    pub const fn from_raw(value: u64) -> Self {
        Serial(value)
    }

    /// The raw counter value.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The serial immediately after this one.
    pub const fn next(self) -> Serial {
        Serial(self.0 + 1)
    }

    /// The serial immediately before this one.
    ///
    /// Saturates at [`Serial::ZERO`].
    pub const fn previous(self) -> Serial {
        Serial(self.0.saturating_sub(1))
    }

    /// Whether this is the reserved "nothing completed" serial.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered association of items to the serial of the submission they
/// belong to.
///
/// Items are enqueued with non-decreasing serials (submission order) and
/// drained once the device reports their serial as completed. Insertion order
/// is preserved within equal serials. This is pure bookkeeping: no I/O, no
/// failure modes.
#[derive(Debug)]
pub struct SerialQueue<T> {
    entries: VecDeque<(Serial, T)>,
}

impl<T> Default for SerialQueue<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<T> SerialQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `item` tagged with `serial`.
    ///
    /// Serials must be enqueued in non-decreasing order.
    pub fn enqueue(&mut self, item: T, serial: Serial) {
        debug_assert!(
            self.entries.back().map_or(true, |(s, _)| *s <= serial),
            "serials must be enqueued in non-decreasing order"
        );
        self.entries.push_back((serial, item));
    }

    /// Remove and yield every item whose tag is ≤ `serial`, in tag-then-
    /// insertion order.
    pub fn drain_up_to(&mut self, serial: Serial) -> impl Iterator<Item = T> + '_ {
        let end = self.entries.partition_point(|(s, _)| *s <= serial);
        self.entries.drain(..end).map(|(_, item)| item)
    }

    /// Remove and yield every item regardless of tag.
    pub fn drain_all(&mut self) -> impl Iterator<Item = T> + '_ {
        self.entries.drain(..).map(|(_, item)| item)
    }

    /// The tag of the most recently enqueued item.
    pub fn last_serial(&self) -> Option<Serial> {
        self.entries.back().map(|(s, _)| *s)
    }

    /// The tag of the oldest item still queued.
    pub fn first_serial(&self) -> Option<Serial> {
        self.entries.front().map(|(s, _)| *s)
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_ordering() {
        assert!(Serial::ZERO < Serial::FIRST);
        assert_eq!(Serial::FIRST.next(), Serial::from_raw(2));
        assert_eq!(Serial::FIRST.previous(), Serial::ZERO);
        assert_eq!(Serial::ZERO.previous(), Serial::ZERO);
        assert!(Serial::ZERO.is_zero());
        assert!(!Serial::FIRST.is_zero());
    }

    #[test]
    fn test_drain_up_to_splits_on_tag() {
        let mut queue = SerialQueue::new();
        queue.enqueue("a", Serial::from_raw(1));
        queue.enqueue("b", Serial::from_raw(2));
        queue.enqueue("c", Serial::from_raw(2));
        queue.enqueue("d", Serial::from_raw(3));

        let drained: Vec<_> = queue.drain_up_to(Serial::from_raw(2)).collect();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.first_serial(), Some(Serial::from_raw(3)));
    }

    #[test]
    fn test_drain_up_to_preserves_insertion_order_within_serial() {
        let mut queue = SerialQueue::new();
        for item in 0..4 {
            queue.enqueue(item, Serial::from_raw(5));
        }
        let drained: Vec<_> = queue.drain_up_to(Serial::from_raw(5)).collect();
        assert_eq!(drained, vec![0, 1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_below_first_tag_yields_nothing() {
        let mut queue = SerialQueue::new();
        queue.enqueue("a", Serial::from_raw(4));
        assert_eq!(queue.drain_up_to(Serial::from_raw(3)).count(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_all() {
        let mut queue = SerialQueue::new();
        queue.enqueue(1, Serial::from_raw(1));
        queue.enqueue(2, Serial::from_raw(9));
        let drained: Vec<_> = queue.drain_all().collect();
        assert_eq!(drained, vec![1, 2]);
        assert!(queue.is_empty());
    }
}
