//! Bounded priority event queue.
//!
//! The queue is the single funnel between event producers (button handler,
//! inbound-message listener, sensor timer, scheduler) and the dispatch loop.
//! Lower priority values dequeue first; events of equal priority dequeue in
//! insertion order. The queue never grows past its fixed capacity and never
//! overwrites: a full queue rejects the new event and keeps its contents.
//!
//! # Examples
//!
//! ```
//! # use weighpoint_core::{Event, EventKind, EventQueue};
//! let queue = EventQueue::new(10);
//! queue.enqueue(Event::routine(EventKind::CheckStatus)).unwrap();
//! queue.enqueue(Event::immediate(EventKind::Setup)).unwrap();
//!
//! // The priority-0 event comes out first.
//! assert_eq!(queue.dequeue().unwrap().kind, EventKind::Setup);
//! assert_eq!(queue.dequeue().unwrap().kind, EventKind::CheckStatus);
//! ```

use crate::error::QueueError;
use crate::types::Event;
use std::collections::BinaryHeap;
use std::sync::Mutex;

/// An element that exposes a scheduling priority.
///
/// Lower values are more urgent.
pub trait Prioritized {
    /// The priority of this element; `0` is most urgent.
    fn priority(&self) -> u8;
}

impl Prioritized for Event {
    fn priority(&self) -> u8 {
        self.priority
    }
}

/// A queued element tagged with its insertion sequence.
///
/// The sequence number breaks priority ties so that equal-priority elements
/// leave the heap in insertion order.
#[derive(Debug)]
struct Slot<T> {
    item: T,
    priority: u8,
    sequence: u64,
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for Slot<T> {}

impl<T> PartialOrd for Slot<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Slot<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap pops the maximum, so the lowest priority value and the
        // lowest sequence must compare greatest.
        match other.priority.cmp(&self.priority) {
            std::cmp::Ordering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

#[derive(Debug)]
struct Inner<T> {
    heap: BinaryHeap<Slot<T>>,
    next_sequence: u64,
}

/// A bounded priority queue over any [`Prioritized`] element.
///
/// Producers on other tasks share the queue by reference; all mutation
/// happens under an internal mutex whose critical sections do nothing but
/// move data.
#[derive(Debug)]
pub struct PriorityQueue<T: Prioritized> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

/// The event queue driving the dispatch loop.
pub type EventQueue = PriorityQueue<Event>;

impl<T: Prioritized> PriorityQueue<T> {
    /// Create a queue holding at most `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::with_capacity(capacity),
                next_sequence: 0,
            }),
            capacity,
        }
    }

    /// Insert an element in priority order.
    ///
    /// Fails with [`QueueError::Full`] when the queue is at capacity; the
    /// existing contents are untouched.
    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.heap.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let priority = item.priority();
        inner.heap.push(Slot {
            item,
            priority,
            sequence,
        });
        Ok(())
    }

    /// Remove and return the most urgent element.
    ///
    /// Fails with [`QueueError::Empty`] when there is nothing queued.
    pub fn dequeue(&self) -> Result<T, QueueError> {
        self.lock()
            .heap
            .pop()
            .map(|slot| slot.item)
            .ok_or(QueueError::Empty)
    }

    /// `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    /// The fixed capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        // A poisoned lock still holds a structurally intact heap.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
