//! The two queues a batch moves destinations through.
//!
//! [`DispatchQueue`] is the bounded single-producer/multi-consumer buffer of
//! the primary phase. [`DeadLetterQueue`] is the unbounded holding area for
//! destinations whose per-link attempts were exhausted, drained by the
//! recovery workers. Each dead letter remembers the links it already failed
//! on during recovery.
//!
//! Both follow the same waiting discipline: a waiter registers with its
//! [`Notify`] *before* checking the predicate under the lock, so a
//! notification sent between the check and the `.await` is never lost.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

use smspool_models::LinkId;
use tokio::sync::Notify;

/// Fixed capacity of the primary dispatch queue.
pub const DISPATCH_QUEUE_CAPACITY: usize = 10;

// ---------------------------------------------------------------------------
// DispatchQueue
// ---------------------------------------------------------------------------

struct DispatchState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded buffer between the producer and the consumers.
pub struct DispatchQueue<T> {
    state: Mutex<DispatchState<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> DispatchQueue<T> {
    /// A queue holding at most `capacity` items (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(DispatchState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Append an item, suspending while the queue is full.
    ///
    /// Hands the item back if the queue was closed.
    pub async fn push(&self, item: T) -> Result<(), T> {
        loop {
            let mut notified = pin!(self.not_full.notified());
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.closed {
                    return Err(item);
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(item);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Take the oldest item, suspending while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let mut notified = pin!(self.not_empty.notified());
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark production complete and wake every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for DispatchQueue<T> {
    fn default() -> Self {
        Self::with_capacity(DISPATCH_QUEUE_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// DeadLetterQueue
// ---------------------------------------------------------------------------

struct DeadLetterState<T> {
    items: VecDeque<DeadLetter<T>>,
    in_flight: usize,
}

/// A dead-lettered item with the links its recovery already failed on.
#[derive(Debug)]
pub struct DeadLetter<T> {
    pub item: T,
    failed_on: Vec<LinkId>,
}

impl<T> DeadLetter<T> {
    pub fn failed_on(&self) -> &[LinkId] {
        &self.failed_on
    }
}

/// Unbounded queue of failed destinations awaiting recovery.
///
/// A recovery worker [`take`](Self::take)s an item, attempts it, then either
/// [`resolve`](Self::resolve)s it or [`requeue`](Self::requeue)s it against
/// its link. An item is never handed again to a link it failed on. The
/// queue is finished for a link when nothing left is eligible for it and
/// no item is in flight.
pub struct DeadLetterQueue<T> {
    state: Mutex<DeadLetterState<T>>,
    changed: Notify,
}

impl<T> DeadLetterQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeadLetterState {
                items: VecDeque::new(),
                in_flight: 0,
            }),
            changed: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Items taken and not yet resolved or requeued.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn push(&self, item: T) {
        self.lock().items.push_back(DeadLetter {
            item,
            failed_on: Vec::new(),
        });
        self.changed.notify_waiters();
    }

    /// Take the oldest item `link` has not failed on yet.
    ///
    /// Suspends while nothing is eligible but another attempt is in flight,
    /// since that attempt may requeue. Returns `None` once nothing eligible
    /// is queued and nothing is in flight.
    pub async fn take(&self, link: LinkId) -> Option<DeadLetter<T>> {
        loop {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                let eligible = state
                    .items
                    .iter()
                    .position(|letter| !letter.failed_on.contains(&link));
                if let Some(letter) = eligible.and_then(|pos| state.items.remove(pos)) {
                    state.in_flight += 1;
                    return Some(letter);
                }
                if state.in_flight == 0 {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// The taken item was delivered.
    pub fn resolve(&self) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.changed.notify_waiters();
    }

    /// The taken item failed again on `link`; put it back for other links.
    pub fn requeue(&self, mut letter: DeadLetter<T>, link: LinkId) {
        if !letter.failed_on.contains(&link) {
            letter.failed_on.push(link);
        }
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.items.push_back(letter);
        }
        self.changed.notify_waiters();
    }

    /// Remove and return everything still queued.
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = self.lock().items.drain(..).map(|letter| letter.item).collect();
        self.changed.notify_waiters();
        items
    }

    fn lock(&self) -> MutexGuard<'_, DeadLetterState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for DeadLetterQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
