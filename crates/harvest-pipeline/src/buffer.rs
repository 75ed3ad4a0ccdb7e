//! Priority event buffer.
//!
//! Two independent bounded FIFO queues, one per [`PriorityClass`]. Producers
//! push into an unbounded lock-free channel and bump an atomic length; only
//! pollers take the per-class poll lock, so `add_event` never waits on a
//! harvest. Adding an event may fire two notifications on the caller's thread:
//!
//! - first event: the class queue went from empty to non-empty
//! - near full: occupancy reached the profile's near-full ratio
//!
//! Near-full fires once per crossing and re-arms when a poll brings the queue
//! back under the ratio. Evicting the oldest events only happens when a burst
//! outruns the near-full harvest and the queue exceeds its ceiling.

use crate::{estimate_or_fallback, RecoveryStats, SizeEstimator};
use crossbeam_channel::{unbounded, Receiver, Sender};
use harvest_config_and_utils::{Event, PriorityClass, Profile};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives buffer threshold notifications.
///
/// Called synchronously from `add_event`; implementations must not block.
pub trait BufferObserver: Send + Sync {
    /// The class queue received an event while empty.
    fn on_first_event(&self, class: PriorityClass);

    /// The class queue reached its near-full ratio.
    fn on_near_full(&self, class: PriorityClass);
}

/// Queue surface shared by the plain and crash-safe buffers.
pub trait EventQueue: Send + Sync {
    fn add_event(&self, event: Event);

    /// Remove up to one poll's worth of events of `class`, bounded by the
    /// class poll cap and `max_bytes`.
    fn poll_batch(
        &self,
        max_bytes: usize,
        estimator: Option<&dyn SizeEstimator>,
        class: PriorityClass,
    ) -> Vec<Event>;

    /// Events waiting across both classes.
    fn count(&self) -> usize;

    /// Events waiting in memory for one class.
    fn count_for(&self, class: PriorityClass) -> usize;

    fn capacity(&self, class: PriorityClass) -> usize;

    fn is_empty(&self) -> bool;

    fn set_observer(&self, observer: Arc<dyn BufferObserver>);

    /// Events dropped by the hard-ceiling backstop.
    fn evicted_count(&self) -> u64;

    /// Repeated actions folded into their newest occurrence.
    fn collapsed_count(&self) -> u64;

    /// Move everything in memory to durable storage. Returns events saved.
    fn emergency_backup(&self) -> usize {
        0
    }

    fn recovery_stats(&self) -> Option<RecoveryStats> {
        None
    }

    /// Record that the process is ending cleanly.
    fn mark_clean_shutdown(&self) {}
}

struct ClassQueue {
    sender: Sender<Event>,
    receiver: Receiver<Event>,
    /// Events in the channel plus the held-over head. Incremented before a
    /// send and decremented after a receive, so it never undercounts.
    len: AtomicUsize,
    /// Head event a poll received but could not fit in its batch.
    /// Holding this lock is what serialises pollers.
    held: Mutex<Option<Event>>,
    capacity: usize,
    poll_cap: usize,
    near_full_armed: AtomicBool,
}

impl ClassQueue {
    fn new(capacity: usize, poll_cap: usize) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            len: AtomicUsize::new(0),
            held: Mutex::new(None),
            capacity: capacity.max(1),
            poll_cap: poll_cap.max(1),
            near_full_armed: AtomicBool::new(true),
        }
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Drop the oldest event without waiting on a poll in progress.
    fn evict_oldest(&self) -> bool {
        if let Some(mut held) = self.held.try_lock() {
            if held.take().is_some() {
                self.len.fetch_sub(1, Ordering::AcqRel);
                return true;
            }
        }
        match self.receiver.try_recv() {
            Ok(_) => {
                self.len.fetch_sub(1, Ordering::AcqRel);
                true
            }
            Err(_) => false,
        }
    }
}

/// In-memory two-class event buffer.
pub struct EventBuffer {
    profile: Arc<Profile>,
    live: ClassQueue,
    on_demand: ClassQueue,
    observer: RwLock<Option<Arc<dyn BufferObserver>>>,
    evicted: AtomicU64,
    collapsed: AtomicU64,
}

impl EventBuffer {
    pub fn new(profile: Arc<Profile>) -> Self {
        Self {
            live: ClassQueue::new(profile.live_capacity, profile.live_poll_cap),
            on_demand: ClassQueue::new(profile.on_demand_capacity, profile.on_demand_poll_cap),
            profile,
            observer: RwLock::new(None),
            evicted: AtomicU64::new(0),
            collapsed: AtomicU64::new(0),
        }
    }

    fn queue(&self, class: PriorityClass) -> &ClassQueue {
        match class {
            PriorityClass::Live => &self.live,
            PriorityClass::OnDemand => &self.on_demand,
        }
    }

    fn observer(&self) -> Option<Arc<dyn BufferObserver>> {
        self.observer.read().clone()
    }

    fn is_near_full(&self, len: usize, capacity: usize) -> bool {
        len as f64 / capacity as f64 >= self.profile.near_full_ratio
    }

    /// Whether `next` repeats the action of the newest event in `batch`.
    fn repeats_last_action(&self, batch: &[Event], next: &Event) -> bool {
        if !self.profile.collapse_repeated_actions {
            return false;
        }
        match (batch.last().and_then(Event::action_name), next.action_name()) {
            (Some(last), Some(action)) => last == action,
            _ => false,
        }
    }

    /// Remove every event of a class regardless of poll caps.
    pub fn drain_class(&self, class: PriorityClass) -> Vec<Event> {
        let queue = self.queue(class);
        let mut held = queue.held.lock();

        let mut drained: Vec<Event> = held.take().into_iter().collect();
        drained.extend(queue.receiver.try_iter());
        queue.len.fetch_sub(drained.len(), Ordering::AcqRel);
        drop(held);

        queue.near_full_armed.store(true, Ordering::Release);
        drained
    }
}

impl EventQueue for EventBuffer {
    fn add_event(&self, event: Event) {
        let class = event.priority_class();
        let queue = self.queue(class);

        let previous = queue.len.fetch_add(1, Ordering::AcqRel);
        if queue.sender.send(event).is_err() {
            queue.len.fetch_sub(1, Ordering::AcqRel);
            warn!(class = %class, "Buffer channel closed, dropping event");
            return;
        }

        let mut evicted = 0u64;
        while queue.len() > queue.capacity && queue.evict_oldest() {
            evicted += 1;
        }
        if evicted > 0 {
            self.evicted.fetch_add(evicted, Ordering::Relaxed);
            warn!(
                class = %class,
                evicted,
                capacity = queue.capacity,
                "Buffer over capacity, dropped oldest events"
            );
        }

        let Some(observer) = self.observer() else {
            return;
        };

        if previous == 0 {
            observer.on_first_event(class);
        }

        let len = queue.len();
        if self.is_near_full(len, queue.capacity)
            && queue.near_full_armed.swap(false, Ordering::AcqRel)
        {
            debug!(class = %class, len, "Buffer near full");
            observer.on_near_full(class);
        }
    }

    fn poll_batch(
        &self,
        max_bytes: usize,
        estimator: Option<&dyn SizeEstimator>,
        class: PriorityClass,
    ) -> Vec<Event> {
        let queue = self.queue(class);
        let Some(mut held) = queue.held.try_lock_for(self.profile.poll_lock_timeout) else {
            debug!(class = %class, "Poll lock busy, returning empty batch");
            return Vec::new();
        };

        let mut batch: Vec<Event> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut last_size = 0usize;
        let mut collapsed = 0u64;
        while batch.len() < queue.poll_cap {
            let next = match held.take() {
                Some(event) => event,
                None => match queue.receiver.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };

            let size = estimate_or_fallback(estimator, &next);
            let replaces_last = self.repeats_last_action(&batch, &next);
            let base = if replaces_last {
                batch_bytes - last_size
            } else {
                batch_bytes
            };
            let alone = batch.is_empty() || (replaces_last && batch.len() == 1);
            if !alone && base.saturating_add(size) > max_bytes {
                *held = Some(next);
                break;
            }

            queue.len.fetch_sub(1, Ordering::AcqRel);
            if replaces_last {
                batch.pop();
                collapsed += 1;
            }
            batch.push(next);
            batch_bytes = base.saturating_add(size);
            last_size = size;
        }
        drop(held);

        if collapsed > 0 {
            self.collapsed.fetch_add(collapsed, Ordering::Relaxed);
        }
        if !self.is_near_full(queue.len(), queue.capacity) {
            queue.near_full_armed.store(true, Ordering::Release);
        }

        batch
    }

    fn count(&self) -> usize {
        self.live.len() + self.on_demand.len()
    }

    fn count_for(&self, class: PriorityClass) -> usize {
        self.queue(class).len()
    }

    fn capacity(&self, class: PriorityClass) -> usize {
        self.queue(class).capacity
    }

    fn is_empty(&self) -> bool {
        self.count() == 0
    }

    fn set_observer(&self, observer: Arc<dyn BufferObserver>) {
        *self.observer.write() = Some(observer);
    }

    fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn collapsed_count(&self) -> u64 {
        self.collapsed.load(Ordering::Relaxed)
    }
}
