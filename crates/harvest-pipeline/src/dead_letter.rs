//! Dead-letter retry queue.
//!
//! Batches that failed delivery are wrapped with [`RetryMetadata`] and held in
//! a bounded in-memory queue. Each retry pass resends the entries whose
//! backoff has elapsed; entries that keep failing are handed to a
//! [`FailedEventSink`] once they reach the profile's retry ceiling.
//!
//! Backoff by retry count (with the default tiers):
//!
//! | Retry count | Wait since last failure |
//! |-------------|-------------------------|
//! | 0           | 30s                     |
//! | 1           | 60s                     |
//! | 2+          | 60s * 2^(n-1), max 120s |

use crate::{estimate_or_fallback, SizeEstimator};
use harvest_config_and_utils::{Event, Profile, SharedClock};
use harvest_delivery::EventSender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const ORIGINAL_EVENT_KEY: &str = "originalEvent";
const RETRY_METADATA_KEY: &str = "retryMetadata";

/// Bookkeeping carried next to a failed event, never inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryMetadata {
    pub retry_count: u32,
    /// Milliseconds since the Unix epoch of the most recent failure.
    pub failed_at: i64,
    pub original_category: String,
    pub first_failed_at: i64,
}

/// A failed event and its retry metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub original_event: Event,
    pub retry_metadata: RetryMetadata,
}

impl DeadLetterEntry {
    /// Wrap a failed event.
    ///
    /// An event that already is a `{originalEvent, retryMetadata}` wrapper
    /// keeps its retry count and first failure time.
    pub fn wrap(event: Event, category: &str, now_ms: i64) -> Self {
        if event.get(ORIGINAL_EVENT_KEY).is_some() && event.get(RETRY_METADATA_KEY).is_some() {
            let raw = Value::Object(event.fields().clone());
            if let Ok(mut entry) = serde_json::from_value::<DeadLetterEntry>(raw) {
                entry.retry_metadata.failed_at = now_ms;
                entry.retry_metadata.original_category = category.to_string();
                return entry;
            }
        }

        Self {
            original_event: event,
            retry_metadata: RetryMetadata {
                retry_count: 0,
                failed_at: now_ms,
                original_category: category.to_string(),
                first_failed_at: now_ms,
            },
        }
    }

    /// Strip the wrapper.
    pub fn into_event(self) -> Event {
        self.original_event
    }
}

/// Destination for events that can no longer be retried in memory.
pub trait FailedEventSink: Send + Sync {
    /// Take ownership of clean events. Returns how many were kept.
    fn backup_failed_events(&self, events: Vec<Event>) -> usize;

    /// Whether events handed over survive a restart.
    fn is_durable(&self) -> bool;
}

/// Sink for pipelines without durable storage: logs and drops.
#[derive(Debug, Default)]
pub struct DiscardingSink;

impl FailedEventSink for DiscardingSink {
    fn backup_failed_events(&self, events: Vec<Event>) -> usize {
        if !events.is_empty() {
            warn!(count = events.len(), "No durable storage, dropping undeliverable events");
        }
        0
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Wait required after the last failure before an entry is retried.
pub fn compute_retry_interval(retry_count: u32, profile: &Profile) -> Duration {
    match retry_count {
        0 => profile.retry_first_interval,
        1 => profile.retry_second_interval,
        n => {
            let multiplier = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
            profile
                .retry_second_interval
                .saturating_mul(multiplier)
                .min(profile.retry_max_interval)
        }
    }
}

/// Whether the entry's backoff has elapsed at `now_ms`.
pub fn is_retry_due(metadata: &RetryMetadata, now_ms: i64, profile: &Profile) -> bool {
    let interval = compute_retry_interval(metadata.retry_count, profile);
    let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_sub(metadata.failed_at) >= interval_ms
}

/// Result of one retry pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryOutcome {
    /// Entries resent.
    pub attempted: usize,
    /// Entries delivered.
    pub delivered: usize,
    /// Entries put back with a higher retry count.
    pub requeued: usize,
    /// Entries handed to the sink after reaching the retry ceiling.
    pub exhausted: usize,
    /// Entries put back because their backoff has not elapsed.
    pub not_due: usize,
}

/// Dead-letter counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    pub queued: usize,
    pub capacity: usize,
    pub evicted: u64,
    pub exhausted: u64,
    pub diverted: u64,
}

/// Clears the single-flight flag when dropped.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// In-memory retry queue with tiered backoff.
pub struct DeadLetterRetrySubsystem {
    profile: Arc<Profile>,
    queue: Mutex<VecDeque<DeadLetterEntry>>,
    sender: Arc<dyn EventSender>,
    sink: Arc<dyn FailedEventSink>,
    estimator: Arc<dyn SizeEstimator>,
    clock: SharedClock,
    processing: AtomicBool,
    evicted: AtomicU64,
    exhausted: AtomicU64,
    diverted: AtomicU64,
}

impl DeadLetterRetrySubsystem {
    pub fn new(
        profile: Arc<Profile>,
        sender: Arc<dyn EventSender>,
        sink: Arc<dyn FailedEventSink>,
        estimator: Arc<dyn SizeEstimator>,
        clock: SharedClock,
    ) -> Self {
        Self {
            profile,
            queue: Mutex::new(VecDeque::new()),
            sender,
            sink,
            estimator,
            clock,
            processing: AtomicBool::new(false),
            evicted: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            diverted: AtomicU64::new(0),
        }
    }

    /// Queue a failed batch for retry.
    ///
    /// Returns false when another pass holds the queue; the batch then goes
    /// straight to the sink instead of waiting.
    pub fn handle_failed_events(&self, batch: Vec<Event>, category: &str) -> bool {
        if batch.is_empty() {
            return true;
        }

        let Some(_guard) = ProcessingGuard::acquire(&self.processing) else {
            debug!(count = batch.len(), category, "Dead-letter queue busy, diverting batch");
            self.diverted.fetch_add(batch.len() as u64, Ordering::Relaxed);
            self.sink.backup_failed_events(batch);
            return false;
        };

        let now = self.clock.now_millis();
        let count = batch.len();
        let entries = batch
            .into_iter()
            .map(|event| DeadLetterEntry::wrap(event, category, now));
        self.enqueue(entries);

        debug!(count, category, queued = self.len(), "Queued failed events for retry");
        true
    }

    fn enqueue(&self, entries: impl IntoIterator<Item = DeadLetterEntry>) {
        let capacity = self.profile.dead_letter_capacity.max(1);
        let mut queue = self.queue.lock();
        let mut evicted = 0u64;
        for entry in entries {
            while queue.len() >= capacity {
                queue.pop_front();
                evicted += 1;
            }
            queue.push_back(entry);
        }
        drop(queue);

        if evicted > 0 {
            self.evicted.fetch_add(evicted, Ordering::Relaxed);
            warn!(evicted, capacity, "Dead-letter queue full, dropped oldest entries");
        }
    }

    /// Take the next retry window from the head of the queue.
    fn poll_window(&self) -> Vec<DeadLetterEntry> {
        let mut queue = self.queue.lock();
        let mut window = Vec::new();
        let mut bytes = 0usize;

        while window.len() < self.profile.retry_batch_events.max(1) {
            let Some(next) = queue.front() else {
                break;
            };
            let size = estimate_or_fallback(Some(self.estimator.as_ref()), &next.original_event);
            if !window.is_empty() && bytes.saturating_add(size) > self.profile.retry_batch_bytes {
                break;
            }
            if let Some(entry) = queue.pop_front() {
                window.push(entry);
                bytes = bytes.saturating_add(size);
            }
        }
        window
    }

    /// Return entries to the head of the queue in their original order.
    fn put_back_front(&self, entries: Vec<DeadLetterEntry>) {
        let mut queue = self.queue.lock();
        for entry in entries.into_iter().rev() {
            queue.push_front(entry);
        }
    }

    /// Resend the entries whose backoff has elapsed.
    pub async fn retry_failed_events(&self) -> RetryOutcome {
        let mut outcome = RetryOutcome::default();

        let Some(_guard) = ProcessingGuard::acquire(&self.processing) else {
            debug!("Dead-letter retry already in progress");
            return outcome;
        };

        if self.sender.backoff_remaining().is_some() {
            debug!("Collector backoff active, skipping dead-letter retry");
            return outcome;
        }

        let window = self.poll_window();
        if window.is_empty() {
            return outcome;
        }

        let now = self.clock.now_millis();
        let (due, not_due): (Vec<_>, Vec<_>) = window
            .into_iter()
            .partition(|entry| is_retry_due(&entry.retry_metadata, now, &self.profile));

        outcome.not_due = not_due.len();
        if !not_due.is_empty() {
            self.put_back_front(not_due);
        }
        if due.is_empty() {
            return outcome;
        }

        outcome.attempted = due.len();
        let endpoint_tag = format!("{}-retry", due[0].retry_metadata.original_category);
        let clean: Vec<Event> = due.iter().map(|entry| entry.original_event.clone()).collect();

        if self.sender.send(&clean, &endpoint_tag).await {
            outcome.delivered = due.len();
            info!(count = due.len(), endpoint = %endpoint_tag, "Dead-letter retry delivered");
            return outcome;
        }

        let failed_at = self.clock.now_millis();
        let max_retries = self.profile.max_retries;
        let mut requeue = Vec::new();
        let mut exhausted = Vec::new();
        for mut entry in due {
            entry.retry_metadata.retry_count = entry.retry_metadata.retry_count.saturating_add(1);
            entry.retry_metadata.failed_at = failed_at;
            if entry.retry_metadata.retry_count >= max_retries {
                exhausted.push(entry);
            } else {
                requeue.push(entry);
            }
        }

        outcome.requeued = requeue.len();
        outcome.exhausted = exhausted.len();
        self.enqueue(requeue);

        if !exhausted.is_empty() {
            self.exhausted
                .fetch_add(exhausted.len() as u64, Ordering::Relaxed);
            let oldest = exhausted
                .iter()
                .map(|entry| entry.retry_metadata.first_failed_at)
                .min()
                .unwrap_or(failed_at);
            warn!(
                count = exhausted.len(),
                max_retries,
                waited_secs = (failed_at - oldest) / 1000,
                "Retries exhausted, moving events to durable storage"
            );
            self.sink
                .backup_failed_events(exhausted.into_iter().map(DeadLetterEntry::into_event).collect());
        }

        outcome
    }

    /// Move the whole queue to the sink. Returns entries handed over.
    ///
    /// Does nothing when the sink is not durable.
    pub fn emergency_backup(&self) -> usize {
        if !self.sink.is_durable() {
            return 0;
        }

        let drained: Vec<Event> = self
            .queue
            .lock()
            .drain(..)
            .map(DeadLetterEntry::into_event)
            .collect();
        if drained.is_empty() {
            return 0;
        }

        let count = drained.len();
        self.sink.backup_failed_events(drained);
        info!(count, "Dead-letter queue backed up");
        count
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Copy of the queued entries, oldest first.
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.queue.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> DeadLetterStats {
        DeadLetterStats {
            queued: self.len(),
            capacity: self.profile.dead_letter_capacity,
            evicted: self.evicted.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            diverted: self.diverted.load(Ordering::Relaxed),
        }
    }
}
