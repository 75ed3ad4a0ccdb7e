//! Crash-safe event buffer.
//!
//! Wraps [`EventBuffer`] with a durable backlog. At construction it reads the
//! session flag left by the previous run and checks the durable store; any
//! stored rows put the buffer in recovery mode, where each poll tops up a
//! short batch with a few durable rows until the store is empty.
//!
//! The session flag is set for the lifetime of the process and cleared by
//! [`EventQueue::mark_clean_shutdown`]. Finding it still set at startup means
//! the previous run ended without a clean shutdown.

use crate::{
    estimate_or_fallback, BufferObserver, EventBuffer, EventQueue, FailedEventSink,
    PipelineResult, SizeEstimator,
};
use harvest_config_and_utils::{Event, PriorityClass, Profile, SharedClock};
use harvest_store::{DurableStore, SessionFlagStore, LAST_EVENT_COUNT_KEY, SESSION_ACTIVE_KEY};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Snapshot of the durable backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    pub is_recovering: bool,
    /// Rows waiting in the durable store.
    pub backup_events: u64,
    /// Events waiting in memory.
    pub memory_events: usize,
    pub is_tv: bool,
}

/// [`EventBuffer`] backed by a [`DurableStore`] and a session flag.
pub struct CrashSafeEventBuffer {
    inner: EventBuffer,
    profile: Arc<Profile>,
    store: Arc<DurableStore>,
    flags: Arc<dyn SessionFlagStore>,
    clock: SharedClock,
    recovering: AtomicBool,
    crash_detected: bool,
    previous_event_count: u64,
    event_count: AtomicU64,
}

impl CrashSafeEventBuffer {
    pub fn new(
        profile: Arc<Profile>,
        store: Arc<DurableStore>,
        flags: Arc<dyn SessionFlagStore>,
        clock: SharedClock,
    ) -> PipelineResult<Self> {
        let was_active = flags.get_flag(SESSION_ACTIVE_KEY)?;
        let previous_event_count = flags.get_counter(LAST_EVENT_COUNT_KEY)?;
        let counts = store.counts()?;
        let has_backlog = counts.total() > 0;
        let crash_detected = was_active && has_backlog;

        if crash_detected {
            warn!(
                live = counts.live,
                on_demand = counts.on_demand,
                previous_event_count,
                "Previous session ended uncleanly, recovering durable backlog"
            );
        } else if has_backlog {
            info!(
                live = counts.live,
                on_demand = counts.on_demand,
                "Durable backlog found, recovering"
            );
        } else if was_active {
            info!(previous_event_count, "Previous session ended uncleanly with nothing stored");
        }

        flags.set_flag(SESSION_ACTIVE_KEY, true)?;
        flags.set_counter(LAST_EVENT_COUNT_KEY, 0)?;

        Ok(Self {
            inner: EventBuffer::new(profile.clone()),
            profile,
            store,
            flags,
            clock,
            recovering: AtomicBool::new(has_backlog),
            crash_detected,
            previous_event_count,
            event_count: AtomicU64::new(0),
        })
    }

    /// Whether the previous run left the session flag set with a backlog.
    pub fn crash_detected(&self) -> bool {
        self.crash_detected
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    /// Event count checkpointed by the previous run.
    pub fn previous_event_count(&self) -> u64 {
        self.previous_event_count
    }

    /// Events added during this run.
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    fn stored_rows(&self) -> u64 {
        match self.store.count() {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to count durable rows");
                0
            }
        }
    }

    /// Pull up to `room` durable rows for `class` that fit in what is left
    /// of `max_bytes` after `fresh`.
    ///
    /// A lone row larger than the budget is taken when `fresh` is empty.
    fn top_up(
        &self,
        class: PriorityClass,
        room: usize,
        max_bytes: usize,
        estimator: Option<&dyn SizeEstimator>,
        fresh: &[Event],
    ) -> Vec<Event> {
        let mut used: usize = fresh
            .iter()
            .map(|event| estimate_or_fallback(estimator, event))
            .sum();
        let mut alone = fresh.is_empty();

        let polled = self.store.poll_records_while(class, room, |event| {
            let size = estimate_or_fallback(estimator, event);
            if !alone && used.saturating_add(size) > max_bytes {
                return false;
            }
            alone = false;
            used = used.saturating_add(size);
            true
        });

        match polled {
            Ok(rows) => rows,
            Err(e) => {
                warn!(class = %class, error = %e, "Failed to read durable backlog");
                Vec::new()
            }
        }
    }

    fn finish_recovery_if_drained(&self) {
        match self.store.is_empty() {
            Ok(true) => {
                if self.recovering.swap(false, Ordering::AcqRel) {
                    info!("Durable backlog drained, recovery complete");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to check durable backlog"),
        }
    }

    fn checkpoint(&self, count: u64) {
        if let Err(e) = self.flags.set_counter(LAST_EVENT_COUNT_KEY, count) {
            warn!(error = %e, "Failed to checkpoint event count");
        }
    }
}

impl EventQueue for CrashSafeEventBuffer {
    fn add_event(&self, event: Event) {
        self.inner.add_event(event);

        let count = self.event_count.fetch_add(1, Ordering::Relaxed) + 1;
        let period = self.profile.event_checkpoint_period.max(1);
        if count % period == 0 {
            self.checkpoint(count);
        }
    }

    fn poll_batch(
        &self,
        max_bytes: usize,
        estimator: Option<&dyn SizeEstimator>,
        class: PriorityClass,
    ) -> Vec<Event> {
        let mut batch = self.inner.poll_batch(max_bytes, estimator, class);
        if !self.is_recovering() {
            return batch;
        }

        let target = self.profile.poll_cap(class);
        let room = target
            .saturating_sub(batch.len())
            .min(self.profile.recovery_batch_size);
        if room > 0 {
            let recovered = self.top_up(class, room, max_bytes, estimator, &batch);
            if !recovered.is_empty() {
                debug!(
                    class = %class,
                    fresh = batch.len(),
                    recovered = recovered.len(),
                    "Blended durable rows into batch"
                );
                batch.extend(recovered);
            }
        }

        self.finish_recovery_if_drained();
        batch
    }

    /// Events waiting in memory, plus durable rows while recovering.
    fn count(&self) -> usize {
        let memory = self.inner.count();
        if self.is_recovering() {
            memory.saturating_add(usize::try_from(self.stored_rows()).unwrap_or(usize::MAX))
        } else {
            memory
        }
    }

    fn count_for(&self, class: PriorityClass) -> usize {
        self.inner.count_for(class)
    }

    fn capacity(&self, class: PriorityClass) -> usize {
        self.inner.capacity(class)
    }

    fn is_empty(&self) -> bool {
        self.count() == 0
    }

    fn set_observer(&self, observer: Arc<dyn BufferObserver>) {
        self.inner.set_observer(observer);
    }

    fn evicted_count(&self) -> u64 {
        self.inner.evicted_count()
    }

    fn collapsed_count(&self) -> u64 {
        self.inner.collapsed_count()
    }

    fn emergency_backup(&self) -> usize {
        let mut saved = 0;
        for class in PriorityClass::ALL {
            let events = self.inner.drain_class(class);
            if events.is_empty() {
                continue;
            }
            let count = events.len();
            match self.store.backup_events(events, self.clock.now_millis()) {
                Ok(written) => saved += written,
                Err(e) => {
                    error!(class = %class, count, error = %e, "Emergency backup failed, events lost")
                }
            }
        }

        if saved > 0 {
            self.recovering.store(true, Ordering::Release);
            info!(count = saved, "Emergency backup of buffered events");
        }
        saved
    }

    fn recovery_stats(&self) -> Option<RecoveryStats> {
        Some(RecoveryStats {
            is_recovering: self.is_recovering(),
            backup_events: self.stored_rows(),
            memory_events: self.inner.count(),
            is_tv: self.profile.is_tv(),
        })
    }

    fn mark_clean_shutdown(&self) {
        self.checkpoint(self.event_count());
        match self.flags.set_flag(SESSION_ACTIVE_KEY, false) {
            Ok(()) => info!(events = self.event_count(), "Session closed cleanly"),
            Err(e) => warn!(error = %e, "Failed to clear session flag"),
        }
    }
}

impl FailedEventSink for CrashSafeEventBuffer {
    fn backup_failed_events(&self, events: Vec<Event>) -> usize {
        if events.is_empty() {
            return 0;
        }

        let count = events.len();
        match self.store.backup_events(events, self.clock.now_millis()) {
            Ok(written) => {
                if !self.recovering.swap(true, Ordering::AcqRel) {
                    debug!("Entering recovery mode for stored failures");
                }
                written
            }
            Err(e) => {
                error!(count, error = %e, "Failed to persist undeliverable events");
                0
            }
        }
    }

    fn is_durable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_config_and_utils::ManualClock;
    use crate::DefaultSizeEstimator;
    use harvest_store::MemorySessionFlagStore;
    use serde_json::{json, Map};

    fn event(live: bool, n: i64) -> Event {
        let mut attrs = Map::new();
        attrs.insert("contentIsLive".to_string(), json!(live));
        attrs.insert("n".to_string(), json!(n));
        Event::new("CONTENT_HEARTBEAT", attrs, n)
    }

    struct Fixture {
        store: Arc<DurableStore>,
        flags: Arc<MemorySessionFlagStore>,
        clock: ManualClock,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(DurableStore::open_in_memory().unwrap()),
                flags: Arc::new(MemorySessionFlagStore::new()),
                clock: ManualClock::default(),
            }
        }

        fn buffer(&self, profile: Profile) -> CrashSafeEventBuffer {
            CrashSafeEventBuffer::new(
                Arc::new(profile),
                self.store.clone(),
                self.flags.clone(),
                Arc::new(self.clock.clone()),
            )
            .unwrap()
        }
    }

    #[test]
    fn test_clean_start_is_not_recovering() {
        let f = Fixture::new();
        let buffer = f.buffer(Profile::mobile());

        assert!(!buffer.is_recovering());
        assert!(!buffer.crash_detected());
        assert!(f.flags.get_flag(SESSION_ACTIVE_KEY).unwrap());
    }

    #[test]
    fn test_unclean_shutdown_with_backlog_recovers_gradually() {
        let f = Fixture::new();
        f.flags.set_flag(SESSION_ACTIVE_KEY, true).unwrap();
        f.store
            .backup_events((0..5).map(|n| event(false, n)).collect(), 1)
            .unwrap();

        let mut profile = Profile::mobile();
        profile.recovery_batch_size = 2;
        let buffer = f.buffer(profile);
        assert!(buffer.crash_detected());
        assert!(buffer.is_recovering());
        assert_eq!(buffer.count(), 5);

        let mut sizes = Vec::new();
        while buffer.is_recovering() {
            let batch = buffer.poll_batch(usize::MAX, None, PriorityClass::OnDemand);
            sizes.push(batch.len());
            assert!(sizes.len() < 10);
        }

        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(f.store.count().unwrap(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fresh_events_come_before_recovered_rows() {
        let f = Fixture::new();
        f.flags.set_flag(SESSION_ACTIVE_KEY, true).unwrap();
        f.store.backup_events(vec![event(true, 1)], 1).unwrap();

        let buffer = f.buffer(Profile::mobile());
        buffer.add_event(event(true, 2));

        let batch = buffer.poll_batch(usize::MAX, None, PriorityClass::Live);
        assert_eq!(batch, vec![event(true, 2), event(true, 1)]);
        assert!(!buffer.is_recovering());
    }

    #[test]
    fn test_top_up_respects_poll_cap() {
        let f = Fixture::new();
        f.store
            .backup_events((0..10).map(|n| event(true, n)).collect(), 1)
            .unwrap();

        let mut profile = Profile::mobile();
        profile.live_poll_cap = 4;
        let buffer = f.buffer(profile);
        for n in 100..103 {
            buffer.add_event(event(true, n));
        }

        let batch = buffer.poll_batch(usize::MAX, None, PriorityClass::Live);
        assert_eq!(batch.len(), 4);
        assert_eq!(f.store.count().unwrap(), 9);
    }

    fn large_event(live: bool, n: i64) -> Event {
        let mut attrs = Map::new();
        attrs.insert("contentIsLive".to_string(), json!(live));
        attrs.insert("contentTitle".to_string(), json!("x".repeat(200)));
        Event::new("CONTENT_HEARTBEAT", attrs, n)
    }

    #[test]
    fn test_top_up_respects_byte_budget() {
        let f = Fixture::new();
        f.store
            .backup_events((0..30).map(|n| large_event(true, n)).collect(), 1)
            .unwrap();

        let buffer = f.buffer(Profile::mobile());
        buffer.add_event(event(true, 100));

        let estimator = DefaultSizeEstimator;
        let large = estimator.estimate(&large_event(true, 0));
        assert!(large > 400);

        let batch = buffer.poll_batch(1000, Some(&estimator), PriorityClass::Live);
        let total: usize = batch.iter().map(|e| estimator.estimate(e)).sum();
        assert!(total <= 1000);
        assert_eq!(batch[0].timestamp(), Some(100));
        assert_eq!(batch.len() as u64 + f.store.count().unwrap(), 31);
        assert!(buffer.is_recovering());
    }

    #[test]
    fn test_top_up_takes_lone_oversized_row() {
        let f = Fixture::new();
        f.store
            .backup_events((0..3).map(|n| large_event(false, n)).collect(), 1)
            .unwrap();

        let buffer = f.buffer(Profile::mobile());
        let batch = buffer.poll_batch(10, Some(&DefaultSizeEstimator), PriorityClass::OnDemand);

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].timestamp(), Some(0));
        assert_eq!(f.store.count().unwrap(), 2);
    }

    #[test]
    fn test_backlog_after_clean_shutdown_is_not_a_crash() {
        let f = Fixture::new();
        f.store.backup_events(vec![event(false, 1)], 1).unwrap();

        let buffer = f.buffer(Profile::mobile());
        assert!(buffer.is_recovering());
        assert!(!buffer.crash_detected());
    }

    #[test]
    fn test_event_count_checkpoints() {
        let f = Fixture::new();
        let mut profile = Profile::mobile();
        profile.event_checkpoint_period = 3;
        let buffer = f.buffer(profile);

        for n in 0..7 {
            buffer.add_event(event(false, n));
        }
        assert_eq!(f.flags.get_counter(LAST_EVENT_COUNT_KEY).unwrap(), 6);

        buffer.mark_clean_shutdown();
        assert_eq!(f.flags.get_counter(LAST_EVENT_COUNT_KEY).unwrap(), 7);
        assert!(!f.flags.get_flag(SESSION_ACTIVE_KEY).unwrap());
    }

    #[test]
    fn test_emergency_backup_moves_memory_to_store() {
        let f = Fixture::new();
        let buffer = f.buffer(Profile::mobile());
        buffer.add_event(event(true, 1));
        buffer.add_event(event(false, 2));
        buffer.add_event(event(false, 3));

        assert_eq!(buffer.emergency_backup(), 3);
        assert_eq!(buffer.count_for(PriorityClass::Live), 0);
        let counts = f.store.counts().unwrap();
        assert_eq!((counts.live, counts.on_demand), (1, 2));
        assert!(buffer.is_recovering());
    }

    #[test]
    fn test_failed_events_enter_recovery() {
        let f = Fixture::new();
        let buffer = f.buffer(Profile::mobile());
        assert!(!buffer.is_recovering());

        assert_eq!(buffer.backup_failed_events(vec![event(false, 1)]), 1);
        assert!(buffer.is_recovering());

        let stats = buffer.recovery_stats().unwrap();
        assert_eq!(stats.backup_events, 1);
        assert_eq!(stats.memory_events, 0);
        assert!(!stats.is_tv);
    }

    #[test]
    fn test_next_run_after_clean_shutdown() {
        let f = Fixture::new();
        {
            let buffer = f.buffer(Profile::mobile());
            buffer.add_event(event(false, 1));
            buffer.mark_clean_shutdown();
        }

        let buffer = f.buffer(Profile::mobile());
        assert!(!buffer.crash_detected());
        assert_eq!(buffer.previous_event_count(), 1);
    }
}
