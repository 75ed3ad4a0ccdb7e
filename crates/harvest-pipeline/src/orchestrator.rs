//! Harvest orchestrator.
//!
//! Owns the pipeline: producers record events into the buffer, the buffer's
//! threshold notifications start the scheduler or request an out-of-band
//! harvest, scheduled harvests deliver through an [`EventSender`], and failed
//! batches flow into the dead-letter queue and from there to durable storage.
//!
//! Nothing here returns an error to a producer or to a lifecycle hook.
//! Failures are logged and the data stays in whichever layer last held it.

use crate::{
    BufferObserver, CrashSafeEventBuffer, DeadLetterRetrySubsystem, DeadLetterStats,
    DefaultSizeEstimator, DiscardingSink, EventBuffer, EventQueue, FailedEventSink,
    HarvestScheduler, HarvestTask, PipelineResult, RecoveryStats, SchedulerState,
    SizeEstimator, WeakHarvestScheduler,
};
use async_trait::async_trait;
use harvest_config_and_utils::{Event, HarvestConfig, Paths, PriorityClass, Profile, SharedClock};
use harvest_delivery::{
    CircuitState, ConnectTokenManager, DeliveryConfig, DeliveryError, DeviceDescriptor,
    EventSender, FileTokenCache, HttpDeliveryClient, RegionTable,
};
use harvest_store::{DurableStore, FileSessionFlagStore, SessionFlagStore};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Durable rows older than this are purged at startup.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const ON_DEMAND_TAG: &str = "ondemand";
const LIVE_TAG: &str = "live";

/// Result of one harvest cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestOutcome {
    /// Nothing to send.
    Idle,
    /// The collector asked us to wait; nothing was polled.
    BackedOff,
    Delivered(usize),
    /// The batch went to the dead-letter queue.
    Failed(usize),
}

#[derive(Debug, Default)]
struct HarvestCounters {
    harvests: AtomicU64,
    delivered_events: AtomicU64,
    failed_events: AtomicU64,
    retried_events: AtomicU64,
    backed_off: AtomicU64,
}

/// State shared by the scheduled harvest tasks.
pub struct HarvestCore {
    profile: Arc<Profile>,
    buffer: Arc<dyn EventQueue>,
    sender: Arc<dyn EventSender>,
    dead_letters: DeadLetterRetrySubsystem,
    estimator: Arc<dyn SizeEstimator>,
    store: Option<Arc<DurableStore>>,
    counters: HarvestCounters,
}

impl HarvestCore {
    /// Poll one batch of `class` and deliver it.
    ///
    /// A failed batch is handed to the dead-letter queue under `endpoint_tag`.
    /// With `also_retry`, a dead-letter retry pass follows.
    pub async fn harvest(
        &self,
        max_bytes: usize,
        class: PriorityClass,
        endpoint_tag: &str,
        also_retry: bool,
    ) -> HarvestOutcome {
        if let Some(wait) = self.sender.backoff_remaining() {
            self.counters.backed_off.fetch_add(1, Ordering::Relaxed);
            debug!(
                class = %class,
                wait_secs = wait.as_secs(),
                "Collector backoff active, skipping harvest"
            );
            return HarvestOutcome::BackedOff;
        }

        let batch = self
            .buffer
            .poll_batch(max_bytes, Some(self.estimator.as_ref()), class);

        let outcome = if batch.is_empty() {
            HarvestOutcome::Idle
        } else {
            self.counters.harvests.fetch_add(1, Ordering::Relaxed);
            let count = batch.len();
            if self.sender.send(&batch, endpoint_tag).await {
                self.counters
                    .delivered_events
                    .fetch_add(count as u64, Ordering::Relaxed);
                debug!(class = %class, count, "Harvest delivered");
                HarvestOutcome::Delivered(count)
            } else {
                self.counters
                    .failed_events
                    .fetch_add(count as u64, Ordering::Relaxed);
                self.dead_letters.handle_failed_events(batch, endpoint_tag);
                HarvestOutcome::Failed(count)
            }
        };

        if also_retry {
            self.retry_dead_letters().await;
        }

        outcome
    }

    /// The scheduled harvest for one class.
    ///
    /// On-demand harvests also retry dead letters; live harvests stay
    /// latency-bound.
    pub async fn harvest_class(&self, class: PriorityClass) -> HarvestOutcome {
        match class {
            PriorityClass::OnDemand => {
                self.harvest(self.profile.on_demand_batch_bytes, class, ON_DEMAND_TAG, true)
                    .await
            }
            PriorityClass::Live => {
                self.harvest(self.profile.live_batch_bytes, class, LIVE_TAG, false)
                    .await
            }
        }
    }

    async fn retry_dead_letters(&self) {
        let outcome = self.dead_letters.retry_failed_events().await;
        if outcome.delivered > 0 {
            self.counters
                .retried_events
                .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        }
    }

    pub fn buffer(&self) -> &Arc<dyn EventQueue> {
        &self.buffer
    }

    pub fn dead_letters(&self) -> &DeadLetterRetrySubsystem {
        &self.dead_letters
    }
}

/// Scheduled harvest of one class.
pub struct ClassHarvestTask {
    core: Arc<HarvestCore>,
    class: PriorityClass,
}

impl ClassHarvestTask {
    pub fn new(core: Arc<HarvestCore>, class: PriorityClass) -> Self {
        Self { core, class }
    }
}

#[async_trait]
impl HarvestTask for ClassHarvestTask {
    async fn run(&self) {
        self.core.harvest_class(self.class).await;
    }
}

/// Routes buffer notifications to the scheduler without owning it.
struct SchedulerObserver {
    scheduler: WeakHarvestScheduler,
}

impl BufferObserver for SchedulerObserver {
    fn on_first_event(&self, class: PriorityClass) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.start(class);
        }
    }

    fn on_near_full(&self, class: PriorityClass) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            // The notification is synchronous; the harvest it requests runs on
            // the class worker so the producer never waits on the network.
            scheduler.harvest_now(class);
        }
    }
}

/// Point-in-time pipeline statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub live_queued: usize,
    pub on_demand_queued: usize,
    pub live_capacity: usize,
    pub on_demand_capacity: usize,
    pub dead_letters: DeadLetterStats,
    pub durable_rows: Option<u64>,
    pub recovery: Option<RecoveryStats>,
    pub circuit: Option<CircuitState>,
    pub scheduler: SchedulerState,
    pub harvests: u64,
    pub delivered_events: u64,
    pub failed_events: u64,
    pub retried_events: u64,
    pub backed_off_harvests: u64,
    pub evicted_events: u64,
    pub collapsed_events: u64,
}

/// The harvesting pipeline.
pub struct HarvestOrchestrator {
    core: Arc<HarvestCore>,
    scheduler: HarvestScheduler,
    clock: SharedClock,
    terminated: AtomicBool,
}

impl HarvestOrchestrator {
    /// Assemble a pipeline from its parts. Must be called inside a tokio runtime.
    pub fn new(
        profile: Arc<Profile>,
        buffer: Arc<dyn EventQueue>,
        sink: Arc<dyn FailedEventSink>,
        sender: Arc<dyn EventSender>,
        clock: SharedClock,
        store: Option<Arc<DurableStore>>,
    ) -> PipelineResult<Self> {
        let estimator: Arc<dyn SizeEstimator> = Arc::new(DefaultSizeEstimator::new());
        let dead_letters = DeadLetterRetrySubsystem::new(
            profile.clone(),
            sender.clone(),
            sink,
            estimator.clone(),
            clock.clone(),
        );

        let core = Arc::new(HarvestCore {
            profile: profile.clone(),
            buffer,
            sender,
            dead_letters,
            estimator,
            store,
            counters: HarvestCounters::default(),
        });

        let scheduler = HarvestScheduler::new(
            profile,
            Arc::new(ClassHarvestTask::new(core.clone(), PriorityClass::Live)),
            Arc::new(ClassHarvestTask::new(core.clone(), PriorityClass::OnDemand)),
        )?;
        core.buffer.set_observer(Arc::new(SchedulerObserver {
            scheduler: scheduler.downgrade(),
        }));

        let orchestrator = Self {
            core,
            scheduler,
            clock,
            terminated: AtomicBool::new(false),
        };
        orchestrator.start_recovery_timers();
        Ok(orchestrator)
    }

    /// Pipeline with a durable backlog and crash detection.
    ///
    /// Rows older than [`DEFAULT_RETENTION`] are purged first.
    pub fn crash_safe(
        profile: Arc<Profile>,
        store: Arc<DurableStore>,
        flags: Arc<dyn SessionFlagStore>,
        sender: Arc<dyn EventSender>,
        clock: SharedClock,
    ) -> PipelineResult<Self> {
        store.purge_older_than(DEFAULT_RETENTION, clock.now_millis())?;

        let buffer = Arc::new(CrashSafeEventBuffer::new(
            profile.clone(),
            store.clone(),
            flags,
            clock.clone(),
        )?);
        Self::new(
            profile,
            buffer.clone(),
            buffer,
            sender,
            clock,
            Some(store),
        )
    }

    /// Memory-only pipeline. Retry-exhausted events are dropped.
    pub fn in_memory(
        profile: Arc<Profile>,
        sender: Arc<dyn EventSender>,
        clock: SharedClock,
    ) -> PipelineResult<Self> {
        let buffer = Arc::new(EventBuffer::new(profile.clone()));
        Self::new(
            profile,
            buffer,
            Arc::new(DiscardingSink),
            sender,
            clock,
            None,
        )
    }

    /// Build the production pipeline: HTTP delivery with connect tokens, plus
    /// the durable store when crash safety is enabled.
    pub fn from_config(
        config: &HarvestConfig,
        paths: &Paths,
        clock: SharedClock,
    ) -> PipelineResult<Self> {
        let profile = Arc::new(config.profile());
        let regions = RegionTable::default();
        let descriptor = DeviceDescriptor::new(config.app.clone(), config.device.clone());

        let delivery_config = DeliveryConfig::from_profile(
            &profile,
            &config.region,
            config.collector_endpoint_url()?.map(|url| url.to_string()),
        );

        let connect_url = match config.connect_endpoint_url()? {
            Some(url) => url.to_string(),
            None => regions.connect_url(&config.region).ok_or_else(|| {
                DeliveryError::Config(format!("no connect endpoint for region {}", config.region))
            })?,
        };
        let tokens = Arc::new(ConnectTokenManager::with_cache(
            connect_url,
            config.application_token.clone(),
            descriptor.clone(),
            delivery_config.user_agent.clone(),
            clock.clone(),
            Arc::new(FileTokenCache::new(&paths.token_file())),
        )?);
        let sender = Arc::new(HttpDeliveryClient::new(
            delivery_config,
            &regions,
            tokens,
            descriptor,
            clock.clone(),
        )?);

        if !config.crash_safety {
            info!(region = %config.region, "Starting memory-only pipeline");
            return Self::in_memory(profile, sender, clock);
        }

        paths.ensure_dirs()?;
        let store = Arc::new(DurableStore::open(&paths.store_file())?);
        let flags = Arc::new(FileSessionFlagStore::open(&paths.session_flag_file())?);
        info!(region = %config.region, "Starting crash-safe pipeline");
        Self::crash_safe(profile, store, flags, sender, clock)
    }

    /// Stored rows never produce a first-event notification, so classes with
    /// a backlog are started up front.
    fn start_recovery_timers(&self) {
        let Some(store) = &self.core.store else {
            return;
        };
        match store.counts() {
            Ok(counts) => {
                if counts.live > 0 {
                    self.scheduler.start(PriorityClass::Live);
                }
                if counts.on_demand > 0 {
                    self.scheduler.start(PriorityClass::OnDemand);
                }
            }
            Err(e) => warn!(error = %e, "Failed to count durable backlog"),
        }
    }

    /// Stamp and queue an event. Never blocks on the network.
    pub fn record_event(&self, event_type: &str, attributes: Map<String, Value>) {
        let event = Event::new(event_type, attributes, self.clock.now_millis());
        self.record(event);
    }

    /// Queue an already stamped event.
    pub fn record(&self, event: Event) {
        if self.terminated.load(Ordering::Acquire) {
            debug!("Pipeline terminated, ignoring event");
            return;
        }
        self.core.buffer.add_event(event);
    }

    /// Start the timer for a class.
    pub fn on_first_event(&self, class: PriorityClass) {
        self.scheduler.start(class);
    }

    /// Drain a class out of band.
    ///
    /// Returns once the class worker has been asked to harvest; the
    /// delivery itself happens off the caller's thread.
    pub fn on_near_full(&self, class: PriorityClass) {
        self.scheduler.harvest_now(class);
    }

    /// Harvest both classes, retry dead letters, and back up what remains.
    pub async fn force_harvest_all(&self) {
        self.scheduler.force_harvest().await;
        self.core.retry_dead_letters().await;

        let buffered = self.core.buffer.emergency_backup();
        let dead = self.core.dead_letters.emergency_backup();
        if buffered + dead > 0 {
            info!(buffered, dead_letters = dead, "Backed up undelivered events");
        }
    }

    pub fn on_foreground(&self) {
        self.scheduler.resume(false);
    }

    /// Flush, then pause. TV profiles keep harvesting at doubled intervals.
    pub async fn on_background(&self) {
        self.force_harvest_all().await;
        self.scheduler.pause();
        if self.core.profile.is_tv() {
            self.scheduler.resume(true);
        }
    }

    /// Final flush and clean shutdown. Idempotent.
    pub async fn on_terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Terminating harvest pipeline");
        self.force_harvest_all().await;
        self.scheduler.shutdown().await;
        self.core.buffer.emergency_backup();
        self.core.dead_letters.emergency_backup();
        self.core.buffer.mark_clean_shutdown();
    }

    /// Deliver until nothing more goes through. Returns events delivered.
    pub async fn drain_backlog(&self) -> usize {
        let mut delivered = 0;
        loop {
            let mut progressed = false;
            for class in PriorityClass::ALL {
                if let HarvestOutcome::Delivered(count) = self.core.harvest_class(class).await {
                    delivered += count;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        delivered
    }

    pub fn scheduler(&self) -> &HarvestScheduler {
        &self.scheduler
    }

    pub fn core(&self) -> &Arc<HarvestCore> {
        &self.core
    }

    pub fn stats(&self) -> PipelineStats {
        let core = &self.core;
        let buffer = &core.buffer;
        let counters = &core.counters;

        let durable_rows = core.store.as_ref().and_then(|store| match store.count() {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Failed to count durable rows");
                None
            }
        });

        PipelineStats {
            live_queued: buffer.count_for(PriorityClass::Live),
            on_demand_queued: buffer.count_for(PriorityClass::OnDemand),
            live_capacity: buffer.capacity(PriorityClass::Live),
            on_demand_capacity: buffer.capacity(PriorityClass::OnDemand),
            dead_letters: core.dead_letters.stats(),
            durable_rows,
            recovery: buffer.recovery_stats(),
            circuit: core.sender.circuit_state(),
            scheduler: self.scheduler.state(),
            harvests: counters.harvests.load(Ordering::Relaxed),
            delivered_events: counters.delivered_events.load(Ordering::Relaxed),
            failed_events: counters.failed_events.load(Ordering::Relaxed),
            retried_events: counters.retried_events.load(Ordering::Relaxed),
            backed_off_harvests: counters.backed_off.load(Ordering::Relaxed),
            evicted_events: buffer.evicted_count(),
            collapsed_events: buffer.collapsed_count(),
        }
    }
}
