//! Event harvesting pipeline.
//!
//! This crate provides:
//! - EventBuffer / CrashSafeEventBuffer: two-class bounded event queues, optionally backed by durable storage
//! - SizeEstimator: byte budgeting for polled batches
//! - HarvestScheduler: lazily started per-class repeating harvest timers
//! - DeadLetterRetrySubsystem: tiered-backoff retry of failed batches
//! - HarvestOrchestrator: the assembled pipeline and its lifecycle hooks

mod buffer;
mod crash_safe;
mod dead_letter;
mod error;
mod orchestrator;
mod scheduler;
mod size;

pub use buffer::{BufferObserver, EventBuffer, EventQueue};
pub use crash_safe::{CrashSafeEventBuffer, RecoveryStats};
pub use dead_letter::{
    compute_retry_interval, is_retry_due, DeadLetterEntry, DeadLetterRetrySubsystem,
    DeadLetterStats, DiscardingSink, FailedEventSink, RetryMetadata, RetryOutcome,
};
pub use error::{PipelineError, PipelineResult};
pub use orchestrator::{
    ClassHarvestTask, HarvestCore, HarvestOrchestrator, HarvestOutcome, PipelineStats,
    DEFAULT_RETENTION,
};
pub use scheduler::{HarvestScheduler, HarvestTask, SchedulerState, WeakHarvestScheduler};
pub use size::{estimate_or_fallback, DefaultSizeEstimator, SizeEstimator, FALLBACK_EVENT_SIZE};
