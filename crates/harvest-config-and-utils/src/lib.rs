//! Core types, configuration, and utilities for the video harvester.
//!
//! This crate provides:
//! - Event / PriorityClass: the event record and its derived delivery class
//! - Profile: per-device capacity, cadence and retry tuning
//! - Clock: injectable wall clock for retry and cooldown policy
//! - HarvestConfig / Paths: layered JSON + environment configuration
//! - init_logging: structured JSONL logging via tracing

mod clock;
mod config;
mod error;
mod event;
mod logging;
mod paths;
mod profile;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    AppIdentity, DeviceIdentity, HarvestConfig, ProfileOverrides, AGENT_NAME, AGENT_VERSION,
    DEFAULT_LOG_LEVEL, DEFAULT_REGION,
};
pub use error::{CoreError, CoreResult};
pub use event::{
    Event, PriorityClass, ACTION_NAME_KEY, CONTENT_IS_LIVE_KEY, EVENT_TYPE_KEY, TIMESTAMP_KEY,
};
pub use logging::{init_logging, JsonlFileWriter};
pub use paths::Paths;
pub use profile::{DeviceClass, Profile};
