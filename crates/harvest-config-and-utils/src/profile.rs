//! Device profile.
//!
//! All capacity, cadence and retry tuning lives here. A profile is built once
//! at startup and shared by every pipeline component.

use crate::PriorityClass;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Class of device the pipeline runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Set-top boxes and smart TVs: more memory, always-on power.
    Tv,
    /// Phones and tablets.
    #[default]
    Mobile,
}

/// Pipeline tuning for one device profile.
#[derive(Debug, Clone)]
pub struct Profile {
    /// Device class this profile was derived from.
    pub device_class: DeviceClass,
    /// Tighter network timeouts and smaller batches.
    pub memory_optimized: bool,

    /// Interval between on-demand harvests.
    pub on_demand_interval: Duration,
    /// Interval between live harvests.
    pub live_interval: Duration,
    /// Byte budget of one on-demand harvest.
    pub on_demand_batch_bytes: usize,
    /// Byte budget of one live harvest.
    pub live_batch_bytes: usize,

    /// Queue ceiling for live events.
    pub live_capacity: usize,
    /// Queue ceiling for on-demand events.
    pub on_demand_capacity: usize,
    /// Maximum events returned by one live poll.
    pub live_poll_cap: usize,
    /// Maximum events returned by one on-demand poll.
    pub on_demand_poll_cap: usize,
    /// Occupancy ratio that triggers an out-of-band harvest.
    pub near_full_ratio: f64,
    /// How long a poll waits for its class lock before giving up.
    pub poll_lock_timeout: Duration,
    /// Keep only the newest of consecutive events sharing an `actionName` when polling.
    pub collapse_repeated_actions: bool,

    /// Capacity of the in-memory dead-letter queue.
    pub dead_letter_capacity: usize,
    /// Failed deliveries allowed before an event is persisted instead.
    pub max_retries: u32,
    /// Byte budget of one dead-letter retry pass.
    pub retry_batch_bytes: usize,
    /// Event cap of one dead-letter retry pass.
    pub retry_batch_events: usize,
    /// Wait before the first retry.
    pub retry_first_interval: Duration,
    /// Wait before the second retry.
    pub retry_second_interval: Duration,
    /// Upper bound for later retries.
    pub retry_max_interval: Duration,

    /// Durable rows blended into one poll while recovering.
    pub recovery_batch_size: usize,
    /// Persist the event counter every this many events.
    pub event_checkpoint_period: u64,

    /// HTTP connect timeout.
    pub connect_timeout: Duration,
    /// HTTP read timeout.
    pub read_timeout: Duration,
}

impl Profile {
    /// Profile for TV-class devices.
    pub fn tv() -> Self {
        Self {
            device_class: DeviceClass::Tv,
            memory_optimized: false,
            on_demand_interval: Duration::from_secs(90),
            live_interval: Duration::from_secs(45),
            on_demand_batch_bytes: 16_384,
            live_batch_bytes: 16_384,
            live_capacity: 1_000,
            on_demand_capacity: 3_000,
            live_poll_cap: 100,
            on_demand_poll_cap: 200,
            near_full_ratio: 0.9,
            poll_lock_timeout: Duration::from_millis(25),
            collapse_repeated_actions: false,
            dead_letter_capacity: 1_000,
            max_retries: 5,
            retry_batch_bytes: 16_384,
            retry_batch_events: 100,
            retry_first_interval: Duration::from_secs(30),
            retry_second_interval: Duration::from_secs(60),
            retry_max_interval: Duration::from_secs(120),
            recovery_batch_size: 50,
            event_checkpoint_period: 200,
            connect_timeout: Duration::from_secs(8),
            read_timeout: Duration::from_secs(12),
        }
    }

    /// Profile for memory-constrained mobile devices.
    pub fn mobile() -> Self {
        Self {
            device_class: DeviceClass::Mobile,
            memory_optimized: true,
            on_demand_interval: Duration::from_secs(120),
            live_interval: Duration::from_secs(60),
            on_demand_batch_bytes: 4_096,
            live_batch_bytes: 4_096,
            live_capacity: 500,
            on_demand_capacity: 1_500,
            live_poll_cap: 50,
            on_demand_poll_cap: 100,
            near_full_ratio: 0.9,
            poll_lock_timeout: Duration::from_millis(25),
            collapse_repeated_actions: false,
            dead_letter_capacity: 200,
            max_retries: 3,
            retry_batch_bytes: 4_096,
            retry_batch_events: 50,
            retry_first_interval: Duration::from_secs(30),
            retry_second_interval: Duration::from_secs(60),
            retry_max_interval: Duration::from_secs(120),
            recovery_batch_size: 20,
            event_checkpoint_period: 100,
            connect_timeout: Duration::from_secs(6),
            read_timeout: Duration::from_secs(10),
        }
    }

    /// Preset for a device class.
    pub fn for_device(device_class: DeviceClass) -> Self {
        match device_class {
            DeviceClass::Tv => Self::tv(),
            DeviceClass::Mobile => Self::mobile(),
        }
    }

    pub fn is_tv(&self) -> bool {
        self.device_class == DeviceClass::Tv
    }

    /// Queue ceiling for a class.
    pub fn capacity(&self, class: PriorityClass) -> usize {
        match class {
            PriorityClass::Live => self.live_capacity,
            PriorityClass::OnDemand => self.on_demand_capacity,
        }
    }

    /// Per-poll event cap for a class.
    pub fn poll_cap(&self, class: PriorityClass) -> usize {
        match class {
            PriorityClass::Live => self.live_poll_cap,
            PriorityClass::OnDemand => self.on_demand_poll_cap,
        }
    }

    /// Harvest byte budget for a class.
    pub fn batch_bytes(&self, class: PriorityClass) -> usize {
        match class {
            PriorityClass::Live => self.live_batch_bytes,
            PriorityClass::OnDemand => self.on_demand_batch_bytes,
        }
    }

    /// Harvest interval for a class.
    pub fn interval(&self, class: PriorityClass) -> Duration {
        match class {
            PriorityClass::Live => self.live_interval,
            PriorityClass::OnDemand => self.on_demand_interval,
        }
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::mobile()
    }
}
