//! Durable store row types.

use harvest_config_and_utils::{Event, PriorityClass};

/// A row in the `backup_events` table.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupRecord {
    /// Auto-increment row id.
    pub id: i64,
    /// Event payload as a JSON object.
    pub payload: String,
    /// Priority class the row is recovered under.
    pub priority_class: PriorityClass,
    /// Milliseconds since the Unix epoch when the row was written.
    pub stored_at: i64,
}

/// A row to be inserted.
#[derive(Debug, Clone)]
pub struct NewBackupRecord {
    pub payload: Event,
    pub priority_class: PriorityClass,
    pub stored_at: i64,
}

impl NewBackupRecord {
    /// Row for an event under its own derived class.
    pub fn for_event(event: Event, stored_at: i64) -> Self {
        Self {
            priority_class: event.priority_class(),
            payload: event,
            stored_at,
        }
    }
}

/// Row counts per class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoredCounts {
    pub live: u64,
    pub on_demand: u64,
}

impl StoredCounts {
    pub fn total(&self) -> u64 {
        self.live + self.on_demand
    }
}
