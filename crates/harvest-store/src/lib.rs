//! On-device persistence for the harvest pipeline.
//!
//! This crate provides:
//! - DurableStore: SQLite row store for crash, overflow and retry-exhaustion backup
//! - SessionFlagStore: the small key/value store used for unclean-shutdown detection

mod db;
mod error;
mod migrations;
mod models;
mod session_flag;

pub use db::DurableStore;
pub use error::{StoreError, StoreResult};
pub use migrations::CURRENT_VERSION as SCHEMA_VERSION;
pub use models::{BackupRecord, NewBackupRecord, StoredCounts};
pub use session_flag::{
    FileSessionFlagStore, MemorySessionFlagStore, SessionFlagStore, LAST_EVENT_COUNT_KEY,
    SESSION_ACTIVE_KEY,
};
