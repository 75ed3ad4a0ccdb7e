//! Durable backup store.
//!
//! A single SQLite table of event payloads, written when events cannot stay
//! in memory (shutdown, crash hooks, retry exhaustion) and drained back into
//! delivery on a later run. Polling removes the rows it returns inside the
//! same transaction, so a row is handed out at most once per store; a crash
//! after the poll but before delivery is covered by at-least-once semantics
//! one layer up.

use crate::{migrations, BackupRecord, NewBackupRecord, StoreError, StoreResult, StoredCounts};
use harvest_config_and_utils::{Event, PriorityClass};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Embedded row store for crash and overflow backup.
pub struct DurableStore {
    conn: Mutex<Connection>,
}

impl DurableStore {
    /// Open a store at the given path, running migrations if needed.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;
        migrations::run_migrations(&conn)?;

        info!(path = %path.display(), "Durable store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store for testing.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA temp_store = MEMORY;")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert rows in one transaction. Returns the number written.
    pub fn backup(&self, records: &[NewBackupRecord]) -> StoreResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO backup_events (payload, priority_class, stored_at) VALUES (?1, ?2, ?3)",
            )?;
            for record in records {
                let payload = record.payload.to_json()?;
                stmt.execute(params![
                    payload,
                    record.priority_class.as_str(),
                    record.stored_at
                ])?;
            }
        }
        tx.commit()?;

        debug!(count = records.len(), "Backed up events");
        Ok(records.len())
    }

    /// Back up events under their own derived classes.
    pub fn backup_events(&self, events: Vec<Event>, stored_at: i64) -> StoreResult<usize> {
        let records: Vec<NewBackupRecord> = events
            .into_iter()
            .map(|event| NewBackupRecord::for_event(event, stored_at))
            .collect();
        self.backup(&records)
    }

    /// Remove and return up to `max_count` of the oldest rows for a class.
    ///
    /// Rows whose payload no longer parses are deleted and skipped.
    pub fn poll_records(&self, class: PriorityClass, max_count: usize) -> StoreResult<Vec<Event>> {
        self.poll_records_while(class, max_count, |_| true)
    }

    /// Like [`poll_records`](Self::poll_records), but stops at the first row
    /// `admit` rejects. That row and everything after it stay stored.
    ///
    /// Selection and deletion share one transaction.
    pub fn poll_records_while<F>(
        &self,
        class: PriorityClass,
        max_count: usize,
        mut admit: F,
    ) -> StoreResult<Vec<Event>>
    where
        F: FnMut(&Event) -> bool,
    {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT id, payload FROM backup_events
                 WHERE priority_class = ?1
                 ORDER BY stored_at ASC, id ASC
                 LIMIT ?2",
            )?;
            let mapped = stmt.query_map(params![class.as_str(), max_count as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            let rows = mapped.collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut taken = Vec::new();
        let mut events = Vec::new();
        for (id, payload) in rows {
            match Event::from_json(&payload) {
                Ok(event) => {
                    if !admit(&event) {
                        break;
                    }
                    taken.push(id);
                    events.push(event);
                }
                Err(e) => {
                    warn!(row_id = id, error = %e, "Dropping unreadable backup row");
                    taken.push(id);
                }
            }
        }

        if taken.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = std::iter::repeat("?")
            .take(taken.len())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("DELETE FROM backup_events WHERE id IN ({})", placeholders);
        tx.execute(&sql, params_from_iter(taken.iter().copied()))?;
        tx.commit()?;

        debug!(class = %class, count = events.len(), "Polled backup rows");
        Ok(events)
    }

    /// Read rows without removing them, oldest first.
    pub fn peek_records(&self, class: PriorityClass, limit: usize) -> StoreResult<Vec<BackupRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, payload, priority_class, stored_at FROM backup_events
             WHERE priority_class = ?1
             ORDER BY stored_at ASC, id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![class.as_str(), limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, payload, tag, stored_at) = row?;
            let priority_class = PriorityClass::parse(&tag)
                .ok_or_else(|| StoreError::InvalidData(format!("unknown priority class {}", tag)))?;
            records.push(BackupRecord {
                id,
                payload,
                priority_class,
                stored_at,
            });
        }
        Ok(records)
    }

    /// Total number of rows.
    pub fn count(&self) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM backup_events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Row counts per class.
    pub fn counts(&self) -> StoreResult<StoredCounts> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT priority_class, COUNT(*) FROM backup_events GROUP BY priority_class",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = StoredCounts::default();
        for row in rows {
            let (tag, count) = row?;
            match PriorityClass::parse(&tag) {
                Some(PriorityClass::Live) => counts.live += count as u64,
                Some(PriorityClass::OnDemand) => counts.on_demand += count as u64,
                None => warn!(priority_class = %tag, count, "Rows with unknown class"),
            }
        }
        Ok(counts)
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.count()? == 0)
    }

    /// Delete rows stored more than `age` before `now_ms`. Returns rows removed.
    pub fn purge_older_than(&self, age: Duration, now_ms: i64) -> StoreResult<usize> {
        let cutoff = now_ms.saturating_sub(i64::try_from(age.as_millis()).unwrap_or(i64::MAX));
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM backup_events WHERE stored_at < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            warn!(removed, cutoff_ms = cutoff, "Purged expired backup rows");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn event(name: &str, live: bool, ts: i64) -> Event {
        let mut attrs = Map::new();
        attrs.insert("contentIsLive".to_string(), Value::Bool(live));
        attrs.insert("name".to_string(), json!(name));
        Event::new("TEST", attrs, ts)
    }

    #[test]
    fn test_backup_and_poll_oldest_first() {
        let store = DurableStore::open_in_memory().unwrap();
        store
            .backup(&[
                NewBackupRecord::for_event(event("b", false, 2), 200),
                NewBackupRecord::for_event(event("a", false, 1), 100),
                NewBackupRecord::for_event(event("c", false, 3), 300),
            ])
            .unwrap();

        let polled = store.poll_records(PriorityClass::OnDemand, 2).unwrap();
        let names: Vec<_> = polled.iter().map(|e| e.get("name").unwrap().clone()).collect();
        assert_eq!(names, vec![json!("a"), json!("b")]);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_poll_removes_returned_rows() {
        let store = DurableStore::open_in_memory().unwrap();
        store
            .backup_events(vec![event("x", true, 1), event("y", true, 2)], 10)
            .unwrap();

        let first = store.poll_records(PriorityClass::Live, 10).unwrap();
        assert_eq!(first.len(), 2);
        assert!(store.poll_records(PriorityClass::Live, 10).unwrap().is_empty());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_poll_filters_by_class() {
        let store = DurableStore::open_in_memory().unwrap();
        store
            .backup_events(vec![event("live", true, 1), event("vod", false, 2)], 10)
            .unwrap();

        let live = store.poll_records(PriorityClass::Live, 10).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].priority_class(), PriorityClass::Live);

        let counts = store.counts().unwrap();
        assert_eq!(counts, StoredCounts { live: 0, on_demand: 1 });
    }

    #[test]
    fn test_poll_while_leaves_rejected_rows() {
        let store = DurableStore::open_in_memory().unwrap();
        let events = (0..5).map(|n| event("row", false, n)).collect();
        store.backup_events(events, 10).unwrap();

        let mut admitted = 0;
        let polled = store
            .poll_records_while(PriorityClass::OnDemand, 10, |_| {
                admitted += 1;
                admitted <= 2
            })
            .unwrap();

        let stamps: Vec<_> = polled.iter().filter_map(Event::timestamp).collect();
        assert_eq!(stamps, vec![0, 1]);
        assert_eq!(store.count().unwrap(), 3);

        let rest = store.poll_records(PriorityClass::OnDemand, 10).unwrap();
        assert_eq!(rest[0].timestamp(), Some(2));
    }

    #[test]
    fn test_poll_zero_or_empty_is_noop() {
        let store = DurableStore::open_in_memory().unwrap();
        assert!(store.poll_records(PriorityClass::OnDemand, 0).unwrap().is_empty());
        assert!(store.poll_records(PriorityClass::OnDemand, 5).unwrap().is_empty());
        assert_eq!(store.backup(&[]).unwrap(), 0);
    }

    #[test]
    fn test_recovered_payload_is_original_event() {
        let store = DurableStore::open_in_memory().unwrap();
        let original = event("exact", false, 1234);
        store.backup_events(vec![original.clone()], 1).unwrap();

        let polled = store.poll_records(PriorityClass::OnDemand, 1).unwrap();
        assert_eq!(polled, vec![original]);
    }

    #[test]
    fn test_unreadable_rows_are_dropped() {
        let store = DurableStore::open_in_memory().unwrap();
        store
            .conn
            .lock()
            .execute(
                "INSERT INTO backup_events (payload, priority_class, stored_at) VALUES ('not json', 'ondemand', 1)",
                [],
            )
            .unwrap();
        store.backup_events(vec![event("ok", false, 2)], 2).unwrap();

        let polled = store.poll_records(PriorityClass::OnDemand, 10).unwrap();
        assert_eq!(polled.len(), 1);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_purge_older_than() {
        let store = DurableStore::open_in_memory().unwrap();
        let day = Duration::from_secs(24 * 60 * 60);
        let now = 30 * day.as_millis() as i64;

        store.backup_events(vec![event("old", false, 1)], now - 8 * day.as_millis() as i64).unwrap();
        store.backup_events(vec![event("new", false, 2)], now - day.as_millis() as i64).unwrap();

        let removed = store.purge_older_than(7 * day, now).unwrap();
        assert_eq!(removed, 1);

        let remaining = store.peek_records(PriorityClass::OnDemand, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].payload.contains("new"));
    }

    #[test]
    fn test_open_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("harvest.sqlite");

        {
            let store = DurableStore::open(&path).unwrap();
            store.backup_events(vec![event("kept", false, 1)], 1).unwrap();
        }

        let reopened = DurableStore::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
    }
}
