//! Durable local queue for samples that could not be delivered.
//!
//! The queue is a single SQLite file holding the `telemetry_buffer` table. Each
//! operation opens its own connection, runs inside one transaction and releases
//! the handle again, so nothing is held across delivery cycles and a crash
//! between operations never leaves a partial write behind.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::sample::Sample;

const CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS telemetry_buffer (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        payload TEXT NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )";

/// Applied to every connection. FULL sync so an enqueue survives power loss.
const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = FULL;
    PRAGMA busy_timeout = 5000;
    ";

/// Errors raised by the durable queue. All of them are fatal to delivery.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to create queue directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open queue database {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("queue storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to serialize sample: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Crash-surviving FIFO of undelivered samples.
#[derive(Debug, Clone)]
pub struct PersistentQueue {
    path: PathBuf,

    /// Oldest entries beyond this count are evicted on enqueue. `None` keeps
    /// everything.
    max_entries: Option<usize>,
}

impl PersistentQueue {
    /// Open (or create) the queue stored at `path`.
    ///
    /// Creating the schema is idempotent; entries already in the file are kept
    /// in their original order.
    ///
    /// # Arguments
    ///
    /// * `path` - SQLite file backing the queue; missing parent directories are created
    ///
    /// # Errors
    ///
    /// Returns `QueueError::CreateDir` if the parent directory cannot be
    /// created, `QueueError::Open` if the database cannot be opened, and
    /// `QueueError::Sqlite` if the schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| QueueError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let queue = Self {
            path,
            max_entries: None,
        };

        let conn = queue.connection()?;
        conn.execute_batch(CREATE_TABLE)?;

        let pending = Self::count(&conn)?;
        info!(
            path = %queue.path.display(),
            pending = pending,
            "Opened telemetry buffer"
        );

        Ok(queue)
    }

    /// Cap the number of stored entries, evicting the oldest on overflow.
    pub fn with_max_entries(mut self, max_entries: Option<usize>) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Location of the backing database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a sample. The entry is committed when this returns.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Serialize` if the sample has no JSON form (a
    /// non-finite value); nothing is written in that case. Returns
    /// `QueueError::Open` or `QueueError::Sqlite` if the write fails.
    pub fn enqueue(&self, sample: &Sample) -> Result<(), QueueError> {
        let payload = sample.to_json()?;

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO telemetry_buffer (payload) VALUES (?1)",
            params![payload],
        )?;
        let id = tx.last_insert_rowid();

        let mut evicted = 0;
        if let Some(max_entries) = self.max_entries {
            let stored = Self::count(&tx)?;
            if stored > max_entries {
                let excess = (stored - max_entries) as i64;
                evicted = tx.execute(
                    "DELETE FROM telemetry_buffer WHERE id IN (
                        SELECT id FROM telemetry_buffer ORDER BY id ASC LIMIT ?1
                    )",
                    params![excess],
                )?;
            }
        }

        tx.commit()?;

        if evicted > 0 {
            warn!(
                evicted = evicted,
                max_entries = ?self.max_entries,
                "Buffer full: dropped oldest samples"
            );
        }
        debug!(id = id, "Buffered sample");

        Ok(())
    }

    /// Remove and return every stored sample, oldest first.
    ///
    /// Exactly the returned entries are deleted, in the same transaction that
    /// read them. An empty queue returns an empty list and deletes nothing.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Open` or `QueueError::Sqlite` if the store cannot
    /// be read or the deletion cannot be committed; the entries stay in place.
    pub fn dequeue_all(&self) -> Result<Vec<Sample>, QueueError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare("SELECT id, payload FROM telemetry_buffer ORDER BY id ASC")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        {
            let mut delete = tx.prepare("DELETE FROM telemetry_buffer WHERE id = ?1")?;
            for (id, _) in &rows {
                delete.execute(params![id])?;
            }
        }

        tx.commit()?;

        let mut samples = Vec::with_capacity(rows.len());
        for (id, payload) in rows {
            match Sample::from_json(&payload) {
                Ok(sample) => samples.push(sample),
                // undeliverable forever; keeping it would only wedge the flush
                Err(e) => warn!(id = id, error = %e, "Dropping unreadable buffered payload"),
            }
        }

        debug!(count = samples.len(), "Drained telemetry buffer");
        Ok(samples)
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> Result<usize, QueueError> {
        let conn = self.connection()?;
        Self::count(&conn)
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    fn connection(&self) -> Result<Connection, QueueError> {
        let conn = Connection::open(&self.path).map_err(|source| QueueError::Open {
            path: self.path.clone(),
            source,
        })?;
        conn.execute_batch(PRAGMAS)?;
        Ok(conn)
    }

    fn count(conn: &Connection) -> Result<usize, QueueError> {
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM telemetry_buffer", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn sample(value: f64) -> Sample {
        Sample::new(
            "dev-1",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            "power",
            value,
            "W",
        )
    }

    fn open_temp() -> (TempDir, PersistentQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = PersistentQueue::open(dir.path().join("buffer.sqlite")).unwrap();
        (dir, queue)
    }

    #[test]
    fn test_fifo_then_empty() {
        let (_dir, queue) = open_temp();

        queue.enqueue(&sample(1.0)).unwrap();
        queue.enqueue(&sample(2.0)).unwrap();
        queue.enqueue(&sample(3.0)).unwrap();

        assert_eq!(
            queue.dequeue_all().unwrap(),
            vec![sample(1.0), sample(2.0), sample(3.0)]
        );
        assert!(queue.dequeue_all().unwrap().is_empty());
    }

    #[test]
    fn test_dequeue_on_fresh_store_is_empty() {
        let (_dir, queue) = open_temp();

        assert!(queue.dequeue_all().unwrap().is_empty());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.sqlite");

        {
            let queue = PersistentQueue::open(&path).unwrap();
            queue.enqueue(&sample(10.0)).unwrap();
            queue.enqueue(&sample(20.0)).unwrap();
        }

        let reopened = PersistentQueue::open(&path).unwrap();
        assert_eq!(reopened.len().unwrap(), 2);
        assert_eq!(
            reopened.dequeue_all().unwrap(),
            vec![sample(10.0), sample(20.0)]
        );
    }

    #[test]
    fn test_ids_are_never_reused() {
        let (_dir, queue) = open_temp();

        queue.enqueue(&sample(1.0)).unwrap();
        queue.dequeue_all().unwrap();
        queue.enqueue(&sample(2.0)).unwrap();

        let conn = Connection::open(queue.path()).unwrap();
        let id: i64 = conn
            .query_row("SELECT id FROM telemetry_buffer", [], |row| row.get(0))
            .unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn test_open_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state").join("buffer.sqlite");

        let queue = PersistentQueue::open(&path).unwrap();
        queue.enqueue(&sample(1.0)).unwrap();

        assert!(path.exists());
    }

    #[test]
    fn test_max_entries_evicts_oldest() {
        let (_dir, queue) = open_temp();
        let queue = queue.with_max_entries(Some(2));

        for value in [1.0, 2.0, 3.0, 4.0] {
            queue.enqueue(&sample(value)).unwrap();
        }

        assert_eq!(queue.dequeue_all().unwrap(), vec![sample(3.0), sample(4.0)]);
    }

    #[test]
    fn test_non_finite_sample_is_refused_not_stored() {
        let (_dir, queue) = open_temp();

        let result = queue.enqueue(&sample(f64::NAN));

        assert!(matches!(result, Err(QueueError::Serialize(_))));
        assert!(queue.is_empty().unwrap());

        queue.enqueue(&sample(f64::INFINITY)).unwrap_err();
        queue.enqueue(&sample(5.0)).unwrap();
        assert_eq!(queue.dequeue_all().unwrap(), vec![sample(5.0)]);
    }

    #[test]
    fn test_unreadable_payload_is_dropped() {
        let (_dir, queue) = open_temp();
        queue.enqueue(&sample(1.0)).unwrap();

        let conn = Connection::open(queue.path()).unwrap();
        conn.execute(
            "INSERT INTO telemetry_buffer (payload) VALUES ('not json')",
            [],
        )
        .unwrap();
        queue.enqueue(&sample(2.0)).unwrap();

        assert_eq!(queue.dequeue_all().unwrap(), vec![sample(1.0), sample(2.0)]);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_open_fails_on_unwritable_location() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let result = PersistentQueue::open(blocker.join("buffer.sqlite"));
        assert!(matches!(result, Err(QueueError::CreateDir { .. })));
    }
}
