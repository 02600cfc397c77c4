use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    config::ObserverCacheConfig,
    executor::TaskExecutor,
    sync::{SystemClock, TimestampProvider},
    Result,
};

/// Durable side of the impressions observer cache.
pub trait PersistentObserverStorage: Send + Sync {
    /// Last-seen time stored for fingerprint `hash`.
    fn get(&self, hash: u64) -> Result<Option<i64>>;

    /// Store `time` as the last-seen time of `hash`. Writes may be deferred.
    fn insert(&self, hash: u64, time: i64) -> Result<()>;

    /// Forget `hash`. Called when the fingerprint is evicted from memory.
    fn on_removal(&self, hash: u64) -> Result<()>;

    /// Delete rows older than the expiration period relative to `now`, then the oldest rows
    /// until the row ceiling is respected. Returns the number of deleted rows.
    fn delete_outdated(&self, now: i64) -> Result<usize>;
}

/// One persisted fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverRow {
    /// Impression fingerprint.
    pub hash: u64,
    /// Last time an impression with this fingerprint was seen.
    pub time: i64,
    /// When the row was last written.
    pub created_at: i64,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS impressions_observer_cache (
        hash INTEGER PRIMARY KEY,
        time INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_impressions_observer_cache_created_at
        ON impressions_observer_cache(created_at);";

struct StorageInner {
    conn: Mutex<Connection>,
    /// Writes waiting to be flushed.
    buffer: Mutex<HashMap<u64, i64>>,
    flush_scheduled: AtomicBool,
    config: ObserverCacheConfig,
    clock: Arc<dyn TimestampProvider>,
}

/// SQLite-backed [`PersistentObserverStorage`].
///
/// Inserts are buffered and written in one transaction after
/// [`ObserverCacheConfig::persistence_delay`]. Without an executor they are written right away.
#[derive(Clone)]
pub struct SqliteObserverStorage {
    inner: Arc<StorageInner>,
    executor: Option<Arc<TaskExecutor>>,
}

impl SqliteObserverStorage {
    /// Open or create the database at `path`.
    pub fn open(
        path: &Path,
        config: ObserverCacheConfig,
        executor: Option<Arc<TaskExecutor>>,
    ) -> Result<SqliteObserverStorage> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        SqliteObserverStorage::with_connection(conn, config, executor)
    }

    /// Open an in-memory database.
    pub fn in_memory(
        config: ObserverCacheConfig,
        executor: Option<Arc<TaskExecutor>>,
    ) -> Result<SqliteObserverStorage> {
        SqliteObserverStorage::with_connection(Connection::open_in_memory()?, config, executor)
    }

    fn with_connection(
        conn: Connection,
        config: ObserverCacheConfig,
        executor: Option<Arc<TaskExecutor>>,
    ) -> Result<SqliteObserverStorage> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteObserverStorage {
            inner: Arc::new(StorageInner {
                conn: Mutex::new(conn),
                buffer: Mutex::new(HashMap::new()),
                flush_scheduled: AtomicBool::new(false),
                config,
                clock: Arc::new(SystemClock),
            }),
            executor,
        })
    }

    /// Replace the clock used for row timestamps.
    pub fn with_clock(self, clock: Arc<dyn TimestampProvider>) -> SqliteObserverStorage {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => StorageInner { clock, ..inner },
            Err(inner) => {
                log::warn!(target: "flagsync", "storage already shared, keeping its clock");
                return SqliteObserverStorage {
                    inner,
                    executor: self.executor,
                };
            }
        };
        SqliteObserverStorage {
            inner: Arc::new(inner),
            executor: self.executor,
        }
    }

    /// Write buffered inserts now.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    /// Up to `limit` persisted rows, oldest first.
    pub fn get_all(&self, limit: usize) -> Result<Vec<ObserverRow>> {
        let conn = self.inner.conn();
        let mut stmt = conn.prepare(
            "SELECT hash, time, created_at FROM impressions_observer_cache
             ORDER BY created_at ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(ObserverRow {
                    hash: row.get::<_, i64>(0)? as u64,
                    time: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn schedule_flush(&self) {
        if self.inner.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        match &self.executor {
            Some(executor) => {
                let inner = Arc::clone(&self.inner);
                executor.schedule(self.inner.config.persistence_delay, move || {
                    if let Err(err) = inner.flush() {
                        log::error!(target: "flagsync", "failed to persist impression fingerprints: {err}");
                    }
                });
            }
            None => {
                if let Err(err) = self.inner.flush() {
                    log::error!(target: "flagsync", "failed to persist impression fingerprints: {err}");
                }
            }
        }
    }
}

impl StorageInner {
    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .expect("thread holding sqlite connection lock should not panic")
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, HashMap<u64, i64>> {
        self.buffer
            .lock()
            .expect("thread holding write buffer lock should not panic")
    }

    fn flush(&self) -> Result<()> {
        // Cleared before draining so that inserts racing with this flush schedule another one.
        self.flush_scheduled.store(false, Ordering::Release);
        // Connection lock first, so an eviction cannot slip in between draining and committing.
        let mut conn = self.conn();
        let pending = std::mem::take(&mut *self.buffer());
        if pending.is_empty() {
            return Ok(());
        }

        let now = self.clock.now_millis();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO impressions_observer_cache (hash, time, created_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (hash, time) in &pending {
                if let Err(err) = stmt.execute(params![*hash as i64, time, now]) {
                    log::error!(target: "flagsync", "failed to persist impression fingerprint {hash}: {err}");
                }
            }
        }
        tx.commit()?;
        log::debug!(target: "flagsync", "persisted {} impression fingerprints", pending.len());
        Ok(())
    }

    fn count(conn: &Connection) -> Result<usize> {
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM impressions_observer_cache", [], |row| {
                row.get(0)
            })?;
        Ok(count as usize)
    }
}

impl PersistentObserverStorage for SqliteObserverStorage {
    fn get(&self, hash: u64) -> Result<Option<i64>> {
        if let Some(time) = self.inner.buffer().get(&hash) {
            return Ok(Some(*time));
        }

        let time = self
            .inner
            .conn()
            .query_row(
                "SELECT time FROM impressions_observer_cache WHERE hash = ?1",
                params![hash as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(time)
    }

    fn insert(&self, hash: u64, time: i64) -> Result<()> {
        self.inner.buffer().insert(hash, time);
        self.schedule_flush();
        Ok(())
    }

    fn on_removal(&self, hash: u64) -> Result<()> {
        let conn = self.inner.conn();
        self.inner.buffer().remove(&hash);
        conn.execute(
            "DELETE FROM impressions_observer_cache WHERE hash = ?1",
            params![hash as i64],
        )?;
        Ok(())
    }

    fn delete_outdated(&self, now: i64) -> Result<usize> {
        let config = &self.inner.config;
        let batch_size = config.prune_batch_size.max(1);
        let cutoff = now.saturating_sub(config.expiration_period.as_millis() as i64);
        let conn = self.inner.conn();
        let mut deleted = 0;

        loop {
            let removed = conn.execute(
                "DELETE FROM impressions_observer_cache WHERE hash IN (
                     SELECT hash FROM impressions_observer_cache
                     WHERE created_at < ?1 LIMIT ?2)",
                params![cutoff, batch_size as i64],
            )?;
            deleted += removed;
            if removed < batch_size {
                break;
            }
        }

        loop {
            let excess = StorageInner::count(&conn)?.saturating_sub(config.max_persisted_rows);
            if excess == 0 {
                break;
            }
            let removed = conn.execute(
                "DELETE FROM impressions_observer_cache WHERE hash IN (
                     SELECT hash FROM impressions_observer_cache
                     ORDER BY created_at ASC LIMIT ?1)",
                params![excess.min(batch_size) as i64],
            )?;
            deleted += removed;
            if removed == 0 {
                break;
            }
        }

        log::debug!(target: "flagsync", "pruned {deleted} impression fingerprints");
        Ok(deleted)
    }
}
