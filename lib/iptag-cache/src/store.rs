/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use rusqlite::{Connection, OpenFlags, params};
use thiserror::Error;

use crate::cache::now_nanos;

const CHANNEL_CAPACITY: usize = 2048;
const BATCH_MAX: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const PURGE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const RO_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS ip_cache (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    exp INTEGER NOT NULL,
    refresh_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_exp ON ip_cache(exp);
";

const UPSERT_SQL: &str = "\
INSERT INTO ip_cache (key, value, exp, refresh_at) VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(key) DO UPDATE SET
    value = excluded.value, exp = excluded.exp, refresh_at = excluded.refresh_at";

const DELETE_SQL: &str = "DELETE FROM ip_cache WHERE key = ?1";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to spawn writer thread: {0}")]
    Spawn(std::io::Error),
    #[error("persistence already started")]
    AlreadyStarted,
    #[error("persistence not enabled")]
    NotEnabled,
}

/// One record on the write-behind channel.
pub(crate) struct PersistOp {
    is_delete: bool,
    key: String,
    value: String,
    exp: i64,
    refresh_at: i64,
}

impl PersistOp {
    pub(crate) fn upsert(key: &str, value: &str, exp: i64, refresh_at: i64) -> Self {
        PersistOp {
            is_delete: false,
            key: key.to_string(),
            value: value.to_string(),
            exp,
            refresh_at,
        }
    }

    pub(crate) fn delete(key: &str) -> Self {
        PersistOp {
            is_delete: true,
            key: key.to_string(),
            value: String::new(),
            exp: 0,
            refresh_at: 0,
        }
    }
}

pub(crate) struct StoredItem {
    pub(crate) key: String,
    pub(crate) value: String,
    pub(crate) exp: i64,
    pub(crate) refresh_at: i64,
}

/// Write-behind sqlite store. A single named thread owns the write
/// connection; producers push ops through a bounded channel with
/// `try_send` and never block on disk.
pub(crate) struct CacheStore {
    path: PathBuf,
    sender: Mutex<Option<flume::Sender<PersistOp>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    ro_conn: Mutex<Option<Connection>>,
}

impl CacheStore {
    /// Open the write connection (creating schema as needed) and start
    /// the writer thread.
    pub(crate) fn spawn(path: &Path) -> Result<CacheStore, StoreError> {
        let conn = open_rw(path)?;
        let (tx, rx) = flume::bounded(CHANNEL_CAPACITY);
        let writer = std::thread::Builder::new()
            .name("cache-store".to_string())
            .spawn(move || writer_loop(conn, rx))
            .map_err(StoreError::Spawn)?;
        Ok(CacheStore {
            path: path.to_path_buf(),
            sender: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            ro_conn: Mutex::new(None),
        })
    }

    /// Non-blocking enqueue; false when the channel is full or closed.
    pub(crate) fn send(&self, op: PersistOp) -> bool {
        let sender = self.sender.lock().unwrap();
        match sender.as_ref() {
            Some(tx) => tx.try_send(op).is_ok(),
            None => false,
        }
    }

    /// Drop the producer side so the writer drains remaining ops,
    /// flushes its final batch and exits, then join it.
    pub(crate) fn close(&self) {
        drop(self.sender.lock().unwrap().take());
        if let Some(writer) = self.writer.lock().unwrap().take() {
            if writer.join().is_err() {
                error!("cache store writer thread panicked");
            }
        }
        *self.ro_conn.lock().unwrap() = None;
    }

    /// Live rows through the lazily opened read-only connection.
    pub(crate) fn all_items(&self, now: i64) -> Result<Vec<(String, String)>, StoreError> {
        let mut guard = self.ro_conn.lock().unwrap();
        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => guard.insert(open_ro(&self.path)?),
        };
        let mut stmt = conn.prepare_cached("SELECT key, value FROM ip_cache WHERE exp > ?1")?;
        let rows = stmt.query_map([now], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }
}

/// Load rows that are still live at `now`. Opens its own connection and
/// ensures the schema so a first boot against a fresh path succeeds.
pub(crate) fn load_items(path: &Path, now: i64) -> Result<Vec<StoredItem>, StoreError> {
    let conn = open_rw(path)?;
    let mut stmt =
        conn.prepare("SELECT key, value, exp, refresh_at FROM ip_cache WHERE exp > ?1")?;
    let rows = stmt.query_map([now], |row| {
        Ok(StoredItem {
            key: row.get(0)?,
            value: row.get(1)?,
            exp: row.get(2)?,
            refresh_at: row.get(3)?,
        })
    })?;
    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }
    Ok(items)
}

fn open_rw(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

fn open_ro(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    conn.busy_timeout(RO_BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Writer loop: batch incoming ops, flush at [`BATCH_MAX`] or every
/// [`FLUSH_INTERVAL`], purge expired rows every [`PURGE_INTERVAL`], and
/// on disconnect flush what is left and return.
fn writer_loop(mut conn: Connection, rx: flume::Receiver<PersistOp>) {
    let mut batch: Vec<PersistOp> = Vec::with_capacity(BATCH_MAX);
    let mut next_flush = Instant::now() + FLUSH_INTERVAL;
    let mut next_purge = Instant::now() + PURGE_INTERVAL;

    loop {
        match rx.recv_deadline(next_flush) {
            Ok(op) => {
                batch.push(op);
                if batch.len() >= BATCH_MAX {
                    flush(&mut conn, &mut batch);
                }
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                flush(&mut conn, &mut batch);
                next_flush = Instant::now() + FLUSH_INTERVAL;
            }
            Err(flume::RecvTimeoutError::Disconnected) => {
                flush(&mut conn, &mut batch);
                return;
            }
        }

        if Instant::now() >= next_purge {
            purge(&conn);
            next_purge = Instant::now() + PURGE_INTERVAL;
        }
    }
}

fn flush(conn: &mut Connection, batch: &mut Vec<PersistOp>) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = flush_batch(conn, batch) {
        // the in-memory cache stays authoritative, do not retry
        warn!("cache store flush failed, {} updates lost: {e}", batch.len());
    }
    batch.clear();
}

fn flush_batch(conn: &mut Connection, batch: &[PersistOp]) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    {
        let mut upsert = tx.prepare_cached(UPSERT_SQL)?;
        let mut delete = tx.prepare_cached(DELETE_SQL)?;
        for op in batch {
            if op.is_delete {
                delete.execute(params![op.key])?;
            } else {
                upsert.execute(params![op.key, op.value, op.exp, op.refresh_at])?;
            }
        }
    }
    tx.commit()
}

fn purge(conn: &Connection) {
    match conn.execute("DELETE FROM ip_cache WHERE exp < ?1", [now_nanos()]) {
        Ok(n) if n > 0 => debug!("cache store purged {n} expired rows"),
        Ok(_) => {}
        Err(e) => warn!("cache store purge failed: {e}"),
    }
}
