use crate::config::DatabaseConfig;
use crate::types::LinkState;
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::ReentrantMutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Persisted image of one connections row, keyed by (src, dst)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionState {
    /// Storage-assigned identity; set on first upsert, stable afterwards
    pub id: Option<i64>,
    pub state: Option<LinkState>,
    pub tx_state: Option<String>,
    pub tx_seq: Option<u64>,
    pub tx_ts: Option<DateTime<Utc>>,
    pub tx_height: Option<u64>,
    pub rx_state: Option<String>,
    pub rx_seq: Option<u64>,
    pub rx_ts: Option<DateTime<Utc>>,
    pub rx_height: Option<u64>,
}

/// One pending-until-acknowledged send observation, FIFO by serial number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub sn: i64,
    pub tx_seq: u64,
    pub ts: DateTime<Utc>,
}

/// One row of the append-only event log
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub sn: i64,
    pub ts: f64,
    pub src: String,
    pub dst: String,
    pub event: String,
    pub extra: serde_json::Value,
}

/// Filter for `get_logs`; default returns the newest rows first
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub src: Option<String>,
    pub dst: Option<String>,
    pub event: Option<String>,
    pub limit: Option<usize>,
    /// Only rows with sn greater than this; switches ordering to ascending
    pub after: Option<i64>,
    /// Only rows with sn less than this
    pub before: Option<i64>,
}

const MAX_LOG_LIMIT: usize = 100;

struct StorageInner {
    conn: RefCell<Connection>,
    in_batch: Cell<bool>,
}

/// Rolls the active batch back if the batch closure unwinds, so the
/// connection is not left inside an orphaned transaction.
struct BatchGuard<'a> {
    inner: &'a StorageInner,
    armed: bool,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.in_batch.set(false);
            if let Ok(conn) = self.inner.conn.try_borrow() {
                let _ = conn.execute_batch("ROLLBACK");
            }
        }
    }
}

/// Durable store for the monitor: event log, connection records and the
/// per-connection pending tx history.
///
/// A single reentrant lock serializes every access to the underlying SQLite
/// connection. `do_batch` wraps a whole polling round in one transaction;
/// individual writes issued inside an active batch join it, writes issued
/// outside get their own transaction.
pub struct Storage {
    inner: ReentrantMutex<StorageInner>,
}

impl Storage {
    /// Open (or create) the database at the configured path
    pub fn open(config: &DatabaseConfig) -> StorageResult<Self> {
        let conn = Connection::open(&config.path)?;
        if config.enable_wal {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch(
            "
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        let storage = Self {
            inner: ReentrantMutex::new(StorageInner { conn: RefCell::new(conn), in_batch: Cell::new(false) }),
        };
        storage.init_schema()?;
        debug!("Storage initialized at {:?}", config.path);
        Ok(storage)
    }

    /// In-memory database, used by tests and one-shot queries
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let storage = Self {
            inner: ReentrantMutex::new(StorageInner { conn: RefCell::new(conn), in_batch: Cell::new(false) }),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let inner = self.inner.lock();
        inner.conn.borrow().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS logs (
                sn INTEGER PRIMARY KEY AUTOINCREMENT,
                ts REAL NOT NULL,
                src TEXT NOT NULL,
                dst TEXT NOT NULL,
                event TEXT NOT NULL,
                extra TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_logs_src_dst ON logs(src, dst);
            CREATE INDEX IF NOT EXISTS idx_logs_event ON logs(event);

            CREATE TABLE IF NOT EXISTS connections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                src TEXT NOT NULL,
                dst TEXT NOT NULL,
                state TEXT,
                tx_state TEXT,
                tx_seq INTEGER,
                tx_ts REAL,
                tx_height INTEGER,
                rx_state TEXT,
                rx_seq INTEGER,
                rx_ts REAL,
                rx_height INTEGER,
                UNIQUE(src, dst)
            );

            CREATE TABLE IF NOT EXISTS tx_history (
                sn INTEGER PRIMARY KEY AUTOINCREMENT,
                conn_id INTEGER NOT NULL,
                tx_seq INTEGER NOT NULL,
                ts REAL NOT NULL,
                FOREIGN KEY(conn_id) REFERENCES connections(id)
            );

            CREATE INDEX IF NOT EXISTS idx_tx_history_conn ON tx_history(conn_id);
            ",
        )?;
        debug!("Database schema initialized");
        Ok(())
    }

    /// Run `work` inside one transaction: commit on Ok, roll back on Err.
    ///
    /// Reentrant: a `do_batch` issued while a batch is already active on this
    /// thread joins the outer transaction instead of opening its own.
    pub fn do_batch<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<StorageError>,
    {
        let inner = self.inner.lock();
        if inner.in_batch.get() {
            return work();
        }
        inner
            .conn
            .borrow()
            .execute_batch("BEGIN DEFERRED")
            .map_err(|e| E::from(StorageError::from(e)))?;
        inner.in_batch.set(true);
        let mut guard = BatchGuard { inner: &inner, armed: true };
        let result = work();
        guard.armed = false;
        drop(guard);
        inner.in_batch.set(false);
        match result {
            Ok(value) => match inner.conn.borrow().execute_batch("COMMIT") {
                Ok(()) => Ok(value),
                Err(e) => {
                    let _ = inner.conn.borrow().execute_batch("ROLLBACK");
                    Err(E::from(StorageError::from(e)))
                }
            },
            Err(e) => {
                let _ = inner.conn.borrow().execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Run a mutation: inside an active batch it joins that transaction,
    /// otherwise it gets a transaction of its own.
    fn do_write<T, F>(&self, work: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> SqliteResult<T>,
    {
        let inner = self.inner.lock();
        let conn = inner.conn.borrow();
        if inner.in_batch.get() {
            return work(&conn).map_err(Into::into);
        }
        conn.execute_batch("BEGIN")?;
        match work(&conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e.into())
            }
        }
    }

    fn do_read<T, F>(&self, work: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> SqliteResult<T>,
    {
        let inner = self.inner.lock();
        let conn = inner.conn.borrow();
        work(&conn).map_err(Into::into)
    }

    /// Append one row to the event log, returning its serial number
    pub fn write_log(
        &self,
        ts: DateTime<Utc>,
        src: &str,
        dst: &str,
        event: &str,
        extra: &serde_json::Value,
    ) -> StorageResult<i64> {
        let extra_str = serde_json::to_string(extra)?;
        self.do_write(|conn| {
            conn.execute(
                "INSERT INTO logs (ts, src, dst, event, extra) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![to_epoch(ts), src, dst, event, extra_str],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_logs(&self, filter: &LogFilter) -> StorageResult<Vec<LogEntry>> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        let mut order = "DESC";

        if let Some(src) = &filter.src {
            conditions.push("src = ?");
            args.push(Box::new(src.clone()));
        }
        if let Some(dst) = &filter.dst {
            conditions.push("dst = ?");
            args.push(Box::new(dst.clone()));
        }
        if let Some(event) = &filter.event {
            conditions.push("event = ?");
            args.push(Box::new(event.clone()));
        }
        if let Some(after) = filter.after {
            order = "ASC";
            conditions.push("sn > ?");
            args.push(Box::new(after));
        }
        if let Some(before) = filter.before {
            conditions.push("sn < ?");
            args.push(Box::new(before));
        }

        let limit = filter.limit.unwrap_or(MAX_LOG_LIMIT).min(MAX_LOG_LIMIT);
        args.push(Box::new(limit as i64));

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT sn, ts, src, dst, event, extra FROM logs{} ORDER BY sn {} LIMIT ?",
            where_clause, order
        );

        self.do_read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let params = rusqlite::params_from_iter(args.iter().map(|a| a.as_ref()));
            let rows = stmt
                .query_map(params, |row| {
                    let extra_str: Option<String> = row.get(5)?;
                    let extra = extra_str
                        .as_deref()
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or(serde_json::Value::Null);
                    Ok(LogEntry {
                        sn: row.get(0)?,
                        ts: row.get(1)?,
                        src: row.get(2)?,
                        dst: row.get(3)?,
                        event: row.get(4)?,
                        extra,
                    })
                })?
                .collect::<SqliteResult<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn get_connection_state(&self, src: &str, dst: &str) -> StorageResult<Option<ConnectionState>> {
        self.do_read(|conn| {
            conn.query_row(
                "SELECT id, state, tx_state, tx_seq, tx_ts, tx_height,
                        rx_state, rx_seq, rx_ts, rx_height
                 FROM connections WHERE src = ?1 AND dst = ?2",
                params![src, dst],
                |row| {
                    let state_str: Option<String> = row.get(1)?;
                    let state = state_str
                        .as_deref()
                        .map(|s| s.parse::<LinkState>().map_err(|_| rusqlite::Error::InvalidQuery))
                        .transpose()?;
                    Ok(ConnectionState {
                        id: row.get(0)?,
                        state,
                        tx_state: row.get(2)?,
                        tx_seq: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
                        tx_ts: row.get::<_, Option<f64>>(4)?.and_then(from_epoch),
                        tx_height: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
                        rx_state: row.get(6)?,
                        rx_seq: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
                        rx_ts: row.get::<_, Option<f64>>(8)?.and_then(from_epoch),
                        rx_height: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
                    })
                },
            )
            .optional()
        })
    }

    /// Upsert the connections row for (src, dst). The identity assigned on
    /// first insert never changes; it is written back into `state` when not
    /// yet known to the caller.
    pub fn set_connection_state(&self, src: &str, dst: &str, state: &mut ConnectionState) -> StorageResult<()> {
        let id = self.do_write(|conn| {
            conn.execute(
                "INSERT INTO connections (
                    src, dst, state, tx_state, tx_seq, tx_ts, tx_height,
                    rx_state, rx_seq, rx_ts, rx_height
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(src, dst) DO UPDATE SET
                    state = excluded.state,
                    tx_state = excluded.tx_state,
                    tx_seq = excluded.tx_seq,
                    tx_ts = excluded.tx_ts,
                    tx_height = excluded.tx_height,
                    rx_state = excluded.rx_state,
                    rx_seq = excluded.rx_seq,
                    rx_ts = excluded.rx_ts,
                    rx_height = excluded.rx_height",
                params![
                    src,
                    dst,
                    state.state.map(|s| s.as_str()),
                    state.tx_state,
                    state.tx_seq.map(|v| v as i64),
                    state.tx_ts.map(to_epoch),
                    state.tx_height.map(|v| v as i64),
                    state.rx_state,
                    state.rx_seq.map(|v| v as i64),
                    state.rx_ts.map(to_epoch),
                    state.rx_height.map(|v| v as i64),
                ],
            )?;
            conn.query_row(
                "SELECT id FROM connections WHERE src = ?1 AND dst = ?2",
                params![src, dst],
                |row| row.get::<_, i64>(0),
            )
        })?;
        if state.id.is_none() {
            state.id = Some(id);
        }
        Ok(())
    }

    /// Pending tx records for one connection, oldest first
    pub fn get_tx_records(&self, conn_id: i64) -> StorageResult<Vec<TxRecord>> {
        self.do_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sn, tx_seq, ts FROM tx_history WHERE conn_id = ?1 ORDER BY sn ASC",
            )?;
            let rows = stmt
                .query_map(params![conn_id], |row| {
                    let ts = from_epoch(row.get::<_, f64>(2)?).ok_or(rusqlite::Error::InvalidQuery)?;
                    Ok(TxRecord {
                        sn: row.get(0)?,
                        tx_seq: row.get::<_, i64>(1)? as u64,
                        ts,
                    })
                })?
                .collect::<SqliteResult<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn add_tx_record(&self, conn_id: i64, tx_seq: u64, ts: DateTime<Utc>) -> StorageResult<TxRecord> {
        let sn = self.do_write(|conn| {
            conn.execute(
                "INSERT INTO tx_history (conn_id, tx_seq, ts) VALUES (?1, ?2, ?3)",
                params![conn_id, tx_seq as i64, to_epoch(ts)],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(TxRecord { sn, tx_seq, ts })
    }

    pub fn delete_tx_record(&self, sn: i64) -> StorageResult<()> {
        self.do_write(|conn| {
            conn.execute("DELETE FROM tx_history WHERE sn = ?1", params![sn])?;
            Ok(())
        })
    }

    /// Database file size in bytes; 0 for in-memory databases
    pub fn database_size(&self) -> StorageResult<u64> {
        let path: String = self.do_read(|conn| {
            conn.query_row("PRAGMA database_list", [], |row| row.get(2))
        })?;
        if path.is_empty() {
            return Ok(0);
        }
        let metadata = std::fs::metadata(&path)?;
        Ok(metadata.len())
    }
}

fn to_epoch(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1e6
}

fn from_epoch(secs: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros((secs * 1e6) as i64)
}
