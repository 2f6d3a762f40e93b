//! Snapshot storage.
//!
//! The last completed scan lives in two SQLite tables, `dirs` and `entries`.
//! A rebuild fills the shadow tables `dirs_tmp` / `entries_tmp` on the writer
//! connection and swaps them in with a single transaction, so readers on the
//! pooled connections always see exactly one complete generation (WAL mode).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rusqlite::{Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Storage location that selects a throwaway database.
pub const IN_MEMORY: &str = ":memory:";

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Maximum number of directory paths returned by [`Store::sitemap`].
pub const SITEMAP_LIMIT: usize = 50_000;

// VM instructions between two deadline checks of a running query
const PROGRESS_OPS: i32 = 1000;

const WRITER_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS dirs (
        id INTEGER PRIMARY KEY,
        path TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS entries (
        parent INTEGER NOT NULL,
        name TEXT NOT NULL,
        is_dir INTEGER NOT NULL
    );
"#;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub directories: u64,
    pub entries: u64,
    pub generation: u64,
}

/// Handle to the snapshot of one root directory.
pub struct Store {
    pub(crate) root: PathBuf,
    db_path: PathBuf,
    pub(crate) writer: Mutex<Connection>,
    readers: ReaderPool,
    /// Number of snapshots committed; zero until the first successful rebuild.
    generation: AtomicU64,
    pub(crate) query_timeout: Duration,
    _scratch: Option<TempDir>,
}

impl Store {
    /// Opens (or creates) the snapshot database at `location` for the tree at `root`.
    ///
    /// `location` is a file path or [`IN_MEMORY`]. A snapshot left by an earlier
    /// run makes the store ready immediately.
    pub fn open(location: &str, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = fs::canonicalize(root).map_err(|source| Error::InvalidRoot {
            path: root.to_path_buf(),
            source,
        })?;
        if !root.is_dir() {
            return Err(Error::InvalidRoot {
                path: root,
                source: std::io::Error::other("not a directory"),
            });
        }

        let (db_path, scratch) = if location == IN_MEMORY {
            let scratch = TempDir::new()?;
            (scratch.path().join("index.db"), Some(scratch))
        } else {
            let db_path = PathBuf::from(location);
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            (db_path, None)
        };

        let writer = Connection::open(&db_path)?;
        writer.busy_timeout(WRITER_BUSY_TIMEOUT)?;
        writer.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;
        writer.execute_batch(SCHEMA)?;

        let existing = writer
            .query_row("SELECT id FROM dirs WHERE path = '/' LIMIT 1", [], |_| Ok(()))
            .optional()?
            .is_some();
        if existing {
            info!("Found existing snapshot in {}", db_path.display());
        }

        Ok(Self {
            root,
            readers: ReaderPool::new(db_path.clone()),
            db_path,
            writer: Mutex::new(writer),
            generation: AtomicU64::new(u64::from(existing)),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            _scratch: scratch,
        })
    }

    /// Sets the time budget of each query, lock waits included.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Canonical root directory this store indexes.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// True once at least one snapshot has been committed. Never reverts.
    pub fn is_ready(&self) -> bool {
        self.generation() != 0
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn advance_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Every known directory path (absolute within the root, trailing slash),
    /// in traversal order, capped at [`SITEMAP_LIMIT`].
    pub fn sitemap(&self) -> Result<Vec<String>> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }

        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached("SELECT path FROM dirs ORDER BY id LIMIT ?1")?;
            let paths = stmt
                .query_map([SITEMAP_LIMIT as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(paths)
        })
    }

    pub fn stats(&self) -> Result<Stats> {
        let generation = self.generation();
        self.with_reader(|conn| {
            let tx = conn.unchecked_transaction()?;
            let directories: i64 = tx.query_row("SELECT COUNT(*) FROM dirs", [], |row| row.get(0))?;
            let entries: i64 = tx.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
            Ok(Stats {
                directories: directories.max(0) as u64,
                entries: entries.max(0) as u64,
                generation,
            })
        })
    }

    /// Runs `f` on a pooled read connection under the query timeout.
    pub(crate) fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let reader = self.readers.take(self.query_timeout)?;

        let deadline = Instant::now() + self.query_timeout;
        reader.progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));
        let result = f(&reader);
        reader.progress_handler(PROGRESS_OPS, None::<fn() -> bool>);
        self.readers.give_back(reader);

        result.map_err(|err| interrupted_as_timeout(err, self.query_timeout))
    }

    /// Releases every connection. Call once background and query work has stopped.
    pub fn close(self) -> Result<()> {
        for conn in self.readers.drain() {
            conn.close().map_err(|(_, err)| err)?;
        }

        let writer = self.writer.into_inner().unwrap_or_else(PoisonError::into_inner);
        writer.close().map_err(|(_, err)| err)?;
        debug!("Closed snapshot database {}", self.db_path.display());
        Ok(())
    }
}

/// Interrupted statements and lock waits that ran out of budget are timeouts.
fn interrupted_as_timeout(err: Error, timeout: Duration) -> Error {
    match err {
        Error::Storage(rusqlite::Error::SqliteFailure(e, _))
            if matches!(
                e.code,
                ErrorCode::OperationInterrupted | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            Error::Timeout(timeout)
        }
        other => other,
    }
}

/// Read-only connections handed out per query and returned afterwards.
struct ReaderPool {
    db_path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl ReaderPool {
    fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            idle: Mutex::new(Vec::new()),
        }
    }

    fn take(&self, busy_timeout: Duration) -> Result<Connection> {
        let idle = lock(&self.idle).pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                let conn = Connection::open(&self.db_path)?;
                conn.execute_batch("PRAGMA query_only = ON;")?;
                conn
            }
        };
        conn.busy_timeout(busy_timeout)?;
        Ok(conn)
    }

    fn give_back(&self, conn: Connection) {
        if conn.is_autocommit() {
            lock(&self.idle).push(conn);
        } else {
            warn!("Discarding reader connection left inside a transaction");
        }
    }

    fn drain(&self) -> Vec<Connection> {
        std::mem::take(&mut *lock(&self.idle))
    }
}
