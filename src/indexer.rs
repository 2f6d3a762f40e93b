//! Snapshot rebuilds.
//!
//! [`Store::rebuild`] walks the root into the shadow tables and swaps them in.
//! [`run_rebuild_loop`] repeats that on a fixed delay, one build at a time.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::store::{lock, Store};
use crate::walk::{DirEntry, Directive, Visitor, WalkError, Walker};

// ============================================================================
// Schema
// ============================================================================

/// Rows written per transaction while scanning.
pub const BATCH_SIZE: usize = 16_384;

const CREATE_SHADOW: &str = r#"
    DROP TABLE IF EXISTS dirs_tmp;
    DROP TABLE IF EXISTS entries_tmp;

    CREATE TABLE dirs_tmp (
        id INTEGER PRIMARY KEY,
        path TEXT NOT NULL
    );

    CREATE TABLE entries_tmp (
        parent INTEGER NOT NULL,
        name TEXT NOT NULL,
        is_dir INTEGER NOT NULL
    );
"#;

const SWAP: &str = r#"
    DROP TABLE IF EXISTS dirs;
    DROP TABLE IF EXISTS entries;
    ALTER TABLE dirs_tmp RENAME TO dirs;
    ALTER TABLE entries_tmp RENAME TO entries;
    CREATE INDEX idx_dirs_path ON dirs (path);
    CREATE INDEX idx_entries_parent ON entries (parent);
    COMMIT;
"#;

const INSERT_DIR: &str = "INSERT INTO dirs_tmp (path) VALUES (?1)";
const INSERT_ENTRY: &str = "INSERT INTO entries_tmp (parent, name, is_dir) VALUES (?1, ?2, ?3)";

// ============================================================================
// Rebuild
// ============================================================================

impl Store {
    /// Builds a new snapshot of the root and makes it the live generation.
    ///
    /// Returns the number of entries stored. On failure the previous
    /// generation stays live and the readiness gate is left untouched.
    pub fn rebuild(&self) -> Result<usize> {
        self.rebuild_with_batch(BATCH_SIZE)
    }

    pub(crate) fn rebuild_with_batch(&self, batch_size: usize) -> Result<usize> {
        let conn = lock(&self.writer);
        let start = Instant::now();
        debug!("Rebuilding snapshot of {}", self.root.display());

        // Fresh shadow tables; the live ones stay readable throughout
        conn.execute_batch(CREATE_SHADOW)?;
        conn.execute_batch("BEGIN")?;

        let mut ctx = RebuildContext::new(&conn, &self.root, batch_size);
        let walked = Walker::new().walk(&self.root, &mut ctx);
        let count = ctx.entries();

        // Swap only after a complete walk
        let swapped = walked
            .map_err(Error::from)
            .and_then(|()| conn.execute_batch(SWAP).map_err(Error::from));
        if let Err(err) = swapped {
            // Leftover shadow rows are dropped by the next rebuild
            if !conn.is_autocommit() {
                if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                    warn!("Rollback after failed rebuild failed: {}", rollback);
                }
            }
            return Err(err);
        }

        // Open the gate only once the new tables are committed
        let generation = self.advance_generation();
        info!(
            "Snapshot generation {} ready: {} entries in {:?}",
            generation,
            count,
            start.elapsed()
        );

        if let Err(e) = conn.execute_batch("VACUUM; PRAGMA shrink_memory;") {
            debug!("Skipping housekeeping after rebuild: {}", e);
        }

        Ok(count)
    }
}

/// Rebuilds forever, sleeping `interval` between passes. A zero interval
/// builds once and returns.
pub async fn run_rebuild_loop(store: Arc<Store>, interval: Duration) {
    let mut last = 0usize;

    loop {
        let worker = Arc::clone(&store);
        match tokio::task::spawn_blocking(move || worker.rebuild()).await {
            Ok(Ok(count)) => {
                if count != last {
                    info!(
                        "{} records in database after update ({:+})",
                        count,
                        count as i64 - last as i64
                    );
                    last = count;
                }
            }
            Ok(Err(e)) => error!("Rebuild failed: {}", e),
            Err(e) => error!("Rebuild task failed: {}", e),
        }

        if interval.is_zero() {
            break;
        }
        tokio::time::sleep(interval).await;
    }
}

// ============================================================================
// Rebuild state
// ============================================================================

#[derive(Debug)]
struct Frame {
    id: i64,
    /// Canonical target when this directory was reached through a symlink.
    link_target: Option<PathBuf>,
}

/// Ids of the directories currently open in the walk, innermost last.
#[derive(Debug, Default)]
pub struct DirStack {
    frames: Vec<Frame>,
}

impl DirStack {
    pub fn push(&mut self, id: i64, link_target: Option<PathBuf>) {
        self.frames.push(Frame { id, link_target });
    }

    pub fn pop(&mut self) -> Option<i64> {
        self.frames.pop().map(|f| f.id)
    }

    /// Id of the innermost open directory.
    pub fn current(&self) -> Option<i64> {
        self.frames.last().map(|f| f.id)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// True if an open directory was entered through a symlink to `target`.
    pub fn is_following(&self, target: &Path) -> bool {
        self.frames
            .iter()
            .any(|f| f.link_target.as_deref() == Some(target))
    }
}

/// Walk state of one rebuild: writes rows into the shadow tables.
pub(crate) struct RebuildContext<'c> {
    conn: &'c Connection,
    root: &'c Path,
    stack: DirStack,
    visits: usize,
    entries: usize,
    batch_size: usize,
}

impl<'c> RebuildContext<'c> {
    pub(crate) fn new(conn: &'c Connection, root: &'c Path, batch_size: usize) -> Self {
        Self {
            conn,
            root,
            stack: DirStack::default(),
            visits: 0,
            entries: 0,
            batch_size: batch_size.max(1),
        }
    }

    pub(crate) fn entries(&self) -> usize {
        self.entries
    }

    #[cfg(test)]
    pub(crate) fn stack(&self) -> &DirStack {
        &self.stack
    }

    /// Snapshot path of a directory: relative to the root, with leading and trailing slash.
    fn dir_path(&self, path: &Path) -> String {
        let rel = path.strip_prefix(self.root).unwrap_or(path);
        if rel.as_os_str().is_empty() {
            "/".to_string()
        } else {
            format!("/{}/", rel.to_string_lossy())
        }
    }

    /// Decides whether a symlinked directory may be descended into.
    /// Returns its canonical target when it may.
    fn follow_link(&self, path: &Path) -> std::result::Result<Option<PathBuf>, WalkError> {
        let target = fs::canonicalize(path).map_err(|err| WalkError::io(path, err))?;

        if !target.starts_with(self.root) {
            info!(
                "Skipping symlink {} pointing outside of root ({})",
                path.display(),
                target.display()
            );
            return Ok(None);
        }
        if path.starts_with(&target) || self.stack.is_following(&target) {
            info!("Skipping symlink cycle at {}", path.display());
            return Ok(None);
        }

        Ok(Some(target))
    }
}

fn storage(err: rusqlite::Error) -> WalkError {
    WalkError::visitor(Error::Storage(err))
}

impl Visitor for RebuildContext<'_> {
    fn visit(&mut self, _path: &Path, entry: &DirEntry) -> std::result::Result<Directive, WalkError> {
        self.visits += 1;
        // The root is not an entry of itself
        if self.visits == 1 {
            return Ok(Directive::Continue);
        }
        if entry.is_hidden() {
            return Ok(Directive::SkipSubtree);
        }

        let parent = self.stack.current().ok_or_else(|| {
            WalkError::visitor("entry visited outside of any open directory")
        })?;
        let name = entry.name().to_string_lossy();
        self.conn
            .prepare_cached(INSERT_ENTRY)
            .and_then(|mut stmt| stmt.execute(params![parent, &*name, entry.is_dir()]))
            .map_err(storage)?;

        self.entries += 1;
        if self.entries % self.batch_size == 0 {
            self.conn.execute_batch("COMMIT; BEGIN").map_err(storage)?;
            debug!("Committed {} entries", self.entries);
        }

        Ok(Directive::Continue)
    }

    fn enter(&mut self, path: &Path, entry: &DirEntry) -> std::result::Result<Directive, WalkError> {
        if self.stack.depth() > 0 && entry.is_hidden() {
            return Ok(Directive::SkipSubtree);
        }

        let link_target = if entry.is_symlink() {
            match self.follow_link(path)? {
                Some(target) => Some(target),
                None => return Ok(Directive::SkipSubtree),
            }
        } else {
            None
        };

        let dir_path = self.dir_path(path);
        self.conn
            .prepare_cached(INSERT_DIR)
            .and_then(|mut stmt| stmt.execute([&dir_path]))
            .map_err(storage)?;
        self.stack.push(self.conn.last_insert_rowid(), link_target);

        Ok(Directive::Continue)
    }

    fn leave(
        &mut self,
        _path: &Path,
        _entry: &DirEntry,
        result: std::result::Result<(), WalkError>,
    ) -> std::result::Result<(), WalkError> {
        self.stack.pop();
        result
    }

    fn error(
        &mut self,
        path: &Path,
        _entry: &DirEntry,
        err: WalkError,
    ) -> std::result::Result<(), WalkError> {
        match err {
            WalkError::Visitor(_) => Err(err),
            err => {
                warn!("Error iterating {}: {}", path.display(), err);
                Ok(())
            }
        }
    }
}
