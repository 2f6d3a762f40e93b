use rusqlite::{params, OptionalExtension};

use crate::error::{Error, Result};
use crate::query::{clean_path, escape_glob, escape_like, sort_listing, EntryType, ListingEntry};
use crate::store::Store;

/// Maximum number of rows a cached query returns.
pub const RESULT_LIMIT: usize = 1000;

const FIND_DIR: &str = "SELECT id FROM dirs WHERE path GLOB ?1 LIMIT 1";

const SEARCH: &str = r#"
    SELECT dirs.path, entries.name, entries.is_dir
    FROM entries
    JOIN dirs ON entries.parent = dirs.id
    WHERE entries.parent IN (SELECT id FROM dirs WHERE path GLOB ?1)
      AND entries.name LIKE ?2 ESCAPE '`'
    LIMIT ?3
"#;

impl Store {
    /// Lists entries of the snapshot below `path` whose name contains `term`.
    ///
    /// Without `recursive` only the directory's immediate children are listed;
    /// with it, every descendant, named relative to `path`.
    pub fn query(&self, path: &str, term: &str, recursive: bool) -> Result<Vec<ListingEntry>> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }

        let prefix = clean_path(path);
        let mut pattern = escape_glob(&prefix);
        if recursive {
            pattern.push('*');
        }
        let like = escape_like(term);

        let mut listing = self.with_reader(|conn| {
            // Both statements read the same generation
            let tx = conn.unchecked_transaction()?;

            let found = tx
                .prepare_cached(FIND_DIR)?
                .query_row([&pattern], |_| Ok(()))
                .optional()?;
            if found.is_none() {
                return Err(Error::NotFound(prefix.clone()));
            }

            let mut stmt = tx.prepare_cached(SEARCH)?;
            let rows = stmt.query_map(params![pattern, like, RESULT_LIMIT as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })?;

            let mut listing = Vec::new();
            for row in rows {
                let (dir, name, is_dir) = row?;
                let rel = dir.strip_prefix(prefix.as_str()).unwrap_or(&dir);
                listing.push(ListingEntry::new(
                    format!("{}{}", rel, name),
                    EntryType::from_is_dir(is_dir),
                ));
            }
            Ok(listing)
        })?;

        sort_listing(&mut listing);
        Ok(listing)
    }
}
