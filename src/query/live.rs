use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::query::{clean_path, escape_regex, sort_listing, EntryType, ListingEntry};
use crate::store::Store;
use crate::walk::{DirEntry, Directive, Visitor, WalkError, Walker};

/// Collects the immediate children of one directory.
struct LiveListing<'a> {
    target: PathBuf,
    pattern: &'a Regex,
    depth: usize,
    deadline: Instant,
    timeout: Duration,
    listing: Vec<ListingEntry>,
}

impl LiveListing<'_> {
    fn check_deadline(&self) -> std::result::Result<(), WalkError> {
        if Instant::now() >= self.deadline {
            return Err(WalkError::visitor(Error::Timeout(self.timeout)));
        }
        Ok(())
    }
}

impl Visitor for LiveListing<'_> {
    fn visit(&mut self, _path: &Path, entry: &DirEntry) -> std::result::Result<Directive, WalkError> {
        self.check_deadline()?;
        if self.depth == 0 {
            return Ok(Directive::Continue);
        }

        let name = entry.name().to_string_lossy();
        if entry.is_hidden() || !self.pattern.is_match(&name) {
            return Ok(Directive::Continue);
        }

        self.listing.push(ListingEntry::new(
            name.into_owned(),
            EntryType::from_is_dir(entry.is_dir()),
        ));
        Ok(Directive::Continue)
    }

    fn enter(&mut self, _path: &Path, _entry: &DirEntry) -> std::result::Result<Directive, WalkError> {
        if self.depth >= 1 {
            return Ok(Directive::SkipSubtree);
        }
        self.depth += 1;
        Ok(Directive::Continue)
    }

    fn leave(
        &mut self,
        _path: &Path,
        _entry: &DirEntry,
        result: std::result::Result<(), WalkError>,
    ) -> std::result::Result<(), WalkError> {
        self.depth -= 1;
        result?;
        // Listing the target can outlast the budget even when nothing is visited
        self.check_deadline()
    }

    fn error(
        &mut self,
        path: &Path,
        _entry: &DirEntry,
        err: WalkError,
    ) -> std::result::Result<(), WalkError> {
        // Failing to list the target itself fails the query; broken children are skipped
        if matches!(err, WalkError::Visitor(_)) || path == self.target {
            return Err(err);
        }
        warn!("Error iterating {}: {}", path.display(), err);
        Ok(())
    }
}

impl Store {
    /// Lists the immediate children of `path` straight from the filesystem,
    /// keeping names that match `term` (whitespace-separated words, in order).
    pub fn query_live(&self, path: &str, term: &str) -> Result<Vec<ListingEntry>> {
        let pattern = Regex::new(&escape_regex(term))?;

        let prefix = clean_path(path);
        let target: PathBuf = self
            .root
            .join(prefix.trim_start_matches('/'))
            .components()
            .collect();

        // Symlinked directories leading out of the root are not listed
        if let Ok(real) = fs::canonicalize(&target) {
            if !real.starts_with(&self.root) {
                debug!("Refusing live listing of {} outside of root", real.display());
                return Err(Error::NotFound(prefix));
            }
        }

        let mut live = LiveListing {
            target: target.clone(),
            pattern: &pattern,
            depth: 0,
            deadline: Instant::now() + self.query_timeout,
            timeout: self.query_timeout,
            listing: Vec::new(),
        };

        match Walker::new().walk(&target, &mut live) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Err(Error::NotFound(prefix)),
            Err(err) => return Err(err.into()),
        }

        let mut listing = live.listing;
        sort_listing(&mut listing);
        Ok(listing)
    }
}
