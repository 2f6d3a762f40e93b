//! Directory listing queries.
//!
//! Two engines answer the same question, "which entries below this directory
//! match this search term": [`Store::query`] reads the snapshot and
//! [`Store::query_live`] walks the filesystem one level deep. Both return a
//! listing sorted by [`sort_listing`].
//!
//! [`Store::query`]: crate::store::Store::query
//! [`Store::query_live`]: crate::store::Store::query_live

mod cached;
mod live;

pub use cached::RESULT_LIMIT;

use serde::{Deserialize, Serialize};

/// Escape marker used in LIKE patterns.
pub const LIKE_ESCAPE: char = '`';

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryType {
    // Declaration order puts directories before files when sorting
    #[serde(rename = "d")]
    Directory,
    #[serde(rename = "f")]
    File,
}

impl EntryType {
    pub fn from_is_dir(is_dir: bool) -> Self {
        if is_dir {
            EntryType::Directory
        } else {
            EntryType::File
        }
    }
}

/// One row of a listing. `name` is relative to the queried directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryType,
}

impl ListingEntry {
    pub fn new(name: impl Into<String>, kind: EntryType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Directories first, then case-insensitive by name.
pub fn sort_listing(listing: &mut [ListingEntry]) {
    listing.sort_by_cached_key(|entry| (entry.kind, entry.name.to_lowercase()));
}

/// Normalizes a request path to `/seg/seg/` form. `.` and empty segments are
/// dropped and `..` never climbs above `/`.
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", segments.join("/"))
    }
}

/// Makes `path` match itself literally in a GLOB pattern.
pub fn escape_glob(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if matches!(c, '[' | ']' | '*' | '?') {
            out.push('[');
            out.push(c);
            out.push(']');
        } else {
            out.push(c);
        }
    }
    out
}

/// Turns a search term into a LIKE substring pattern escaped with [`LIKE_ESCAPE`].
/// Whitespace runs match anything; an empty term matches everything.
pub fn escape_like(term: &str) -> String {
    let words: Vec<String> = term
        .split_whitespace()
        .map(|word| {
            let mut out = String::with_capacity(word.len());
            for c in word.chars() {
                if matches!(c, '%' | '_' | LIKE_ESCAPE) {
                    out.push(LIKE_ESCAPE);
                }
                out.push(c);
            }
            out
        })
        .collect();

    if words.is_empty() {
        "%".to_string()
    } else {
        format!("%{}%", words.join("%"))
    }
}

/// Regex counterpart of [`escape_like`] for the live engine.
pub fn escape_regex(term: &str) -> String {
    let words: Vec<String> = term.split_whitespace().map(regex::escape).collect();

    if words.is_empty() {
        ".*".to_string()
    } else {
        format!(".*{}.*", words.join(".*"))
    }
}
