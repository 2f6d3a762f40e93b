//! dirindex - directory tree snapshot and listing service
//!
//! Walks one root directory on a fixed interval, keeps the result as a SQLite
//! snapshot that is swapped in atomically, and answers directory listing
//! queries either from the snapshot or straight from the filesystem.

pub mod config;
pub mod error;
pub mod indexer;
pub mod query;
pub mod server;
pub mod store;
pub mod walk;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use indexer::run_rebuild_loop;
pub use query::{EntryType, ListingEntry};
pub use store::{Stats, Store};
pub use walk::{DirEntry, Directive, EntryKind, Visitor, WalkError, Walker};
