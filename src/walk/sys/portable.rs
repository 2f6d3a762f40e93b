use std::fs;
use std::io;
use std::path::Path;

use crate::walk::{DirEntry, EntryKind};

pub(crate) fn read_dir(path: &Path, _scratch: &mut [u8]) -> io::Result<Vec<DirEntry>> {
    fs::read_dir(path)?
        .map(|entry| {
            let entry = entry?;
            let kind = EntryKind::from_file_type(entry.file_type()?);
            Ok(DirEntry::new(entry.file_name(), kind))
        })
        .collect()
}
