//! Platform directory enumeration backends.
//!
//! Every backend exposes `read_dir(path, scratch) -> io::Result<Vec<DirEntry>>`
//! returning owned entries without `.` and `..`. Linux reads raw
//! `getdents64(2)` records into the walker's scratch buffer; other platforms
//! use `std::fs::read_dir`.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod getdents;
#[cfg_attr(any(target_os = "linux", target_os = "android"), allow(dead_code))]
mod portable;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use getdents::read_dir;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) use portable::read_dir;

use nix::unistd::{sysconf, SysconfVar};

/// Smallest scratch buffer accepted by the walker.
pub(crate) fn page_size() -> usize {
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|size| usize::try_from(size).ok())
        .unwrap_or(4096)
}
