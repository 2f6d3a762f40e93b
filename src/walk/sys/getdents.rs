//! Linux backend: `getdents64(2)` straight into the caller's scratch buffer.
//!
//! The syscall is the only unsafe code in the walker. Records are decoded from
//! the byte buffer with explicit bounds checks into owned [`DirEntry`] values.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStringExt;
use std::path::Path;

use nix::libc;

use crate::walk::{DirEntry, EntryKind};

// struct linux_dirent64 { u64 d_ino; i64 d_off; u16 d_reclen; u8 d_type; char d_name[]; }
const RECLEN_OFFSET: usize = 16;
const TYPE_OFFSET: usize = 18;
const NAME_OFFSET: usize = 19;

pub(crate) fn read_dir(path: &Path, scratch: &mut [u8]) -> io::Result<Vec<DirEntry>> {
    let dir = File::open(path)?;
    let fd = dir.as_raw_fd();

    let mut entries = Vec::new();
    loop {
        let n = getdents64(fd, scratch)?;
        if n == 0 {
            break;
        }

        for record in Records::new(&scratch[..n]) {
            let record = record?;
            if record.ino == 0 || matches!(record.name, b"" | b"." | b"..") {
                continue;
            }

            let name = OsString::from_vec(record.name.to_vec());
            let kind = match kind_from_dtype(record.d_type) {
                Some(kind) => kind,
                None => EntryKind::from_file_type(fs::symlink_metadata(path.join(&name))?.file_type()),
            };
            entries.push(DirEntry::new(name, kind));
        }
    }

    Ok(entries)
}

fn getdents64(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `buf` is an exclusive borrow and the kernel writes at most `buf.len()` bytes.
    let ret = unsafe { libc::syscall(libc::SYS_getdents64, fd, buf.as_mut_ptr(), buf.len()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    usize::try_from(ret).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))
}

/// `None` for `DT_UNKNOWN` and anything else the caller has to stat.
fn kind_from_dtype(d_type: u8) -> Option<EntryKind> {
    match d_type {
        libc::DT_REG => Some(EntryKind::Regular),
        libc::DT_DIR => Some(EntryKind::Directory),
        libc::DT_LNK => Some(EntryKind::Symlink),
        libc::DT_BLK => Some(EntryKind::BlockDevice),
        libc::DT_CHR => Some(EntryKind::CharDevice),
        libc::DT_FIFO => Some(EntryKind::Fifo),
        libc::DT_SOCK => Some(EntryKind::Socket),
        _ => None,
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Record<'a> {
    ino: u64,
    d_type: u8,
    name: &'a [u8],
}

/// Iterator over the records of one `getdents64` result.
struct Records<'a> {
    buf: &'a [u8],
}

impl<'a> Records<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = io::Result<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }

        match parse_record(self.buf) {
            Ok((record, reclen)) => {
                self.buf = &self.buf[reclen..];
                Some(Ok(record))
            }
            Err(err) => {
                self.buf = &[];
                Some(Err(err))
            }
        }
    }
}

fn parse_record(buf: &[u8]) -> io::Result<(Record<'_>, usize)> {
    if buf.len() < NAME_OFFSET {
        return Err(malformed("truncated dirent header"));
    }

    let mut ino = [0u8; 8];
    ino.copy_from_slice(&buf[..8]);
    let reclen = usize::from(u16::from_ne_bytes([buf[RECLEN_OFFSET], buf[RECLEN_OFFSET + 1]]));
    if reclen <= NAME_OFFSET || reclen > buf.len() {
        return Err(malformed("dirent record length out of bounds"));
    }

    // The name region spans the rest of the record; the name ends at the first NUL.
    let region = &buf[NAME_OFFSET..reclen];
    let name = match region.iter().position(|&b| b == 0) {
        Some(end) => &region[..end],
        None => region,
    };

    let record = Record {
        ino: u64::from_ne_bytes(ino),
        d_type: buf[TYPE_OFFSET],
        name,
    };
    Ok((record, reclen))
}

fn malformed(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
