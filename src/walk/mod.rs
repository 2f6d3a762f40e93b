//! Recursive directory traversal.
//!
//! [`Walker`] enumerates a tree depth-first (pre-order) with the fastest
//! directory listing primitive the platform offers and reports every node to a
//! [`Visitor`]. Children whose name starts with `.` are never reported and never
//! descended into; the walk root itself is always visited.
//!
//! Control flow is driven by the [`Directive`] returned from
//! [`Visitor::visit`] and [`Visitor::enter`]. Errors raised below the root are
//! routed through [`Visitor::error`], which decides whether the remaining
//! siblings are still walked.

mod sys;

use std::error::Error as StdError;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

// ============================================================================
// Entries and errors
// ============================================================================

/// Size of the scratch buffer allocated when the caller does not supply one.
pub const DEFAULT_SCRATCH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    #[error("cannot iterate non-directory {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("error iterating {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Visitor(Box<dyn StdError + Send + Sync>),
}

impl WalkError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        WalkError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Wraps an error raised by a visitor callback so it travels through the walk.
    pub fn visitor(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        WalkError::Visitor(err.into())
    }

    /// True when the walked path is missing, unreadable, or not a directory.
    pub fn is_not_found(&self) -> bool {
        match self {
            WalkError::NotADirectory(_) => true,
            WalkError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ),
            WalkError::Visitor(_) => false,
        }
    }
}

/// Type of a filesystem node as reported by the directory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl EntryKind {
    pub fn from_file_type(file_type: fs::FileType) -> Self {
        if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_block_device() {
            EntryKind::BlockDevice
        } else if file_type.is_char_device() {
            EntryKind::CharDevice
        } else if file_type.is_fifo() {
            EntryKind::Fifo
        } else if file_type.is_socket() {
            EntryKind::Socket
        } else {
            EntryKind::Regular
        }
    }
}

/// A single directory entry, owned by the traversal frame that listed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    name: OsString,
    kind: EntryKind,
    /// Type of the node a symlink points at, filled in before the entry is visited.
    target: Option<EntryKind>,
}

impl DirEntry {
    pub(crate) fn new(name: impl Into<OsString>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
            target: None,
        }
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// For symlinks, the type of the node the link resolves to.
    pub fn target_kind(&self) -> Option<EntryKind> {
        self.target
    }

    /// True for directories and for symlinks that resolve to a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory || self.target == Some(EntryKind::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }

    pub fn is_regular(&self) -> bool {
        self.kind == EntryKind::Regular
    }

    pub fn is_hidden(&self) -> bool {
        self.name.as_encoded_bytes().first() == Some(&b'.')
    }
}

// ============================================================================
// Visitor
// ============================================================================

/// What the walker should do after a visitor callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Keep going.
    Continue,
    /// Do not descend into this node (no effect for non-directories).
    SkipSubtree,
    /// Stop the whole walk. Open directories still receive `leave` with `Ok(())`.
    Abort,
}

/// Callbacks invoked by [`Walker::walk`]. Every method has a pass-through default.
pub trait Visitor {
    /// Called for every node, the root included, before it is entered.
    fn visit(&mut self, _path: &Path, _entry: &DirEntry) -> Result<Directive, WalkError> {
        Ok(Directive::Continue)
    }

    /// Called before listing a directory.
    fn enter(&mut self, _path: &Path, _entry: &DirEntry) -> Result<Directive, WalkError> {
        Ok(Directive::Continue)
    }

    /// Called after a directory entered with [`Directive::Continue`] has been
    /// processed, with the outcome of its children.
    fn leave(
        &mut self,
        _path: &Path,
        _entry: &DirEntry,
        result: Result<(), WalkError>,
    ) -> Result<(), WalkError> {
        result
    }

    /// Called for failures below the root. `Ok(())` swallows the error and the
    /// walk continues with the next sibling; `Err` aborts the current directory.
    fn error(&mut self, _path: &Path, _entry: &DirEntry, err: WalkError) -> Result<(), WalkError> {
        Err(err)
    }
}

// ============================================================================
// Walker
// ============================================================================

enum Flow {
    Continue,
    Abort,
}

/// Depth-first directory walker owning a reusable scratch buffer.
#[derive(Debug)]
pub struct Walker {
    buf: Vec<u8>,
}

impl Default for Walker {
    fn default() -> Self {
        Self::new()
    }
}

impl Walker {
    pub fn new() -> Self {
        Self::with_buffer(Vec::new())
    }

    /// Uses `buf` as the enumeration scratch buffer. Buffers smaller than one
    /// page are replaced by a [`DEFAULT_SCRATCH_BUFFER_SIZE`] allocation.
    pub fn with_buffer(buf: Vec<u8>) -> Self {
        let buf = if buf.len() < sys::page_size() {
            vec![0; DEFAULT_SCRATCH_BUFFER_SIZE]
        } else {
            buf
        };
        Self { buf }
    }

    /// Returns the scratch buffer so it can back another walker.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buf
    }

    /// Walks the tree rooted at `root`.
    ///
    /// Fails with [`WalkError::NotADirectory`] when `root` is not a directory
    /// and with [`WalkError::Io`] when it cannot be stat'ed.
    pub fn walk<V>(&mut self, root: impl AsRef<Path>, visitor: &mut V) -> Result<(), WalkError>
    where
        V: Visitor + ?Sized,
    {
        let root: PathBuf = root.as_ref().components().collect();

        let metadata = fs::metadata(&root).map_err(|err| WalkError::io(&root, err))?;
        if !metadata.is_dir() {
            return Err(WalkError::NotADirectory(root));
        }

        let name = root
            .file_name()
            .unwrap_or(root.as_os_str())
            .to_os_string();
        let mut entry = DirEntry::new(name, EntryKind::Directory);

        self.walk_entry(&root, &mut entry, visitor).map(|_| ())
    }

    fn walk_entry<V>(
        &mut self,
        path: &Path,
        entry: &mut DirEntry,
        visitor: &mut V,
    ) -> Result<Flow, WalkError>
    where
        V: Visitor + ?Sized,
    {
        // Resolve what a symlink points at before anyone looks at it
        if entry.is_symlink() && entry.target.is_none() {
            let metadata = fs::metadata(path).map_err(|err| WalkError::io(path, err))?;
            entry.target = Some(EntryKind::from_file_type(metadata.file_type()));
        }

        match visitor.visit(path, entry)? {
            Directive::Continue => {}
            Directive::SkipSubtree => return Ok(Flow::Continue),
            Directive::Abort => return Ok(Flow::Abort),
        }

        // Files end here
        if !entry.is_dir() {
            return Ok(Flow::Continue);
        }

        match visitor.enter(path, entry)? {
            Directive::Continue => {}
            Directive::SkipSubtree => return Ok(Flow::Continue),
            Directive::Abort => return Ok(Flow::Abort),
        }

        // List the directory, then walk children in listing order
        let mut aborted = false;
        let result = match sys::read_dir(path, &mut self.buf) {
            Err(err) => visitor.error(path, entry, WalkError::io(path, err)),
            Ok(children) => {
                let mut result = Ok(());
                for mut child in children {
                    if child.is_hidden() {
                        continue;
                    }

                    let child_path = path.join(child.name());
                    match self.walk_entry(&child_path, &mut child, visitor) {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Abort) => {
                            aborted = true;
                            break;
                        }
                        Err(err) => {
                            // Swallowed errors move on to the next sibling
                            if let Err(err) = visitor.error(&child_path, &child, err) {
                                result = Err(err);
                                break;
                            }
                        }
                    }
                }
                result
            }
        };

        // Leave sees the outcome of the children, aborted walks included
        visitor.leave(path, entry, result)?;

        Ok(if aborted { Flow::Abort } else { Flow::Continue })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn sample_tree() -> TempDir {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "a/b/file.txt");
        touch(temp.path(), "a/other.txt");
        touch(temp.path(), "top.txt");
        touch(temp.path(), ".hidden/inner.txt");
        touch(temp.path(), "a/.secret");
        fs::create_dir_all(temp.path().join("empty")).unwrap();
        temp
    }

    /// Records every callback as a line of text.
    #[derive(Default)]
    struct Recorder {
        root: PathBuf,
        events: Vec<String>,
        swallow_errors: bool,
        errors: Vec<PathBuf>,
    }

    impl Recorder {
        fn rel(&self, path: &Path) -> String {
            path.strip_prefix(&self.root)
                .unwrap()
                .to_string_lossy()
                .into_owned()
        }

        fn visited(&self) -> BTreeSet<String> {
            self.events
                .iter()
                .filter_map(|e| e.strip_prefix("visit "))
                .map(str::to_string)
                .collect()
        }
    }

    impl Visitor for Recorder {
        fn visit(&mut self, path: &Path, _entry: &DirEntry) -> Result<Directive, WalkError> {
            let line = format!("visit {}", self.rel(path));
            self.events.push(line);
            Ok(Directive::Continue)
        }

        fn enter(&mut self, path: &Path, _entry: &DirEntry) -> Result<Directive, WalkError> {
            let line = format!("enter {}", self.rel(path));
            self.events.push(line);
            Ok(Directive::Continue)
        }

        fn leave(
            &mut self,
            path: &Path,
            _entry: &DirEntry,
            result: Result<(), WalkError>,
        ) -> Result<(), WalkError> {
            let line = format!("leave {}", self.rel(path));
            self.events.push(line);
            result
        }

        fn error(&mut self, path: &Path, _entry: &DirEntry, err: WalkError) -> Result<(), WalkError> {
            self.errors.push(path.to_path_buf());
            if self.swallow_errors {
                Ok(())
            } else {
                Err(err)
            }
        }
    }

    #[test]
    fn test_walk_matches_walkdir_without_hidden() {
        let temp = sample_tree();
        let mut recorder = Recorder {
            root: temp.path().to_path_buf(),
            ..Default::default()
        };

        Walker::new().walk(temp.path(), &mut recorder).unwrap();

        let expected: BTreeSet<String> = walkdir::WalkDir::new(temp.path())
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
            .map(|e| e.unwrap())
            .map(|e| recorder.rel(e.path()))
            .collect();

        assert_eq!(recorder.visited(), expected);
        assert!(!recorder.visited().iter().any(|p| p.contains(".hidden")));
        assert!(!recorder.visited().iter().any(|p| p.contains(".secret")));
    }

    #[test]
    fn test_walk_is_preorder_with_balanced_enter_leave() {
        let temp = sample_tree();
        let mut recorder = Recorder {
            root: temp.path().to_path_buf(),
            ..Default::default()
        };

        Walker::new().walk(temp.path(), &mut recorder).unwrap();

        assert_eq!(recorder.events.first().unwrap(), "visit ");
        assert_eq!(recorder.events[1], "enter ");
        assert_eq!(recorder.events.last().unwrap(), "leave ");

        // Every file below a/b is reported between entering and leaving a/b
        let enter = recorder.events.iter().position(|e| e == "enter a/b").unwrap();
        let file = recorder.events.iter().position(|e| e == "visit a/b/file.txt").unwrap();
        let leave = recorder.events.iter().position(|e| e == "leave a/b").unwrap();
        assert!(enter < file && file < leave);

        let enters = recorder.events.iter().filter(|e| e.starts_with("enter")).count();
        let leaves = recorder.events.iter().filter(|e| e.starts_with("leave")).count();
        assert_eq!(enters, leaves);
    }

    #[test]
    fn test_root_named_with_dot_is_still_walked() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), ".root/visible.txt");
        let root = temp.path().join(".root");
        let mut recorder = Recorder {
            root: root.clone(),
            ..Default::default()
        };

        Walker::new().walk(&root, &mut recorder).unwrap();

        assert!(recorder.visited().contains("visible.txt"));
    }

    #[test]
    fn test_walk_rejects_non_directory_root() {
        let temp = sample_tree();
        let err = Walker::new()
            .walk(temp.path().join("top.txt"), &mut Recorder::default())
            .unwrap_err();

        assert!(matches!(err, WalkError::NotADirectory(_)));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_walk_missing_root_is_io_error() {
        let temp = TempDir::new().unwrap();
        let err = Walker::new()
            .walk(temp.path().join("missing"), &mut Recorder::default())
            .unwrap_err();

        match &err {
            WalkError::Io { source, .. } => assert_eq!(source.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_not_found());
    }

    struct SkipDir(&'static str, Vec<String>);

    impl Visitor for SkipDir {
        fn visit(&mut self, _path: &Path, entry: &DirEntry) -> Result<Directive, WalkError> {
            self.1.push(entry.name().to_string_lossy().into_owned());
            Ok(Directive::Continue)
        }

        fn enter(&mut self, _path: &Path, entry: &DirEntry) -> Result<Directive, WalkError> {
            if entry.name() == self.0 {
                Ok(Directive::SkipSubtree)
            } else {
                Ok(Directive::Continue)
            }
        }
    }

    #[test]
    fn test_skip_subtree_from_enter() {
        let temp = sample_tree();
        let mut visitor = SkipDir("b", Vec::new());

        Walker::new().walk(temp.path(), &mut visitor).unwrap();

        assert!(visitor.1.contains(&"b".to_string()));
        assert!(!visitor.1.contains(&"file.txt".to_string()));
        assert!(visitor.1.contains(&"other.txt".to_string()));
    }

    struct AbortAfter {
        limit: usize,
        visits: usize,
        leaves: Vec<bool>,
    }

    impl Visitor for AbortAfter {
        fn visit(&mut self, _path: &Path, _entry: &DirEntry) -> Result<Directive, WalkError> {
            self.visits += 1;
            if self.visits >= self.limit {
                Ok(Directive::Abort)
            } else {
                Ok(Directive::Continue)
            }
        }

        fn leave(
            &mut self,
            _path: &Path,
            _entry: &DirEntry,
            result: Result<(), WalkError>,
        ) -> Result<(), WalkError> {
            self.leaves.push(result.is_ok());
            result
        }
    }

    #[test]
    fn test_abort_stops_walk_cleanly() {
        let temp = TempDir::new().unwrap();
        for i in 0..20 {
            touch(temp.path(), &format!("f{i}"));
        }
        let mut visitor = AbortAfter {
            limit: 3,
            visits: 0,
            leaves: Vec::new(),
        };

        Walker::new().walk(temp.path(), &mut visitor).unwrap();

        assert_eq!(visitor.visits, 3);
        assert_eq!(visitor.leaves, vec![true]);
    }

    #[test]
    fn test_symlink_to_directory_is_resolved_and_descended() {
        let temp = sample_tree();
        symlink(temp.path().join("a/b"), temp.path().join("link")).unwrap();

        struct Kinds(Vec<(String, bool, bool)>);
        impl Visitor for Kinds {
            fn visit(&mut self, path: &Path, entry: &DirEntry) -> Result<Directive, WalkError> {
                self.0.push((
                    path.to_string_lossy().into_owned(),
                    entry.is_dir(),
                    entry.is_symlink(),
                ));
                Ok(Directive::Continue)
            }
        }

        let mut kinds = Kinds(Vec::new());
        Walker::new().walk(temp.path(), &mut kinds).unwrap();

        let link = kinds.0.iter().find(|(p, _, _)| p.ends_with("/link")).unwrap();
        assert!(link.1 && link.2);
        assert!(kinds.0.iter().any(|(p, _, _)| p.ends_with("/link/file.txt")));
    }

    #[test]
    fn test_broken_symlink_routes_through_error_handler() {
        let temp = sample_tree();
        symlink(temp.path().join("nowhere"), temp.path().join("a/broken")).unwrap();

        let mut strict = Recorder {
            root: temp.path().to_path_buf(),
            ..Default::default()
        };
        let err = Walker::new().walk(temp.path(), &mut strict).unwrap_err();
        assert!(matches!(err, WalkError::Io { .. }));
        assert!(strict.errors.iter().any(|p| p.ends_with("a/broken")));

        let mut lenient = Recorder {
            root: temp.path().to_path_buf(),
            swallow_errors: true,
            ..Default::default()
        };
        Walker::new().walk(temp.path(), &mut lenient).unwrap();
        assert!(lenient.visited().contains("a/other.txt"));
        assert!(lenient.visited().contains("a/b/file.txt"));
        assert!(!lenient.visited().contains("a/broken"));
    }

    #[test]
    fn test_scratch_buffer_is_reused() {
        let temp = sample_tree();
        let mut walker = Walker::with_buffer(vec![0; 128 * 1024]);
        let mut recorder = Recorder {
            root: temp.path().to_path_buf(),
            ..Default::default()
        };
        walker.walk(temp.path(), &mut recorder).unwrap();
        assert_eq!(walker.into_buffer().len(), 128 * 1024);

        let small = Walker::with_buffer(vec![0; 16]);
        assert_eq!(small.into_buffer().len(), DEFAULT_SCRATCH_BUFFER_SIZE);
    }
}
