use std::path::Path;

use crate::error::StoreResult;

/// Kind of a directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// Subset of `stat` the index needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryStat {
    pub kind: EntryKind,
    /// Hard link count of the inode.
    pub nlink: u32,
}

/// A single directory entry returned by [`DirectoryOps::list_dir`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Resumable position in a directory listing.
///
/// Listings are ordered by name; a cursor resumes strictly after the last
/// name returned, so entries removed between pages never shift the rest.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirCursor(Option<String>);

impl DirCursor {
    /// Cursor positioned before the first entry.
    pub fn start() -> Self {
        Self(None)
    }

    /// Cursor positioned after `name`.
    pub fn after(name: impl Into<String>) -> Self {
        Self(Some(name.into()))
    }

    /// The last name already returned, if any.
    pub fn last(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Returns `true` if `name` comes after this cursor.
    pub fn admits(&self, name: &str) -> bool {
        match &self.0 {
            None => true,
            Some(last) => name > last.as_str(),
        }
    }
}

/// One page of a directory listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirPage {
    pub entries: Vec<DirEntry>,
    /// Cursor for the next page, `None` once the directory is exhausted.
    pub next: Option<DirCursor>,
}

/// Directory and file primitives of the underlying filesystem.
///
/// Paths are relative to the backend root; the empty path is the root
/// itself. None of these calls are transactional across paths: the index
/// builds crash safety from their ordering.
pub trait DirectoryOps: Send + Sync {
    /// Create a directory. Fails with `AlreadyExists` if present and
    /// `NotFound` if the parent is missing.
    fn create_dir(&self, path: &Path) -> StoreResult<()>;

    /// Remove an empty directory.
    fn remove_dir(&self, path: &Path) -> StoreResult<()>;

    /// List up to `max` entries (0 = no limit) after `cursor`, by name.
    fn list_dir(&self, path: &Path, cursor: &DirCursor, max: usize) -> StoreResult<DirPage>;

    /// Make the directory's entries durable.
    fn sync_dir(&self, path: &Path) -> StoreResult<()>;

    /// Stat a path without following symlinks. `None` if absent.
    fn stat(&self, path: &Path) -> StoreResult<Option<EntryStat>>;

    /// Create an empty file. Fails with `AlreadyExists` if present.
    fn create_file(&self, path: &Path) -> StoreResult<()>;

    /// Hard link `from` as `to`. Fails with `AlreadyExists` if `to` exists.
    fn link(&self, from: &Path, to: &Path) -> StoreResult<()>;

    /// Atomically rename `from` to `to`, replacing a file at `to`.
    fn rename(&self, from: &Path, to: &Path) -> StoreResult<()>;

    /// Remove a file.
    fn unlink(&self, path: &Path) -> StoreResult<()>;

    /// Returns `true` if `path` exists and is a directory.
    fn dir_exists(&self, path: &Path) -> StoreResult<bool> {
        Ok(matches!(
            self.stat(path)?,
            Some(EntryStat {
                kind: EntryKind::Dir,
                ..
            })
        ))
    }
}

/// Per-path key/value byte attributes (extended attributes).
///
/// Attributes belong to the inode: hard links share them.
pub trait AttributeStore: Send + Sync {
    /// Read an attribute. `Ok(None)` if the path exists without it.
    fn get_attr(&self, path: &Path, name: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Set (create or replace) an attribute.
    fn set_attr(&self, path: &Path, name: &str, value: &[u8]) -> StoreResult<()>;

    /// Remove an attribute. Returns `true` if it was present.
    fn remove_attr(&self, path: &Path, name: &str) -> StoreResult<bool>;

    /// Names of all attributes on `path`, sorted.
    fn list_attrs(&self, path: &Path) -> StoreResult<Vec<String>>;
}

/// Everything an index needs from the filesystem.
pub trait Backend: DirectoryOps + AttributeStore {}

impl<T: DirectoryOps + AttributeStore + ?Sized> Backend for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_admits_names_after_last() {
        let start = DirCursor::start();
        assert!(start.admits("a"));
        assert!(start.last().is_none());

        let cursor = DirCursor::after("m");
        assert!(!cursor.admits("a"));
        assert!(!cursor.admits("m"));
        assert!(cursor.admits("n"));
        assert_eq!(cursor.last(), Some("m"));
    }
}
