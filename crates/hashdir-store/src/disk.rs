use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::traits::{
    AttributeStore, DirCursor, DirEntry, DirPage, DirectoryOps, EntryKind, EntryStat,
};

/// Filesystem backend rooted at a host directory.
///
/// Directory and file primitives map one-to-one onto POSIX calls
/// (`mkdir`, `rmdir`, `link`, `rename`, `unlink`, `fsync` on a directory
/// handle). Attributes are Linux extended attributes and must use a
/// namespace the filesystem accepts, typically `user.`.
#[derive(Debug)]
pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    /// Open (or create) a backend rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::from_io(e, &root))?;
        Ok(Self { root })
    }

    /// The host directory this backend is rooted at.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full(&self, path: &Path) -> PathBuf {
        if path.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

fn c_path(path: &Path) -> StoreResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| StoreError::InvalidName(path.display().to_string()))
}

fn c_name(name: &str) -> StoreResult<CString> {
    CString::new(name.as_bytes()).map_err(|_| StoreError::InvalidName(name.to_string()))
}

impl DirectoryOps for DiskBackend {
    fn create_dir(&self, path: &Path) -> StoreResult<()> {
        fs::create_dir(self.full(path)).map_err(|e| StoreError::from_io(e, path))
    }

    fn remove_dir(&self, path: &Path) -> StoreResult<()> {
        fs::remove_dir(self.full(path)).map_err(|e| StoreError::from_io(e, path))
    }

    fn list_dir(&self, path: &Path, cursor: &DirCursor, max: usize) -> StoreResult<DirPage> {
        let reader = fs::read_dir(self.full(path)).map_err(|e| StoreError::from_io(e, path))?;
        let mut entries = Vec::new();
        for entry in reader {
            let entry = entry.map_err(|e| StoreError::from_io(e, path))?;
            let Ok(name) = entry.file_name().into_string() else {
                debug!(dir = %path.display(), "skipping non-UTF-8 entry");
                continue;
            };
            if !cursor.admits(&name) {
                continue;
            }
            let file_type = entry.file_type().map_err(|e| StoreError::from_io(e, path))?;
            let kind = if file_type.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            entries.push(DirEntry { name, kind });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let mut next = None;
        if max > 0 && entries.len() > max {
            entries.truncate(max);
            next = entries.last().map(|e| DirCursor::after(e.name.clone()));
        }
        Ok(DirPage { entries, next })
    }

    fn sync_dir(&self, path: &Path) -> StoreResult<()> {
        let dir = File::open(self.full(path)).map_err(|e| StoreError::from_io(e, path))?;
        dir.sync_all().map_err(|e| StoreError::from_io(e, path))
    }

    fn stat(&self, path: &Path) -> StoreResult<Option<EntryStat>> {
        match fs::symlink_metadata(self.full(path)) {
            Ok(meta) => Ok(Some(EntryStat {
                kind: if meta.is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                },
                nlink: meta.nlink() as u32,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::from_io(e, path)),
        }
    }

    fn create_file(&self, path: &Path) -> StoreResult<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.full(path))
            .map(|_| ())
            .map_err(|e| StoreError::from_io(e, path))
    }

    fn link(&self, from: &Path, to: &Path) -> StoreResult<()> {
        fs::hard_link(self.full(from), self.full(to)).map_err(|e| match e.raw_os_error() {
            Some(libc::EEXIST) => StoreError::AlreadyExists(to.to_path_buf()),
            _ => StoreError::from_io(e, from),
        })
    }

    fn rename(&self, from: &Path, to: &Path) -> StoreResult<()> {
        fs::rename(self.full(from), self.full(to)).map_err(|e| match e.raw_os_error() {
            Some(libc::ENOTEMPTY) | Some(libc::EEXIST) => StoreError::NotEmpty(to.to_path_buf()),
            _ => StoreError::from_io(e, from),
        })
    }

    fn unlink(&self, path: &Path) -> StoreResult<()> {
        fs::remove_file(self.full(path)).map_err(|e| StoreError::from_io(e, path))
    }
}

#[cfg(target_os = "linux")]
impl AttributeStore for DiskBackend {
    fn get_attr(&self, path: &Path, name: &str) -> StoreResult<Option<Vec<u8>>> {
        let full = c_path(&self.full(path))?;
        let attr = c_name(name)?;
        loop {
            // SAFETY: both pointers are valid NUL-terminated strings; a null
            // buffer with size 0 only queries the value length.
            let len = unsafe {
                libc::lgetxattr(full.as_ptr(), attr.as_ptr(), std::ptr::null_mut(), 0)
            };
            if len < 0 {
                return match io::Error::last_os_error() {
                    e if e.raw_os_error() == Some(libc::ENODATA) => Ok(None),
                    e => Err(StoreError::from_io(e, path)),
                };
            }
            let mut buf = vec![0u8; len as usize];
            // SAFETY: `buf` is valid for `buf.len()` bytes.
            let read = unsafe {
                libc::lgetxattr(
                    full.as_ptr(),
                    attr.as_ptr(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if read < 0 {
                match io::Error::last_os_error() {
                    // Value grew between the two calls.
                    e if e.raw_os_error() == Some(libc::ERANGE) => continue,
                    e if e.raw_os_error() == Some(libc::ENODATA) => return Ok(None),
                    e => return Err(StoreError::from_io(e, path)),
                }
            }
            buf.truncate(read as usize);
            return Ok(Some(buf));
        }
    }

    fn set_attr(&self, path: &Path, name: &str, value: &[u8]) -> StoreResult<()> {
        let full = c_path(&self.full(path))?;
        let attr = c_name(name)?;
        // SAFETY: `value` is valid for `value.len()` bytes.
        let res = unsafe {
            libc::lsetxattr(
                full.as_ptr(),
                attr.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                0,
            )
        };
        if res < 0 {
            return Err(StoreError::from_io(io::Error::last_os_error(), path));
        }
        Ok(())
    }

    fn remove_attr(&self, path: &Path, name: &str) -> StoreResult<bool> {
        let full = c_path(&self.full(path))?;
        let attr = c_name(name)?;
        // SAFETY: both pointers are valid NUL-terminated strings.
        let res = unsafe { libc::lremovexattr(full.as_ptr(), attr.as_ptr()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENODATA) {
                return Ok(false);
            }
            return Err(StoreError::from_io(err, path));
        }
        Ok(true)
    }

    fn list_attrs(&self, path: &Path) -> StoreResult<Vec<String>> {
        let full = c_path(&self.full(path))?;
        loop {
            // SAFETY: a null buffer with size 0 only queries the list length.
            let len = unsafe { libc::llistxattr(full.as_ptr(), std::ptr::null_mut(), 0) };
            if len < 0 {
                return Err(StoreError::from_io(io::Error::last_os_error(), path));
            }
            let mut buf = vec![0u8; len as usize];
            // SAFETY: `buf` is valid for `buf.len()` bytes.
            let read =
                unsafe { libc::llistxattr(full.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
            if read < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ERANGE) {
                    continue;
                }
                return Err(StoreError::from_io(err, path));
            }
            buf.truncate(read as usize);
            let mut names: Vec<String> = buf
                .split(|b| *b == 0)
                .filter(|s| !s.is_empty())
                .filter_map(|s| std::str::from_utf8(s).ok().map(str::to_string))
                .collect();
            names.sort();
            return Ok(names);
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl AttributeStore for DiskBackend {
    fn get_attr(&self, _path: &Path, _name: &str) -> StoreResult<Option<Vec<u8>>> {
        Err(unsupported())
    }

    fn set_attr(&self, _path: &Path, _name: &str, _value: &[u8]) -> StoreResult<()> {
        Err(unsupported())
    }

    fn remove_attr(&self, _path: &Path, _name: &str) -> StoreResult<bool> {
        Err(unsupported())
    }

    fn list_attrs(&self, _path: &Path) -> StoreResult<Vec<String>> {
        Err(unsupported())
    }
}

#[cfg(not(target_os = "linux"))]
fn unsupported() -> StoreError {
    StoreError::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        "extended attributes are only supported on Linux",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, DiskBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::open(dir.path()).unwrap();
        (dir, backend)
    }

    /// Extended attributes are not available on every temp filesystem.
    fn xattrs_supported(backend: &DiskBackend) -> bool {
        let probe = Path::new(".xattr-probe");
        if backend.create_file(probe).is_err() {
            return false;
        }
        let ok = backend.set_attr(probe, "user.probe", b"1").is_ok();
        let _ = backend.unlink(probe);
        ok
    }

    #[test]
    fn directories_and_listing() {
        let (_dir, fs) = backend();
        fs.create_dir(Path::new("d")).unwrap();
        assert!(fs.create_dir(Path::new("d")).unwrap_err().is_already_exists());
        for name in ["b", "a", "c"] {
            fs.create_file(&Path::new("d").join(name)).unwrap();
        }
        let page = fs.list_dir(Path::new("d"), &DirCursor::start(), 2).unwrap();
        let names: Vec<_> = page.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        let rest = fs
            .list_dir(Path::new("d"), &page.next.unwrap(), 0)
            .unwrap();
        assert_eq!(rest.entries.len(), 1);
        assert!(rest.next.is_none());
        fs.sync_dir(Path::new("d")).unwrap();
        assert!(matches!(
            fs.remove_dir(Path::new("d")).unwrap_err(),
            StoreError::NotEmpty(_)
        ));
    }

    #[test]
    fn link_rename_unlink() {
        let (_dir, fs) = backend();
        fs.create_file(Path::new("f")).unwrap();
        assert!(fs.create_file(Path::new("f")).unwrap_err().is_already_exists());
        fs.link(Path::new("f"), Path::new("g")).unwrap();
        assert_eq!(fs.stat(Path::new("f")).unwrap().unwrap().nlink, 2);
        assert!(fs
            .link(Path::new("f"), Path::new("g"))
            .unwrap_err()
            .is_already_exists());

        fs.rename(Path::new("g"), Path::new("h")).unwrap();
        assert!(fs.stat(Path::new("g")).unwrap().is_none());
        fs.unlink(Path::new("h")).unwrap();
        fs.unlink(Path::new("f")).unwrap();
        assert!(fs.unlink(Path::new("f")).unwrap_err().is_not_found());
    }

    #[test]
    fn stat_missing_is_none() {
        let (_dir, fs) = backend();
        assert!(fs.stat(Path::new("missing")).unwrap().is_none());
        assert!(fs.dir_exists(Path::new("")).unwrap());
    }

    #[test]
    fn attributes_roundtrip_and_follow_links() {
        let (_dir, fs) = backend();
        if !xattrs_supported(&fs) {
            return;
        }
        fs.create_file(Path::new("f")).unwrap();
        assert!(fs.get_attr(Path::new("f"), "user.k").unwrap().is_none());
        fs.set_attr(Path::new("f"), "user.k", b"value").unwrap();
        fs.link(Path::new("f"), Path::new("g")).unwrap();
        assert_eq!(
            fs.get_attr(Path::new("g"), "user.k").unwrap().unwrap(),
            b"value"
        );
        assert!(fs
            .list_attrs(Path::new("g"))
            .unwrap()
            .contains(&"user.k".to_string()));
        assert!(fs.remove_attr(Path::new("g"), "user.k").unwrap());
        assert!(!fs.remove_attr(Path::new("f"), "user.k").unwrap());
    }
}
