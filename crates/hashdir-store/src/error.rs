use std::io;
use std::path::{Path, PathBuf};

/// Errors from directory and attribute operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The path does not exist.
    #[error("not found: {0}")]
    NotFound(PathBuf),

    /// The target path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),

    /// A directory to be removed or replaced still has entries.
    #[error("directory not empty: {0}")]
    NotEmpty(PathBuf),

    /// A path component that must be a directory is not one.
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The path or attribute name cannot be represented by the backend.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Any other I/O error from the underlying storage.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Classify an I/O error raised while operating on `path`.
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOENT) => StoreError::NotFound(path.to_path_buf()),
            Some(libc::EEXIST) => StoreError::AlreadyExists(path.to_path_buf()),
            Some(libc::ENOTEMPTY) => StoreError::NotEmpty(path.to_path_buf()),
            Some(libc::ENOTDIR) => StoreError::NotADirectory(path.to_path_buf()),
            _ => match err.kind() {
                io::ErrorKind::NotFound => StoreError::NotFound(path.to_path_buf()),
                io::ErrorKind::AlreadyExists => StoreError::AlreadyExists(path.to_path_buf()),
                _ => StoreError::Io(err),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_raw_errno() {
        let path = Path::new("a/b");
        let err = StoreError::from_io(io::Error::from_raw_os_error(libc::ENOENT), path);
        assert!(err.is_not_found());
        let err = StoreError::from_io(io::Error::from_raw_os_error(libc::EEXIST), path);
        assert!(err.is_already_exists());
        let err = StoreError::from_io(io::Error::from_raw_os_error(libc::ENOTEMPTY), path);
        assert!(matches!(err, StoreError::NotEmpty(_)));
    }

    #[test]
    fn unknown_errno_stays_io() {
        let err = StoreError::from_io(io::Error::from_raw_os_error(libc::EIO), Path::new("x"));
        assert!(matches!(err, StoreError::Io(_)));
    }
}
