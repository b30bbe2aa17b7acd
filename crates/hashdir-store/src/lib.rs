//! Filesystem collaborators for the hashdir object index.
//!
//! The index never touches the filesystem directly. It consumes two narrow
//! interfaces, combined as [`Backend`]:
//!
//! - [`DirectoryOps`] -- create/remove/list directories, create/link/rename/
//!   unlink files, and fsync a directory
//! - [`AttributeStore`] -- per-path byte attributes (extended attributes)
//!
//! # Backends
//!
//! - [`InMemoryBackend`] -- inode-aware model for tests and embedding
//! - [`DiskBackend`] -- host directory with Linux extended attributes
//!
//! # Rules
//!
//! 1. Paths are relative to the backend root.
//! 2. Attributes belong to the inode; hard links share them.
//! 3. `rename` is the only atomic multi-path primitive.
//! 4. Directory listings are name-ordered and resumable by cursor.

pub mod disk;
pub mod error;
pub mod memory;
pub mod traits;

pub use disk::DiskBackend;
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryBackend;
pub use traits::{
    AttributeStore, Backend, DirCursor, DirEntry, DirPage, DirectoryOps, EntryKind, EntryStat,
};
