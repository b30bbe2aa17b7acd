//! Foundation types for the hashdir object index.
//!
//! Every other hashdir crate depends on `hashdir-types`.
//!
//! # Key Types
//!
//! - [`ObjectIdentity`] -- Logical key of a stored object (pool, shard, hash,
//!   namespace, key, generation)
//! - [`Snap`] -- Snapshot selector carried by an identity
//! - [`DirPath`] -- Location of a directory inside an index, root first

pub mod error;
pub mod identity;
pub mod path;

pub use error::TypeError;
pub use identity::{low_bits_mask, ObjectIdentity, Snap, NO_GENERATION, NO_POOL};
pub use path::DirPath;
