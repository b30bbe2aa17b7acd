//! Name digests for the hashdir object index.
//!
//! Hashed filenames embed a fixed-width digest of the object identity. The
//! digest is consumed through the [`NameDigest`] trait so deployments and
//! tests can substitute their own primitive.

pub mod digest;

pub use digest::{Blake3NameDigest, NameDigest, NAME_DIGEST_BYTES, NAME_DIGEST_HEX_LEN};
