use std::fmt;

use serde::{Deserialize, Serialize};

/// Pool value meaning "no pool".
pub const NO_POOL: i64 = -1;

/// Generation value meaning "no generation".
pub const NO_GENERATION: u64 = u64::MAX;

/// Snapshot selector of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Snap {
    /// The live (head) version.
    Head,
    /// The per-object snapshot directory.
    SnapDir,
    /// A specific snapshot id.
    Id(u64),
}

impl Default for Snap {
    fn default() -> Self {
        Self::Head
    }
}

impl fmt::Display for Snap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Snap::Head => write!(f, "head"),
            Snap::SnapDir => write!(f, "snapdir"),
            Snap::Id(id) => write!(f, "{id:x}"),
        }
    }
}

/// Logical key of a stored object, independent of where its file lives.
///
/// Two identities are the same object iff every field matches. The
/// filename an identity maps to is derived from it but is never the source
/// of truth: hashed filenames are lossy and must be checked against the
/// identity recorded in the file's attributes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentity {
    /// Placement hash. Split and merge predicates test its low bits.
    pub hash: u32,
    /// Pool the object belongs to, [`NO_POOL`] if unset.
    pub pool: i64,
    /// Namespace within the pool.
    pub namespace: String,
    /// Object name.
    pub key: String,
    /// Optional locator key overriding placement; empty if unset.
    pub locator: String,
    /// Snapshot selector.
    pub snap: Snap,
    /// Erasure-code shard, `None` for replicated objects.
    pub shard: Option<u8>,
    /// Rollback generation, [`NO_GENERATION`] if unset.
    pub generation: u64,
}

impl ObjectIdentity {
    /// Head object `key` in `pool` with placement hash `hash`.
    pub fn new(pool: i64, hash: u32, key: impl Into<String>) -> Self {
        Self {
            hash,
            pool,
            namespace: String::new(),
            key: key.into(),
            locator: String::new(),
            snap: Snap::Head,
            shard: None,
            generation: NO_GENERATION,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = locator.into();
        self
    }

    pub fn with_snap(mut self, snap: Snap) -> Self {
        self.snap = snap;
        self
    }

    pub fn with_shard(mut self, shard: u8) -> Self {
        self.shard = Some(shard);
        self
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Returns `true` if generation or shard must be encoded.
    pub fn has_extended_fields(&self) -> bool {
        self.generation != NO_GENERATION || self.shard.is_some()
    }

    /// Returns `true` if the low `bits` bits of the placement hash equal
    /// those of `matching`.
    pub fn matches(&self, bits: u32, matching: u32) -> bool {
        let mask = low_bits_mask(bits);
        self.hash & mask == matching & mask
    }
}

/// Mask selecting the low `bits` bits of a 32-bit hash.
pub fn low_bits_mask(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:08X}:{}:{}:{}", self.pool, self.hash, self.namespace, self.key, self.snap)?;
        if self.has_extended_fields() {
            write!(f, "@{:x}", self.generation)?;
            if let Some(shard) = self.shard {
                write!(f, "s{shard}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_identity_has_no_extended_fields() {
        let oid = ObjectIdentity::new(3, 0xdead_beef, "obj");
        assert!(!oid.has_extended_fields());
        assert_eq!(oid.snap, Snap::Head);
        assert!(oid.with_shard(2).has_extended_fields());
    }

    #[test]
    fn generation_alone_is_extended() {
        let oid = ObjectIdentity::new(3, 1, "obj").with_generation(7);
        assert!(oid.has_extended_fields());
    }

    #[test]
    fn equality_covers_every_field() {
        let base = ObjectIdentity::new(1, 2, "k");
        assert_ne!(base, base.clone().with_namespace("ns"));
        assert_ne!(base, base.clone().with_locator("loc"));
        assert_ne!(base, base.clone().with_snap(Snap::Id(4)));
        assert_ne!(base, base.clone().with_shard(0));
        assert_ne!(base, base.clone().with_generation(0));
        assert_eq!(base, ObjectIdentity::new(1, 2, "k"));
    }

    #[test]
    fn matches_tests_low_bits() {
        let oid = ObjectIdentity::new(1, 0x0000_00a5, "k");
        assert!(oid.matches(4, 0x5));
        assert!(oid.matches(8, 0xa5));
        assert!(!oid.matches(8, 0x15));
        assert!(oid.matches(0, 0xffff));
        assert!(oid.matches(32, 0xa5));
    }

    #[test]
    fn snap_display() {
        assert_eq!(Snap::Head.to_string(), "head");
        assert_eq!(Snap::SnapDir.to_string(), "snapdir");
        assert_eq!(Snap::Id(255).to_string(), "ff");
    }

    #[test]
    fn serde_roundtrip() {
        let oid = ObjectIdentity::new(9, 42, "name")
            .with_namespace("ns")
            .with_shard(1)
            .with_generation(3);
        let json = serde_json::to_string(&oid).unwrap();
        let parsed: ObjectIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, oid);
    }

    #[test]
    fn bincode_encoding_is_deterministic() {
        let oid = ObjectIdentity::new(9, 42, "name").with_locator("l");
        let a = bincode::serialize(&oid).unwrap();
        let b = bincode::serialize(&oid.clone()).unwrap();
        assert_eq!(a, b);
    }
}
