//! Reversible mapping between object identities and filenames.
//!
//! # Direct names
//!
//! Fields are joined with `_`:
//!
//! ```text
//! key _ locator _ snap _ HASH _ namespace _ pool [ _ generation _ shard ]
//! ```
//!
//! `HASH` is eight uppercase hex digits; `snap` is `head`, `snapdir` or
//! lowercase hex; `pool` is `none` or lowercase hex. The generation/shard
//! pair is present only when either is set. Inside key, locator and
//! namespace, `\` `/` `_` and NUL are escaped as `\\` `\s` `\u` `\n`; a
//! key starting with `DIR` starts with `\d` instead and one starting with
//! `.` starts with `\.`, so no object name can pass for a subdirectory or
//! a hidden entry.
//!
//! # Hashed names
//!
//! When the direct name would not fit in [`FILENAME_SHORT_LEN`] bytes:
//!
//! ```text
//! prefix-of-direct-name _ <40 hex digest> _ <index> _ long
//! ```
//!
//! The digest covers the canonical serialization of the identity. The name
//! cannot be inverted; the full direct name is stored in an attribute and
//! checked by regenerating the candidate from it.

use std::sync::Arc;

use hashdir_crypto::{Blake3NameDigest, NameDigest, NAME_DIGEST_HEX_LEN};
use hashdir_types::{ObjectIdentity, Snap, NO_GENERATION, NO_POOL};

use crate::config::BASE_INDEX_VERSION;
use crate::error::{IndexError, IndexResult};

/// Longest filename the index produces.
pub const FILENAME_SHORT_LEN: usize = 255;
/// Longest direct encoding accepted at all.
pub const FILENAME_MAX_LEN: usize = 4096;
/// Marker ending every hashed filename.
pub const FILENAME_COOKIE: &str = "long";
/// Bytes reserved in a hashed name for separators and the index.
pub const FILENAME_EXTRA: usize = 4;
/// Bytes of the direct name kept at the front of a hashed name.
pub const FILENAME_PREFIX_LEN: usize =
    FILENAME_SHORT_LEN - NAME_DIGEST_HEX_LEN - FILENAME_COOKIE.len() - FILENAME_EXTRA;
/// Prefix of every index subdirectory.
pub const SUBDIR_PREFIX: &str = "DIR_";
/// Attribute holding the direct name of a hashed file.
pub const LFN_ATTR: &str = "user.hashdir.lfn";
/// Prefix of per-directory hash metadata attributes.
pub const PHASH_ATTR_PREFIX: &str = "user.hashdir.phash.";

const HASHED_SUFFIX: &str = "_long";

/// Shape of a filename.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameForm {
    Direct,
    Hashed { index: u32 },
}

/// A filename derived from an identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MangledName {
    pub name: String,
    pub form: NameForm,
}

impl MangledName {
    pub fn is_hashed(&self) -> bool {
        matches!(self.form, NameForm::Hashed { .. })
    }
}

/// Classification of an on-disk directory entry name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A direct object name, fully decoded.
    Object(ObjectIdentity),
    /// A hashed object name; the identity lives in the attribute.
    Hashed { index: u32 },
    /// An index subdirectory with its unmangled component.
    Subdir(String),
    /// Anything else: internal or foreign entries.
    NotAnObject,
}

/// Encoder/decoder for object filenames and subdirectory components.
#[derive(Clone)]
pub struct NameCodec {
    digest: Arc<dyn NameDigest>,
    lfn_attr: String,
    lfn_alt_attr: Option<String>,
}

impl NameCodec {
    /// Codec for format `version` using the default BLAKE3 digest.
    pub fn new(version: u32) -> Self {
        Self::with_digest(version, Arc::new(Blake3NameDigest::default()))
    }

    /// Codec for format `version` using a caller-supplied digest.
    pub fn with_digest(version: u32, digest: Arc<dyn NameDigest>) -> Self {
        let (lfn_attr, lfn_alt_attr) = if version == BASE_INDEX_VERSION {
            (LFN_ATTR.to_string(), None)
        } else {
            (
                format!("{LFN_ATTR}{version}"),
                Some(format!("{LFN_ATTR}{version}-alt")),
            )
        };
        Self {
            digest,
            lfn_attr,
            lfn_alt_attr,
        }
    }

    /// Attribute holding the direct name of hashed files.
    pub fn lfn_attr(&self) -> &str {
        &self.lfn_attr
    }

    /// Alternate attribute used when the primary one names another
    /// identity. Absent for the base format.
    pub fn lfn_alt_attr(&self) -> Option<&str> {
        self.lfn_alt_attr.as_deref()
    }

    // ---------------------------------------------------------------
    // Encoding
    // ---------------------------------------------------------------

    /// Full reversible encoding of `oid`, whatever its length.
    pub fn direct_name(&self, oid: &ObjectIdentity) -> String {
        let mut out = String::with_capacity(oid.key.len() + oid.namespace.len() + 48);
        let key = oid.key.as_str();
        if let Some(rest) = key.strip_prefix("DIR") {
            out.push_str("\\d");
            append_escaped(rest, &mut out);
        } else if let Some(rest) = key.strip_prefix('.') {
            out.push_str("\\.");
            append_escaped(rest, &mut out);
        } else {
            append_escaped(key, &mut out);
        }
        out.push('_');
        append_escaped(&oid.locator, &mut out);
        out.push('_');
        out.push_str(&oid.snap.to_string());
        out.push_str(&format!("_{:08X}_", oid.hash));
        append_escaped(&oid.namespace, &mut out);
        out.push('_');
        if oid.pool == NO_POOL {
            out.push_str("none");
        } else {
            out.push_str(&format!("{:x}", oid.pool as u64));
        }
        if oid.has_extended_fields() {
            let shard = oid.shard.map(u32::from).unwrap_or(u32::MAX);
            out.push_str(&format!("_{:x}_{:x}", oid.generation, shard));
        }
        out
    }

    /// Returns `true` if a direct name is too long to be used as-is.
    pub fn must_hash(direct: &str) -> bool {
        direct.len() >= FILENAME_SHORT_LEN
    }

    /// Preferred filename for `oid`: the direct name if it fits, otherwise
    /// hashed candidate 0.
    pub fn encode(&self, oid: &ObjectIdentity) -> IndexResult<MangledName> {
        let direct = self.checked_direct_name(oid)?;
        if Self::must_hash(&direct) {
            self.candidate_for(oid, &direct, 0)
        } else {
            Ok(MangledName {
                name: direct,
                form: NameForm::Direct,
            })
        }
    }

    /// The `index`-th hashed candidate for `oid`. Identities whose direct
    /// name fits get their direct name regardless of `index`.
    pub fn generate_candidate(&self, oid: &ObjectIdentity, index: u32) -> IndexResult<MangledName> {
        let direct = self.checked_direct_name(oid)?;
        if !Self::must_hash(&direct) {
            return Ok(MangledName {
                name: direct,
                form: NameForm::Direct,
            });
        }
        self.candidate_for(oid, &direct, index)
    }

    /// Direct name, rejecting encodings past [`FILENAME_MAX_LEN`].
    pub fn checked_direct_name(&self, oid: &ObjectIdentity) -> IndexResult<String> {
        let direct = self.direct_name(oid);
        if direct.len() > FILENAME_MAX_LEN {
            return Err(IndexError::NameTooLong {
                len: direct.len(),
                max: FILENAME_MAX_LEN,
            });
        }
        Ok(direct)
    }

    pub(crate) fn candidate_for(
        &self,
        oid: &ObjectIdentity,
        direct: &str,
        index: u32,
    ) -> IndexResult<MangledName> {
        let canonical =
            bincode::serialize(oid).map_err(|e| IndexError::Serialization(e.to_string()))?;
        let digest = self.digest.digest_hex(&canonical);
        let suffix = format!("_{digest}_{index}{HASHED_SUFFIX}");

        let mut ofs = floor_char_boundary(direct, FILENAME_PREFIX_LEN);
        while ofs > 0 && ofs + suffix.len() > FILENAME_SHORT_LEN {
            ofs = floor_char_boundary(direct, ofs - 1);
        }
        let mut name = String::with_capacity(ofs + suffix.len());
        name.push_str(&direct[..ofs]);
        name.push_str(&suffix);
        Ok(MangledName {
            name,
            form: NameForm::Hashed { index },
        })
    }

    // ---------------------------------------------------------------
    // Decoding
    // ---------------------------------------------------------------

    /// Classify a directory entry name.
    pub fn try_decode(&self, filename: &str) -> Decoded {
        if filename.is_empty() || filename == "." || filename == ".." {
            return Decoded::NotAnObject;
        }
        if let Some(index) = hashed_index(filename) {
            return Decoded::Hashed { index };
        }
        if filename.starts_with(SUBDIR_PREFIX) {
            return match self.demangle_component(filename) {
                Some(component) => Decoded::Subdir(component),
                None => Decoded::NotAnObject,
            };
        }
        match self.parse_direct(filename) {
            Some(oid) => Decoded::Object(oid),
            None => Decoded::NotAnObject,
        }
    }

    /// Invert a direct name. Only the canonical encoding is accepted.
    pub fn parse_direct(&self, name: &str) -> Option<ObjectIdentity> {
        let fields: Vec<&str> = name.split('_').collect();
        if fields.len() != 6 && fields.len() != 8 {
            return None;
        }

        let key = if let Some(rest) = fields[0].strip_prefix("\\d") {
            format!("DIR{}", unescape(rest)?)
        } else if let Some(rest) = fields[0].strip_prefix("\\.") {
            format!(".{}", unescape(rest)?)
        } else {
            unescape(fields[0])?
        };
        let locator = unescape(fields[1])?;
        let snap = match fields[2] {
            "head" => Snap::Head,
            "snapdir" => Snap::SnapDir,
            other => Snap::Id(u64::from_str_radix(other, 16).ok()?),
        };
        if fields[3].len() != 8 {
            return None;
        }
        let hash = u32::from_str_radix(fields[3], 16).ok()?;
        let namespace = unescape(fields[4])?;
        let pool = match fields[5] {
            "none" => NO_POOL,
            other => u64::from_str_radix(other, 16).ok()? as i64,
        };

        let mut oid = ObjectIdentity {
            hash,
            pool,
            namespace,
            key,
            locator,
            snap,
            shard: None,
            generation: NO_GENERATION,
        };
        if fields.len() == 8 {
            oid.generation = u64::from_str_radix(fields[6], 16).ok()?;
            let shard = u32::from_str_radix(fields[7], 16).ok()?;
            oid.shard = if shard == u32::MAX {
                None
            } else {
                Some(u8::try_from(shard).ok()?)
            };
        }

        // Reject spellings that decode but are not what we would write
        // (case, leading zeros, redundant generation/shard fields).
        if self.direct_name(&oid) != name {
            return None;
        }
        Some(oid)
    }

    /// Check a hashed filename against the direct name stored in its
    /// attribute. Returns the identity if the attribute could have
    /// produced this filename.
    pub fn verify_hashed(&self, filename: &str, stored: &[u8]) -> Option<ObjectIdentity> {
        let index = hashed_index(filename)?;
        let direct = std::str::from_utf8(stored).ok()?;
        if !Self::must_hash(direct) {
            return None;
        }
        let oid = self.parse_direct(direct)?;
        let candidate = self.candidate_for(&oid, direct, index).ok()?;
        (candidate.name == filename).then_some(oid)
    }

    // ---------------------------------------------------------------
    // Subdirectories
    // ---------------------------------------------------------------

    /// On-disk name of a subdirectory component.
    pub fn mangle_component(&self, component: &str) -> String {
        let mut out = String::with_capacity(SUBDIR_PREFIX.len() + component.len());
        out.push_str(SUBDIR_PREFIX);
        append_escaped(component, &mut out);
        out
    }

    /// Inverse of [`NameCodec::mangle_component`].
    pub fn demangle_component(&self, name: &str) -> Option<String> {
        let rest = name.strip_prefix(SUBDIR_PREFIX)?;
        if rest.is_empty() {
            return None;
        }
        unescape(rest)
    }
}

impl std::fmt::Debug for NameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameCodec")
            .field("lfn_attr", &self.lfn_attr)
            .field("lfn_alt_attr", &self.lfn_alt_attr)
            .finish()
    }
}

/// Disambiguation index of a hashed filename, `None` if not hashed.
pub fn hashed_index(filename: &str) -> Option<u32> {
    if filename.len() > FILENAME_SHORT_LEN {
        return None;
    }
    let body = filename.strip_suffix(HASHED_SUFFIX)?;
    let (rest, index) = body.rsplit_once('_')?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (_, digest) = rest.rsplit_once('_')?;
    if digest.len() != NAME_DIGEST_HEX_LEN || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    index.parse().ok()
}

fn append_escaped(input: &str, out: &mut String) {
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\s"),
            '_' => out.push_str("\\u"),
            '\0' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
}

fn unescape(input: &str) -> Option<String> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            's' => out.push('/'),
            'u' => out.push('_'),
            'n' => out.push('\0'),
            _ => return None,
        }
    }
    Some(out)
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CURRENT_INDEX_VERSION;
    use proptest::prelude::*;

    fn codec() -> NameCodec {
        NameCodec::new(CURRENT_INDEX_VERSION)
    }

    fn long_oid(suffix: &str) -> ObjectIdentity {
        ObjectIdentity::new(2, 0x1234_abcd, format!("{}{suffix}", "x".repeat(300)))
    }

    // -----------------------------------------------------------------------
    // Direct names
    // -----------------------------------------------------------------------

    #[test]
    fn direct_name_layout() {
        let oid = ObjectIdentity::new(3, 0xA, "obj");
        assert_eq!(codec().direct_name(&oid), "obj__head_0000000A__3");
    }

    #[test]
    fn direct_name_with_all_fields() {
        let oid = ObjectIdentity::new(NO_POOL, 0xdeadbeef, "a_b/c")
            .with_namespace("ns")
            .with_locator("loc")
            .with_snap(Snap::Id(0x1f))
            .with_generation(5)
            .with_shard(2);
        let name = codec().direct_name(&oid);
        assert_eq!(name, "a\\ub\\sc_loc_1f_DEADBEEF_ns_none_5_2");
        assert_eq!(codec().parse_direct(&name), Some(oid));
    }

    #[test]
    fn shard_without_generation_roundtrips() {
        let oid = ObjectIdentity::new(1, 1, "k").with_shard(0);
        let name = codec().direct_name(&oid);
        assert!(name.ends_with(&format!("_{:x}_0", NO_GENERATION)));
        assert_eq!(codec().parse_direct(&name), Some(oid));
    }

    #[test]
    fn negative_pool_roundtrips() {
        let oid = ObjectIdentity::new(-7, 1, "k");
        let name = codec().direct_name(&oid);
        assert_eq!(codec().parse_direct(&name), Some(oid));
    }

    #[test]
    fn reserved_key_prefixes_are_escaped() {
        let c = codec();
        for key in ["DIR", "DIR_1", "DIRECT", ".hidden", ".", ".."] {
            let oid = ObjectIdentity::new(1, 1, key);
            let name = c.direct_name(&oid);
            assert!(!name.starts_with(SUBDIR_PREFIX), "{name}");
            assert!(!name.starts_with('.'), "{name}");
            assert_eq!(c.try_decode(&name), Decoded::Object(oid));
        }
    }

    #[test]
    fn non_canonical_spellings_rejected() {
        let c = codec();
        assert!(c.parse_direct("obj__head_0000000a__3").is_none());
        assert!(c.parse_direct("obj__head_A__3").is_none());
        assert!(c.parse_direct("obj__head_0000000A__03").is_none());
        assert!(c
            .parse_direct(&format!("obj__head_0000000A__3_{:x}_{:x}", NO_GENERATION, u32::MAX))
            .is_none());
        assert!(c.parse_direct("obj__head_0000000A").is_none());
        assert!(c.parse_direct("bad\\qescape__head_0000000A__3").is_none());
    }

    // -----------------------------------------------------------------------
    // Hashed names
    // -----------------------------------------------------------------------

    #[test]
    fn long_names_are_hashed_within_budget() {
        let c = codec();
        let oid = long_oid("");
        let name = c.encode(&oid).unwrap();
        assert_eq!(name.form, NameForm::Hashed { index: 0 });
        assert!(name.name.len() <= FILENAME_SHORT_LEN);
        assert!(name.name.ends_with("_0_long"));
        assert_eq!(c.try_decode(&name.name), Decoded::Hashed { index: 0 });
    }

    #[test]
    fn large_indices_stay_within_budget() {
        let c = codec();
        let oid = long_oid("");
        for index in [9, 10, 999, u32::MAX] {
            let name = c.generate_candidate(&oid, index).unwrap();
            assert!(name.name.len() <= FILENAME_SHORT_LEN);
            assert_eq!(hashed_index(&name.name), Some(index));
        }
    }

    #[test]
    fn prefix_respects_char_boundaries() {
        let c = codec();
        let oid = ObjectIdentity::new(1, 1, "é".repeat(200));
        let name = c.encode(&oid).unwrap();
        assert!(name.is_hashed());
        assert!(name.name.len() <= FILENAME_SHORT_LEN);
    }

    #[test]
    fn candidates_differ_by_index_only() {
        let c = codec();
        let oid = long_oid("");
        let a = c.generate_candidate(&oid, 0).unwrap().name;
        let b = c.generate_candidate(&oid, 1).unwrap().name;
        assert_ne!(a, b);
        assert_eq!(a.trim_end_matches("_0_long"), b.trim_end_matches("_1_long"));
    }

    #[test]
    fn short_identity_ignores_candidate_index() {
        let oid = ObjectIdentity::new(1, 1, "short");
        let name = codec().generate_candidate(&oid, 3).unwrap();
        assert_eq!(name.form, NameForm::Direct);
    }

    #[test]
    fn verify_hashed_checks_attribute() {
        let c = codec();
        let a = long_oid("a");
        let b = long_oid("b");
        let name_a = c.generate_candidate(&a, 2).unwrap().name;
        let stored_a = c.direct_name(&a);
        let stored_b = c.direct_name(&b);
        assert_eq!(c.verify_hashed(&name_a, stored_a.as_bytes()), Some(a));
        assert_eq!(c.verify_hashed(&name_a, stored_b.as_bytes()), None);
        assert_eq!(c.verify_hashed(&name_a, b"garbage"), None);
    }

    #[test]
    fn too_long_identity_rejected() {
        let oid = ObjectIdentity::new(1, 1, "k".repeat(FILENAME_MAX_LEN));
        assert!(matches!(
            codec().encode(&oid),
            Err(IndexError::NameTooLong { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Classification and subdirectories
    // -----------------------------------------------------------------------

    #[test]
    fn subdir_components_roundtrip() {
        let c = codec();
        for component in ["A", "3", "a_b", "x/y", "back\\slash"] {
            let mangled = c.mangle_component(component);
            assert!(mangled.starts_with(SUBDIR_PREFIX));
            assert_eq!(c.try_decode(&mangled), Decoded::Subdir(component.to_string()));
        }
    }

    #[test]
    fn foreign_names_are_not_objects() {
        let c = codec();
        for name in ["", ".", "..", ".lock", "DIR_", "random", "a_b", "x_long"] {
            assert_eq!(c.try_decode(name), Decoded::NotAnObject, "{name:?}");
        }
    }

    #[test]
    fn attribute_names_follow_version() {
        let base = NameCodec::new(BASE_INDEX_VERSION);
        assert_eq!(base.lfn_attr(), LFN_ATTR);
        assert!(base.lfn_alt_attr().is_none());

        let v3 = NameCodec::new(3);
        assert_eq!(v3.lfn_attr(), "user.hashdir.lfn3");
        assert_eq!(v3.lfn_alt_attr(), Some("user.hashdir.lfn3-alt"));
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    fn arb_text() -> impl Strategy<Value = String> {
        proptest::collection::vec(
            prop_oneof![
                Just('_'),
                Just('/'),
                Just('\\'),
                Just('\0'),
                Just('.'),
                Just('é'),
                proptest::char::range('0', 'z'),
            ],
            0..24,
        )
        .prop_map(|chars| chars.into_iter().collect())
    }

    fn arb_identity() -> impl Strategy<Value = ObjectIdentity> {
        (
            any::<u32>(),
            prop_oneof![Just(NO_POOL), any::<i64>()],
            arb_text(),
            arb_text(),
            arb_text(),
            prop_oneof![Just(Snap::Head), Just(Snap::SnapDir), any::<u64>().prop_map(Snap::Id)],
            proptest::option::of(any::<u8>()),
            prop_oneof![Just(NO_GENERATION), 0u64..1000],
            0usize..400,
        )
            .prop_map(|(hash, pool, ns, key, locator, snap, shard, generation, pad)| {
                ObjectIdentity {
                    hash,
                    pool,
                    namespace: ns,
                    key: format!("{key}{}", "k".repeat(pad)),
                    locator,
                    snap,
                    shard,
                    generation,
                }
            })
    }

    proptest! {
        #[test]
        fn encode_then_decode_recovers_identity(oid in arb_identity()) {
            let c = codec();
            let name = c.encode(&oid).unwrap();
            match name.form {
                NameForm::Direct => {
                    prop_assert_eq!(c.try_decode(&name.name), Decoded::Object(oid));
                }
                NameForm::Hashed { index } => {
                    prop_assert_eq!(c.try_decode(&name.name), Decoded::Hashed { index });
                    let stored = c.direct_name(&oid);
                    prop_assert_eq!(c.verify_hashed(&name.name, stored.as_bytes()), Some(oid));
                }
            }
        }
    }
}
