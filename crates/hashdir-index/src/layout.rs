//! Hash-layout strategies: where an identity lives inside an index and
//! which subtrees a split predicate can move wholesale.

use std::fmt;

use hashdir_types::{low_bits_mask, DirPath, ObjectIdentity};

use crate::error::IndexResult;
use crate::index::Index;

/// Phash attribute recording how many hash bits a directory has consumed.
pub const PHASH_BITS_KEY: &str = "bits";

/// How a split predicate relates to every object under a directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubtreeVerdict {
    /// Every object below matches; the subtree can move as a unit.
    All,
    /// No object below matches; the subtree is skipped.
    None,
    /// Unknown or mixed; objects are tested one by one.
    Mixed,
}

/// Placement policy of an index.
///
/// The engine only relies on `path_for` being a pure function of the
/// identity, so source and destination of a rebalance agree on where an
/// object lives.
pub trait HashLayout: Send + Sync + fmt::Debug {
    /// Directory holding `oid`.
    fn path_for(&self, oid: &ObjectIdentity) -> DirPath;

    /// Split predicate: does `oid` belong to the `(matching, bits)` side?
    fn matches(&self, oid: &ObjectIdentity, bits: u32, matching: u32) -> bool {
        oid.matches(bits, matching)
    }

    /// What the predicate says about everything under `dir`.
    fn subtree_verdict(&self, _dir: &DirPath, bits: u32, _matching: u32) -> SubtreeVerdict {
        if bits == 0 {
            SubtreeVerdict::All
        } else {
            SubtreeVerdict::Mixed
        }
    }

    /// Lay out any fixed structure in a fresh index.
    fn prepare(&self, _index: &Index) -> IndexResult<()> {
        Ok(())
    }

    /// Tear down leftovers of an interrupted operation. Must be idempotent.
    fn cleanup(&self, index: &Index) -> IndexResult<()> {
        let removed = index.prune_empty_subdirs(&DirPath::root())?;
        if removed > 0 {
            tracing::debug!(removed, base = %index.base().display(), "pruned empty directories");
        }
        Ok(())
    }
}

/// Every object in the index root.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlatLayout;

impl HashLayout for FlatLayout {
    fn path_for(&self, _oid: &ObjectIdentity) -> DirPath {
        DirPath::root()
    }
}

/// One directory level per hash nibble, lowest nibble first.
///
/// An object with hash `0x...CBA` and two levels lives in `A/B`. A
/// directory at depth `d` therefore pins the low `4 * d` bits of every
/// object below it.
#[derive(Clone, Copy, Debug)]
pub struct NibbleLayout {
    levels: usize,
}

impl NibbleLayout {
    pub const MAX_LEVELS: usize = 8;

    pub fn new(levels: usize) -> Self {
        Self {
            levels: levels.min(Self::MAX_LEVELS),
        }
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Hash bits pinned by `dir`, or `None` if it is not one of ours.
    fn known_bits(&self, dir: &DirPath) -> Option<(u32, u32)> {
        if dir.depth() > self.levels {
            return None;
        }
        let mut value = 0u32;
        for (i, component) in dir.components().iter().enumerate() {
            if component.len() != 1 {
                return None;
            }
            let nibble = u32::from_str_radix(component, 16).ok()?;
            if component != &format!("{nibble:X}") {
                return None;
            }
            value |= nibble << (4 * i);
        }
        Some((4 * dir.depth() as u32, value))
    }

    fn prepare_dir(&self, index: &Index, dir: &DirPath) -> IndexResult<()> {
        index.create_path(dir)?;
        let bits = (4 * dir.depth()).to_string();
        index.set_dir_attr(dir, PHASH_BITS_KEY, bits.as_bytes())?;
        if dir.depth() < self.levels {
            for nibble in 0..16u32 {
                self.prepare_dir(index, &dir.child(format!("{nibble:X}")))?;
            }
        }
        Ok(())
    }
}

impl HashLayout for NibbleLayout {
    fn path_for(&self, oid: &ObjectIdentity) -> DirPath {
        let mut dir = DirPath::root();
        for level in 0..self.levels {
            dir = dir.child(format!("{:X}", (oid.hash >> (4 * level)) & 0xf));
        }
        dir
    }

    fn subtree_verdict(&self, dir: &DirPath, bits: u32, matching: u32) -> SubtreeVerdict {
        let Some((known, value)) = self.known_bits(dir) else {
            return SubtreeVerdict::Mixed;
        };
        let common = low_bits_mask(known.min(bits));
        if value & common != matching & common {
            SubtreeVerdict::None
        } else if known >= bits {
            SubtreeVerdict::All
        } else {
            SubtreeVerdict::Mixed
        }
    }

    fn prepare(&self, index: &Index) -> IndexResult<()> {
        self.prepare_dir(index, &DirPath::root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(components: &[&str]) -> DirPath {
        if components.is_empty() {
            DirPath::root()
        } else {
            DirPath::from_components(components.iter().copied()).unwrap()
        }
    }

    #[test]
    fn flat_layout_uses_root() {
        let oid = ObjectIdentity::new(1, 0xffff_ffff, "k");
        assert!(FlatLayout.path_for(&oid).is_root());
        assert_eq!(FlatLayout.subtree_verdict(&DirPath::root(), 0, 0), SubtreeVerdict::All);
        assert_eq!(FlatLayout.subtree_verdict(&DirPath::root(), 3, 1), SubtreeVerdict::Mixed);
    }

    #[test]
    fn nibble_path_is_low_nibble_first() {
        let layout = NibbleLayout::new(3);
        let oid = ObjectIdentity::new(1, 0x0000_0cba, "k");
        assert_eq!(layout.path_for(&oid), dir(&["A", "B", "C"]));
    }

    #[test]
    fn nibble_verdicts() {
        let layout = NibbleLayout::new(2);
        // Predicate: low 4 bits == 0x5.
        assert_eq!(layout.subtree_verdict(&dir(&[]), 4, 0x5), SubtreeVerdict::Mixed);
        assert_eq!(layout.subtree_verdict(&dir(&["5"]), 4, 0x5), SubtreeVerdict::All);
        assert_eq!(layout.subtree_verdict(&dir(&["6"]), 4, 0x5), SubtreeVerdict::None);
        // Predicate: low 8 bits == 0x35.
        assert_eq!(layout.subtree_verdict(&dir(&["5"]), 8, 0x35), SubtreeVerdict::Mixed);
        assert_eq!(layout.subtree_verdict(&dir(&["5", "3"]), 8, 0x35), SubtreeVerdict::All);
        assert_eq!(layout.subtree_verdict(&dir(&["5", "4"]), 8, 0x35), SubtreeVerdict::None);
        // Predicate finer than the tree.
        assert_eq!(layout.subtree_verdict(&dir(&["5", "3"]), 12, 0x135), SubtreeVerdict::Mixed);
    }

    #[test]
    fn foreign_directories_are_mixed() {
        let layout = NibbleLayout::new(1);
        assert_eq!(layout.subtree_verdict(&dir(&["zz"]), 4, 0), SubtreeVerdict::Mixed);
        assert_eq!(layout.subtree_verdict(&dir(&["a"]), 4, 0xa), SubtreeVerdict::Mixed);
        assert_eq!(layout.subtree_verdict(&dir(&["A", "B"]), 4, 0xa), SubtreeVerdict::Mixed);
    }

    #[test]
    fn verdict_agrees_with_predicate() {
        let layout = NibbleLayout::new(2);
        for hash in [0x00u32, 0x35, 0x135, 0xff, 0x1234_5635] {
            let oid = ObjectIdentity::new(1, hash, "k");
            let home = layout.path_for(&oid);
            for (bits, matching) in [(4, 0x5), (8, 0x35), (12, 0x135)] {
                match layout.subtree_verdict(&home, bits, matching) {
                    SubtreeVerdict::All => assert!(layout.matches(&oid, bits, matching)),
                    SubtreeVerdict::None => assert!(!layout.matches(&oid, bits, matching)),
                    SubtreeVerdict::Mixed => {}
                }
            }
        }
    }

    #[test]
    fn levels_are_capped() {
        assert_eq!(NibbleLayout::new(100).levels(), NibbleLayout::MAX_LEVELS);
    }
}
