//! Split and merge of index contents by hash bits.
//!
//! Both operations are sequences of the relocation primitives in
//! [`crate::moves`], run under a [`RetryHarness`]. Before starting, the
//! source root is stamped with a [`PendingRebalance`] marker that is
//! cleared only on completion, so a restarted process can tell an
//! interrupted rebalance apart from a finished one and replay it.

use std::path::PathBuf;

use hashdir_store::{AttributeStore, StoreError};
use hashdir_types::DirPath;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{IndexError, IndexResult};
use crate::index::Index;
use crate::layout::SubtreeVerdict;
use crate::retry::RetryHarness;

/// Attribute on the source root marking an unfinished rebalance.
pub const PENDING_ATTR: &str = "user.hashdir.pending";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebalanceOp {
    /// Move objects whose low `bits` hash bits equal those of `matching`.
    Split { matching: u32, bits: u32 },
    /// Move everything.
    Merge,
}

/// Marker left on the source of an unfinished rebalance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRebalance {
    pub op: RebalanceOp,
    /// Base path of the destination index.
    pub dest: PathBuf,
}

/// Work done by one rebalance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RebalanceStats {
    pub objects_moved: usize,
    pub subdirs_moved: usize,
}

/// Moves objects from `src` to `dest`. Both indexes must share one
/// backend and use the same layout.
#[derive(Debug)]
pub struct RebalanceEngine<'a> {
    src: &'a Index,
    dest: &'a Index,
}

impl<'a> RebalanceEngine<'a> {
    pub fn new(src: &'a Index, dest: &'a Index) -> IndexResult<Self> {
        src.check_backend(dest)?;
        if src.base() == dest.base() {
            return Err(IndexError::InvalidOperation(format!(
                "source and destination are both {}",
                src.base().display()
            )));
        }
        Ok(Self { src, dest })
    }

    /// Move every object matching `(matching, bits)` to the destination.
    pub fn split(&self, matching: u32, bits: u32) -> IndexResult<RebalanceStats> {
        self.run(RebalanceOp::Split { matching, bits })
    }

    /// Move every object to the destination.
    pub fn merge(&self) -> IndexResult<RebalanceStats> {
        self.run(RebalanceOp::Merge)
    }

    /// Replay the rebalance recorded on the source, if any.
    pub fn resume(&self) -> IndexResult<Option<RebalanceStats>> {
        let Some(pending) = self.src.pending_rebalance()? else {
            return Ok(None);
        };
        if pending.dest != self.dest.base() {
            return Err(IndexError::InvalidOperation(format!(
                "pending rebalance targets {}, not {}",
                pending.dest.display(),
                self.dest.base().display()
            )));
        }
        info!(op = ?pending.op, "resuming interrupted rebalance");
        self.run(pending.op).map(Some)
    }

    fn run(&self, op: RebalanceOp) -> IndexResult<RebalanceStats> {
        info!(
            op = ?op,
            src = %self.src.base().display(),
            dest = %self.dest.base().display(),
            "rebalance started"
        );
        let stats = RetryHarness::new(self.src)
            .cleaning(self.dest)
            .run(|| self.run_once(op))?;
        info!(
            objects = stats.objects_moved,
            subdirs = stats.subdirs_moved,
            "rebalance finished"
        );
        Ok(stats)
    }

    fn run_once(&self, op: RebalanceOp) -> IndexResult<RebalanceStats> {
        self.src.set_pending(&PendingRebalance {
            op,
            dest: self.dest.base().to_path_buf(),
        })?;
        self.src.injector().maybe_fail()?;

        let mut stats = RebalanceStats::default();
        let root = DirPath::root();
        match op {
            RebalanceOp::Split { matching, bits } => {
                self.split_dir(&root, matching, bits, &mut stats)?
            }
            RebalanceOp::Merge => self.move_subtree(&root, SourceDirs::Dismantle, &mut stats)?,
        }
        self.src.injector().maybe_fail()?;
        self.src.clear_pending()?;
        Ok(stats)
    }

    fn split_dir(
        &self,
        dir: &DirPath,
        matching: u32,
        bits: u32,
        stats: &mut RebalanceStats,
    ) -> IndexResult<()> {
        let layout = self.src.layout();
        match layout.subtree_verdict(dir, bits, matching) {
            SubtreeVerdict::None => return Ok(()),
            SubtreeVerdict::All => return self.move_subtree(dir, SourceDirs::KeepStamped, stats),
            SubtreeVerdict::Mixed => {}
        }

        let matched: Vec<_> = self
            .src
            .list_all(dir)?
            .into_values()
            .filter(|oid| layout.matches(oid, bits, matching))
            .collect();
        if !matched.is_empty() {
            self.src.move_objects_once(self.dest, dir, &matched, 0)?;
            stats.objects_moved += matched.len();
        }
        for component in self.src.list_subdirs(dir)? {
            self.split_dir(&dir.child(component), matching, bits, stats)?;
        }
        Ok(())
    }

    /// Move everything under `dir`: by renaming the directory when the
    /// destination lacks it, content-wise otherwise. The root, and stamped
    /// directories under [`SourceDirs::KeepStamped`], always move
    /// content-wise and stay behind.
    fn move_subtree(
        &self,
        dir: &DirPath,
        source: SourceDirs,
        stats: &mut RebalanceStats,
    ) -> IndexResult<()> {
        let keep = dir.is_root()
            || (source == SourceDirs::KeepStamped && !self.src.dir_attrs(dir)?.is_empty());
        if !keep && !self.dest.path_exists(dir)? {
            self.src.move_subdir_once(self.dest, dir)?;
            stats.subdirs_moved += 1;
            return Ok(());
        }

        self.dest.create_path(dir)?;
        self.src.copy_dir_attrs(self.dest, dir)?;
        self.src.injector().maybe_fail()?;

        let objects: Vec<_> = self.src.list_all(dir)?.into_values().collect();
        if !objects.is_empty() {
            self.src.move_objects_once(self.dest, dir, &objects, 0)?;
            stats.objects_moved += objects.len();
        }
        for component in self.src.list_subdirs(dir)? {
            self.move_subtree(&dir.child(component), source, stats)?;
        }
        if !keep {
            self.dismantle(dir)?;
        }
        Ok(())
    }

    /// Remove a source directory whose objects have all moved. Entries that
    /// are not objects stay where they are, and so does the directory.
    fn dismantle(&self, dir: &DirPath) -> IndexResult<()> {
        self.src.reclaim_orphans(dir)?;
        match self.src.remove_path(dir) {
            Ok(()) => debug!(dir = %dir, "merged subdirectory"),
            Err(IndexError::Store(StoreError::NotEmpty(_))) => {
                warn!(dir = %dir, "keeping source directory with leftover entries")
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

/// What becomes of source directories emptied by a content-wise move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SourceDirs {
    /// Remove them; a merge empties the whole source.
    Dismantle,
    /// Keep those carrying hash metadata, so the source layout survives a
    /// split.
    KeepStamped,
}

impl Index {
    /// The unfinished rebalance recorded on this index, if any.
    pub fn pending_rebalance(&self) -> IndexResult<Option<PendingRebalance>> {
        let Some(raw) = self.backend().get_attr(self.base(), PENDING_ATTR)? else {
            return Ok(None);
        };
        bincode::deserialize(&raw)
            .map(Some)
            .map_err(|e| IndexError::Serialization(e.to_string()))
    }

    fn set_pending(&self, pending: &PendingRebalance) -> IndexResult<()> {
        let raw = bincode::serialize(pending).map_err(|e| IndexError::Serialization(e.to_string()))?;
        self.backend().set_attr(self.base(), PENDING_ATTR, &raw)?;
        self.fsync_dir(&DirPath::root())
    }

    fn clear_pending(&self) -> IndexResult<()> {
        self.backend().remove_attr(self.base(), PENDING_ATTR)?;
        Ok(())
    }
}
