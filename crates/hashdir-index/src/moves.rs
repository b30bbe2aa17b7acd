//! Relocation primitives between two indexes sharing a backend.
//!
//! Every primitive makes the object durable at the destination before it
//! leaves the source, so an interruption at any step leaves it present in
//! at least one index. Replaying a primitive recognizes work already done.

use hashdir_store::DirectoryOps;
use hashdir_types::{DirPath, ObjectIdentity};
use tracing::debug;

use crate::error::{IndexError, IndexResult};
use crate::index::Index;
use crate::retry::RetryHarness;

impl Index {
    /// Move `oid` from `dir` of this index to `dir` of `dest`. Returns
    /// `false` if it was no longer in the source.
    pub fn move_object(
        &self,
        dest: &Index,
        dir: &DirPath,
        oid: &ObjectIdentity,
    ) -> IndexResult<bool> {
        self.check_backend(dest)?;
        let mut started = false;
        RetryHarness::new(self)
            .cleaning(dest)
            .run(|| self.move_object_once(dest, dir, oid, &mut started))
    }

    fn move_object_once(
        &self,
        dest: &Index,
        dir: &DirPath,
        oid: &ObjectIdentity,
        started: &mut bool,
    ) -> IndexResult<bool> {
        if !self.path_exists(dir)? || self.lookup_in(dir, oid)?.is_none() {
            return Ok(*started);
        }
        *started = true;
        self.injector().maybe_fail()?;
        dest.create_path(dir)?;
        self.injector().maybe_fail()?;
        self.link_into(dest, dir, oid)?;
        self.injector().maybe_fail()?;
        dest.fsync_dir(dir)?;
        self.injector().maybe_fail()?;
        self.remove_object(dir, oid)?;
        self.injector().maybe_fail()?;
        self.fsync_dir(dir)?;
        debug!(dir = %dir, oid = %oid, "moved object");
        Ok(true)
    }

    /// Move a batch of objects from `dir` to `dest`, linking all of them
    /// before unlinking any. At most `limit` objects (0 = all) are
    /// handled; the rest are returned for a later call.
    pub fn move_objects(
        &self,
        dest: &Index,
        dir: &DirPath,
        oids: &[ObjectIdentity],
        limit: usize,
    ) -> IndexResult<Vec<ObjectIdentity>> {
        self.check_backend(dest)?;
        RetryHarness::new(self)
            .cleaning(dest)
            .run(|| self.move_objects_once(dest, dir, oids, limit))
    }

    pub(crate) fn move_objects_once(
        &self,
        dest: &Index,
        dir: &DirPath,
        oids: &[ObjectIdentity],
        limit: usize,
    ) -> IndexResult<Vec<ObjectIdentity>> {
        let take = if limit == 0 { oids.len() } else { limit.min(oids.len()) };
        let (batch, rest) = oids.split_at(take);
        if batch.is_empty() || !self.path_exists(dir)? {
            return Ok(rest.to_vec());
        }

        dest.create_path(dir)?;
        let mut linked = Vec::with_capacity(batch.len());
        for oid in batch {
            if self.lookup_in(dir, oid)?.is_none() {
                continue;
            }
            self.link_into(dest, dir, oid)?;
            linked.push(oid);
            self.injector().maybe_fail()?;
        }
        dest.fsync_dir(dir)?;
        self.injector().maybe_fail()?;

        for oid in &linked {
            self.remove_object(dir, oid)?;
            self.injector().maybe_fail()?;
        }
        self.fsync_dir(dir)?;
        debug!(dir = %dir, moved = linked.len(), pending = rest.len(), "moved objects");
        Ok(rest.to_vec())
    }

    /// Hard link the source file of `oid` into `dest` and record it there.
    fn link_into(&self, dest: &Index, dir: &DirPath, oid: &ObjectIdentity) -> IndexResult<()> {
        let Some(src) = self.lookup_in(dir, oid)? else {
            return Err(IndexError::NotFound(oid.to_string()));
        };
        let (name, existing) = dest.get_mangled_name(dir, oid)?;
        if existing.is_none() {
            let from = self.object_path(dir, &src.name.name);
            let to = dest.object_path(dir, &name.name);
            match self.backend().link(&from, &to) {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }
        }
        dest.created(dir, oid, &name)
    }

    /// Rename the whole subdirectory `dir` into `dest`. Fails with
    /// `AlreadyExists` if `dest` already has it.
    pub fn move_subdir(&self, dest: &Index, dir: &DirPath) -> IndexResult<()> {
        self.check_backend(dest)?;
        RetryHarness::new(self)
            .cleaning(dest)
            .run(|| self.move_subdir_once(dest, dir))
    }

    pub(crate) fn move_subdir_once(&self, dest: &Index, dir: &DirPath) -> IndexResult<()> {
        let Some((parent, _)) = dir.split_last() else {
            return Err(IndexError::InvalidOperation("cannot move the index root".into()));
        };
        if dest.path_exists(dir)? {
            return Err(IndexError::AlreadyExists(dest.dir_path(dir).display().to_string()));
        }
        dest.create_path(&parent)?;
        self.injector().maybe_fail()?;
        self.backend()
            .rename(&self.dir_path(dir), &dest.dir_path(dir))?;
        self.injector().maybe_fail()?;
        dest.fsync_dir(&parent)?;
        self.fsync_dir(&parent)?;
        debug!(dir = %dir, "moved subdirectory");
        Ok(())
    }

    /// Copy the hash metadata attributes of `dir` onto `dest`.
    pub(crate) fn copy_dir_attrs(&self, dest: &Index, dir: &DirPath) -> IndexResult<()> {
        for (key, value) in self.dir_attrs(dir)? {
            dest.set_dir_attr(dir, &key, &value)?;
        }
        Ok(())
    }

    pub(crate) fn check_backend(&self, other: &Index) -> IndexResult<()> {
        if self.same_backend(other) {
            Ok(())
        } else {
            Err(IndexError::BackendMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::IndexConfig;
    use crate::layout::{FlatLayout, NibbleLayout};
    use hashdir_store::{Backend, InMemoryBackend};

    fn pair(fs: Arc<InMemoryBackend>) -> (Index, Index) {
        let backend: Arc<dyn Backend> = fs;
        let a = Index::open(backend.clone(), "a", Arc::new(NibbleLayout::new(1)), IndexConfig::default())
            .unwrap();
        let b = Index::open(backend, "b", Arc::new(NibbleLayout::new(1)), IndexConfig::default())
            .unwrap();
        (a, b)
    }

    fn long(tag: &str, hash: u32) -> ObjectIdentity {
        ObjectIdentity::new(1, hash, format!("{}{tag}", "m".repeat(280)))
    }

    #[test]
    fn move_object_relocates() {
        let fs = Arc::new(InMemoryBackend::new());
        let (src, dest) = pair(fs.clone());
        let oid = long("x", 0x3);
        src.create(&oid).unwrap();
        let dir = src.layout().path_for(&oid);

        assert!(src.move_object(&dest, &dir, &oid).unwrap());
        assert!(src.lookup(&oid).unwrap().is_none());
        let found = dest.lookup(&oid).unwrap().unwrap();
        assert_eq!(found.hardlinks, 1);
        assert_eq!(fs.inode_count(), 1);

        // Replaying is a no-op.
        assert!(!src.move_object(&dest, &dir, &oid).unwrap());
        assert!(dest.lookup(&oid).unwrap().is_some());
    }

    #[test]
    fn move_object_finishes_half_done_move() {
        let fs = Arc::new(InMemoryBackend::new());
        let (src, dest) = pair(fs.clone());
        let oid = ObjectIdentity::new(1, 0x5, "short");
        src.create(&oid).unwrap();
        let dir = src.layout().path_for(&oid);

        // Linked into the destination, never removed from the source.
        dest.create_path(&dir).unwrap();
        src.link_into(&dest, &dir, &oid).unwrap();
        assert_eq!(dest.lookup(&oid).unwrap().unwrap().hardlinks, 2);

        assert!(src.move_object(&dest, &dir, &oid).unwrap());
        assert!(src.lookup(&oid).unwrap().is_none());
        assert_eq!(dest.lookup(&oid).unwrap().unwrap().hardlinks, 1);
    }

    #[test]
    fn move_objects_returns_remainder() {
        let fs = Arc::new(InMemoryBackend::new());
        let (src, dest) = pair(fs.clone());
        let oids: Vec<_> = (0..5).map(|i| ObjectIdentity::new(1, 0x10 * i, format!("o{i}"))).collect();
        for oid in &oids {
            src.create(oid).unwrap();
        }
        let dir = DirPath::root().child("0");

        let rest = src.move_objects(&dest, &dir, &oids, 2).unwrap();
        assert_eq!(rest, oids[2..].to_vec());
        let rest = src.move_objects(&dest, &dir, &rest, 0).unwrap();
        assert!(rest.is_empty());

        assert!(src.list_all(&dir).unwrap().is_empty());
        assert_eq!(dest.list_all(&dir).unwrap().len(), 5);
    }

    #[test]
    fn move_subdir_renames_tree() {
        let fs = Arc::new(InMemoryBackend::new());
        let (src, dest) = pair(fs.clone());
        let oid = ObjectIdentity::new(1, 0x7, "obj");
        src.create(&oid).unwrap();
        let dir = DirPath::root().child("7");
        src.set_dir_attr(&dir, "bits", b"4").unwrap();

        src.move_subdir(&dest, &dir).unwrap();
        assert!(!src.path_exists(&dir).unwrap());
        assert!(dest.lookup(&oid).unwrap().is_some());
        assert_eq!(dest.get_dir_attr(&dir, "bits").unwrap(), Some(b"4".to_vec()));

        src.create_path(&dir).unwrap();
        assert!(matches!(
            src.move_subdir(&dest, &dir),
            Err(IndexError::AlreadyExists(_))
        ));
    }

    #[test]
    fn indexes_must_share_backend() {
        let a = Index::open(Arc::new(InMemoryBackend::new()), "a", Arc::new(FlatLayout), IndexConfig::default())
            .unwrap();
        let b = Index::open(Arc::new(InMemoryBackend::new()), "b", Arc::new(FlatLayout), IndexConfig::default())
            .unwrap();
        let oid = ObjectIdentity::new(1, 1, "x");
        assert!(matches!(
            a.move_object(&b, &DirPath::root(), &oid),
            Err(IndexError::BackendMismatch)
        ));
    }
}
