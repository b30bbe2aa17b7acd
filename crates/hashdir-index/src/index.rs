//! The object index: steady-state object operations and the directory
//! primitives rebalancing is built from.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashdir_store::{AttributeStore, Backend, DirCursor, DirectoryOps, EntryKind, StoreError};
use hashdir_types::{DirPath, ObjectIdentity};
use tracing::{debug, warn};

use crate::codec::{Decoded, MangledName, NameCodec, NameForm, PHASH_ATTR_PREFIX};
use crate::config::IndexConfig;
use crate::error::{IndexError, IndexResult};
use crate::inject::FailureInjector;
use crate::layout::HashLayout;
use crate::retry::RetryHarness;

/// Where an object was found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Located {
    pub dir: DirPath,
    pub name: MangledName,
    /// Hard link count of the object's file.
    pub hardlinks: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyPresent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnlinkOutcome {
    Removed,
    NotFound,
}

/// One page of [`Index::list`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectPage {
    /// On-disk name and identity of each object, in name order.
    pub objects: Vec<(String, ObjectIdentity)>,
    pub next: Option<DirCursor>,
}

/// Position in a tree-wide listing: on-disk path of the last object
/// returned, mangled components first.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectCursor(Option<Vec<String>>);

impl ObjectCursor {
    pub fn start() -> Self {
        Self(None)
    }

    fn after(key: Vec<String>) -> Self {
        Self(Some(key))
    }

    fn admits(&self, key: &[String]) -> bool {
        match &self.0 {
            None => true,
            Some(last) => key > last.as_slice(),
        }
    }

    /// Returns `true` if nothing under the subtree `key` can follow the
    /// cursor.
    fn passed_subtree(&self, key: &[String]) -> bool {
        match &self.0 {
            None => false,
            Some(last) => {
                let n = key.len().min(last.len());
                last[..n] > key[..n]
            }
        }
    }
}

/// An object found by [`Index::list_range`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeEntry {
    pub dir: DirPath,
    pub name: String,
    pub oid: ObjectIdentity,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangePage {
    pub entries: Vec<RangeEntry>,
    /// `None` once the walk has covered the whole tree.
    pub next: Option<ObjectCursor>,
}

/// A hashed-directory object index rooted at `base` on a [`Backend`].
///
/// There is no persisted index structure: the mapping from identity to
/// file is exactly the set of files and their attributes, so every
/// mutation is ordered to keep each present identity resolvable to one
/// file at every step.
pub struct Index {
    backend: Arc<dyn Backend>,
    base: PathBuf,
    codec: NameCodec,
    config: IndexConfig,
    injector: FailureInjector,
    layout: Arc<dyn HashLayout>,
}

impl Index {
    /// Open (creating if needed) the index rooted at `base`.
    pub fn open(
        backend: Arc<dyn Backend>,
        base: impl Into<PathBuf>,
        layout: Arc<dyn HashLayout>,
        config: IndexConfig,
    ) -> IndexResult<Self> {
        let base = base.into();
        let mut prefix = PathBuf::new();
        for component in base.components() {
            prefix.push(component);
            match backend.create_dir(&prefix) {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Self {
            codec: NameCodec::new(config.version),
            injector: FailureInjector::from_config(&config.failure_injection),
            backend,
            base,
            config,
            layout,
        })
    }

    /// Replace the name codec, e.g. to use a different digest.
    pub fn with_codec(mut self, codec: NameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn codec(&self) -> &NameCodec {
        &self.codec
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn layout(&self) -> &Arc<dyn HashLayout> {
        &self.layout
    }

    pub fn injector(&self) -> &FailureInjector {
        &self.injector
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub(crate) fn same_backend(&self, other: &Index) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.backend) as *const (),
            Arc::as_ptr(&other.backend) as *const (),
        )
    }

    /// Backend path of `dir`.
    pub fn dir_path(&self, dir: &DirPath) -> PathBuf {
        let mut path = self.base.clone();
        for component in dir.components() {
            path.push(self.codec.mangle_component(component));
        }
        path
    }

    /// Backend path of the file `name` in `dir`.
    pub fn object_path(&self, dir: &DirPath, name: &str) -> PathBuf {
        self.dir_path(dir).join(name)
    }

    /// Lay out the fixed structure of the layout, if any.
    pub fn prepare(&self) -> IndexResult<()> {
        self.layout.prepare(self)
    }

    /// Idempotent teardown of leftovers from an interrupted operation.
    pub fn cleanup(&self) -> IndexResult<()> {
        self.layout.cleanup(self)
    }

    // -----------------------------------------------------------------------
    // Object operations
    // -----------------------------------------------------------------------

    /// Find the file holding `oid`.
    pub fn lookup(&self, oid: &ObjectIdentity) -> IndexResult<Option<Located>> {
        RetryHarness::new(self).run(|| self.lookup_in(&self.layout.path_for(oid), oid))
    }

    pub(crate) fn lookup_in(
        &self,
        dir: &DirPath,
        oid: &ObjectIdentity,
    ) -> IndexResult<Option<Located>> {
        let (name, hardlinks) = self.get_mangled_name(dir, oid)?;
        Ok(hardlinks.map(|hardlinks| Located {
            dir: dir.clone(),
            name,
            hardlinks,
        }))
    }

    /// Create the file for `oid`. Creating a present object is a no-op.
    pub fn create(&self, oid: &ObjectIdentity) -> IndexResult<CreateOutcome> {
        // Set once any attempt has created the file.
        let mut fresh = false;
        RetryHarness::new(self).run(|| self.create_once(oid, &mut fresh))
    }

    fn create_once(&self, oid: &ObjectIdentity, fresh: &mut bool) -> IndexResult<CreateOutcome> {
        let dir = self.layout.path_for(oid);
        if !self.path_exists(&dir)? {
            self.create_path(&dir)?;
        }
        let (name, existing) = self.get_mangled_name(&dir, oid)?;
        if existing.is_some() {
            return Ok(if *fresh {
                CreateOutcome::Created
            } else {
                CreateOutcome::AlreadyPresent
            });
        }
        self.injector.maybe_fail()?;

        let path = self.object_path(&dir, &name.name);
        match self.backend.create_file(&path) {
            Ok(()) => *fresh = true,
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }
        self.injector.maybe_fail()?;
        self.created(&dir, oid, &name)?;
        if self.config.sync_on_create {
            self.fsync_dir(&dir)?;
        }
        debug!(dir = %dir, name = %name.name, "created object");
        Ok(CreateOutcome::Created)
    }

    /// Remove the file for `oid`.
    pub fn unlink(&self, oid: &ObjectIdentity) -> IndexResult<UnlinkOutcome> {
        let dir = self.layout.path_for(oid);
        let mut present = false;
        RetryHarness::new(self).run(|| {
            if self.lookup_in(&dir, oid)?.is_some() {
                present = true;
            }
            self.remove_object(&dir, oid)?;
            Ok(if present {
                UnlinkOutcome::Removed
            } else {
                UnlinkOutcome::NotFound
            })
        })
    }

    /// List up to `max` entries (0 = no limit) of `dir` after `cursor`.
    ///
    /// Entries that are not objects, or hashed files whose attribute does
    /// not account for their name, are skipped.
    pub fn list(&self, dir: &DirPath, cursor: &DirCursor, max: usize) -> IndexResult<ObjectPage> {
        let page = self.backend.list_dir(&self.dir_path(dir), cursor, max)?;
        let mut objects = Vec::new();
        for entry in page.entries {
            if entry.kind != EntryKind::File {
                continue;
            }
            if let Some(oid) = self.resolve(dir, &entry.name)? {
                objects.push((entry.name, oid));
            }
        }
        Ok(ObjectPage {
            objects,
            next: page.next,
        })
    }

    /// Every object directly in `dir`, keyed by on-disk name.
    pub fn list_all(&self, dir: &DirPath) -> IndexResult<BTreeMap<String, ObjectIdentity>> {
        Ok(self
            .list(dir, &DirCursor::start(), 0)?
            .objects
            .into_iter()
            .collect())
    }

    /// Depth-first listing of the whole tree, up to `max` objects after
    /// `cursor`. Chaining the returned cursors visits every object once.
    pub fn list_range(&self, cursor: &ObjectCursor, max: usize) -> IndexResult<RangePage> {
        let mut page = RangePage::default();
        let mut key = Vec::new();
        self.walk(&DirPath::root(), &mut key, cursor, max.max(1), &mut page)?;
        Ok(page)
    }

    fn walk(
        &self,
        dir: &DirPath,
        key: &mut Vec<String>,
        cursor: &ObjectCursor,
        max: usize,
        page: &mut RangePage,
    ) -> IndexResult<bool> {
        let listing = self
            .backend
            .list_dir(&self.dir_path(dir), &DirCursor::start(), 0)?;
        for entry in listing.entries {
            key.push(entry.name.clone());
            let full = match entry.kind {
                EntryKind::File if cursor.admits(key) => self.walk_file(dir, key, max, page)?,
                EntryKind::Dir if !cursor.passed_subtree(key) => {
                    match self.codec.try_decode(&entry.name) {
                        Decoded::Subdir(component) => {
                            self.walk(&dir.child(component), key, cursor, max, page)?
                        }
                        _ => false,
                    }
                }
                _ => false,
            };
            key.pop();
            if full {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn walk_file(
        &self,
        dir: &DirPath,
        key: &[String],
        max: usize,
        page: &mut RangePage,
    ) -> IndexResult<bool> {
        let Some(name) = key.last() else {
            return Ok(false);
        };
        let Some(oid) = self.resolve(dir, name)? else {
            return Ok(false);
        };
        page.entries.push(RangeEntry {
            dir: dir.clone(),
            name: name.clone(),
            oid,
        });
        if page.entries.len() >= max {
            page.next = Some(ObjectCursor::after(key.to_vec()));
            return Ok(true);
        }
        Ok(false)
    }

    /// Every object in the tree, in depth-first order.
    pub fn all_objects(&self) -> IndexResult<Vec<ObjectIdentity>> {
        let mut out = Vec::new();
        let mut cursor = ObjectCursor::start();
        loop {
            let page = self.list_range(&cursor, 256)?;
            out.extend(page.entries.into_iter().map(|e| e.oid));
            match page.next {
                Some(next) => cursor = next,
                None => return Ok(out),
            }
        }
    }

    /// Split a backend path of a file inside this index into directory,
    /// identity and on-disk name.
    pub fn decompose(&self, path: &Path) -> IndexResult<(DirPath, ObjectIdentity, String)> {
        let rest = path.strip_prefix(&self.base).map_err(|_| {
            IndexError::NotFound(format!("{} is outside {}", path.display(), self.base.display()))
        })?;
        let mut names: Vec<String> = Vec::new();
        for component in rest.components() {
            let name = component.as_os_str().to_str().ok_or_else(|| {
                IndexError::NotFound(format!("non-utf8 path {}", path.display()))
            })?;
            names.push(name.to_string());
        }
        let Some(file) = names.pop() else {
            return Err(IndexError::NotFound(path.display().to_string()));
        };
        let mut dir = DirPath::root();
        for name in &names {
            match self.codec.demangle_component(name) {
                Some(component) => dir = dir.child(component),
                None => return Err(IndexError::NotFound(path.display().to_string())),
            }
        }
        match self.resolve(&dir, &file)? {
            Some(oid) => Ok((dir, oid, file)),
            None => Err(IndexError::NotFound(path.display().to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Name resolution
    // -----------------------------------------------------------------------

    /// Identity stored at `dir/name`, `None` if it is not a resolvable
    /// object.
    pub(crate) fn resolve(&self, dir: &DirPath, name: &str) -> IndexResult<Option<ObjectIdentity>> {
        match self.codec.try_decode(name) {
            Decoded::Object(oid) => Ok(Some(oid)),
            Decoded::Hashed { .. } => {
                let path = self.object_path(dir, name);
                let mut attrs = vec![self.codec.lfn_attr()];
                attrs.extend(self.codec.lfn_alt_attr());
                for attr in attrs {
                    let stored = match self.backend.get_attr(&path, attr) {
                        Ok(stored) => stored,
                        Err(StoreError::NotFound(_)) => return Ok(None),
                        Err(e) => return Err(e.into()),
                    };
                    if let Some(oid) = stored.and_then(|s| self.codec.verify_hashed(name, &s)) {
                        return Ok(Some(oid));
                    }
                }
                warn!(dir = %dir, name, "skipping unresolvable hashed entry");
                Ok(None)
            }
            Decoded::Subdir(_) | Decoded::NotAnObject => Ok(None),
        }
    }

    /// Name `oid` has, or would get, in `dir`, and its link count if it
    /// exists.
    ///
    /// Hashed candidates are probed in order. A candidate without any
    /// attribute is debris from an interrupted create: it is removed and
    /// its slot reported free.
    pub(crate) fn get_mangled_name(
        &self,
        dir: &DirPath,
        oid: &ObjectIdentity,
    ) -> IndexResult<(MangledName, Option<u32>)> {
        let direct = self.codec.checked_direct_name(oid)?;
        if !NameCodec::must_hash(&direct) {
            let stat = self.backend.stat(&self.object_path(dir, &direct))?;
            let name = MangledName {
                name: direct,
                form: NameForm::Direct,
            };
            return Ok((name, stat.map(|s| s.nlink)));
        }

        for index in 0..self.config.max_collision_probe {
            let candidate = self.codec.candidate_for(oid, &direct, index)?;
            let path = self.object_path(dir, &candidate.name);
            let Some(stat) = self.backend.stat(&path)? else {
                return Ok((candidate, None));
            };
            match self.backend.get_attr(&path, self.codec.lfn_attr())? {
                None => {
                    self.reclaim_orphan(&path)?;
                    return Ok((candidate, None));
                }
                Some(stored) if stored == direct.as_bytes() => {
                    return Ok((candidate, Some(stat.nlink)));
                }
                Some(_) => {}
            }
            if let Some(alt) = self.codec.lfn_alt_attr() {
                if self.backend.get_attr(&path, alt)?.as_deref() == Some(direct.as_bytes()) {
                    return Ok((candidate, Some(stat.nlink)));
                }
            }
        }
        Err(IndexError::ResourceExhausted {
            dir: dir.to_string(),
            probes: self.config.max_collision_probe,
        })
    }

    /// Record `oid` on a freshly created or linked file. Direct names need
    /// nothing; hashed names get the identity attribute.
    pub(crate) fn created(
        &self,
        dir: &DirPath,
        oid: &ObjectIdentity,
        name: &MangledName,
    ) -> IndexResult<()> {
        if !name.is_hashed() {
            return Ok(());
        }
        let path = self.object_path(dir, &name.name);
        let direct = self.codec.direct_name(oid);
        match self.backend.get_attr(&path, self.codec.lfn_attr())? {
            Some(existing) if existing != direct.as_bytes() => {
                let Some(alt) = self.codec.lfn_alt_attr() else {
                    return Err(IndexError::Corruption {
                        path,
                        reason: "attribute names another object and this format has no alternate"
                            .into(),
                    });
                };
                self.backend.set_attr(&path, alt, direct.as_bytes())?;
            }
            _ => self
                .backend
                .set_attr(&path, self.codec.lfn_attr(), direct.as_bytes())?,
        }
        Ok(())
    }

    /// Remove `oid` from `dir`, keeping its collision chain contiguous.
    /// Returns `false` if it was not there.
    pub(crate) fn remove_object(&self, dir: &DirPath, oid: &ObjectIdentity) -> IndexResult<bool> {
        let (name, existing) = self.get_mangled_name(dir, oid)?;
        let Some(hardlinks) = existing else {
            return Ok(false);
        };
        let path = self.object_path(dir, &name.name);
        let NameForm::Hashed { index } = name.form else {
            self.unlink_path(&path)?;
            debug!(dir = %dir, name = %name.name, "removed object");
            return Ok(true);
        };

        let direct = self.codec.direct_name(oid);
        let mut last = index;
        for next in index + 1..self.config.max_collision_probe {
            let candidate = self.codec.candidate_for(oid, &direct, next)?;
            let candidate_path = self.object_path(dir, &candidate.name);
            if self.backend.stat(&candidate_path)?.is_none() {
                break;
            }
            if self
                .backend
                .get_attr(&candidate_path, self.codec.lfn_attr())?
                .is_none()
            {
                self.reclaim_orphan(&candidate_path)?;
                break;
            }
            last = next;
        }
        self.injector.maybe_fail()?;

        if last == index {
            if hardlinks <= 1 {
                self.backend.remove_attr(&path, self.codec.lfn_attr())?;
                self.injector.maybe_fail()?;
            }
            self.unlink_path(&path)?;
        } else {
            let tail = self.codec.candidate_for(oid, &direct, last)?;
            self.backend
                .rename(&self.object_path(dir, &tail.name), &path)?;
            debug!(dir = %dir, from = last, to = index, "compacted collision chain");
        }
        debug!(dir = %dir, name = %name.name, "removed object");
        Ok(true)
    }

    /// Remove several objects from `dir` and return what remains there.
    pub fn remove_objects(
        &self,
        dir: &DirPath,
        oids: &[ObjectIdentity],
    ) -> IndexResult<BTreeMap<String, ObjectIdentity>> {
        RetryHarness::new(self).run(|| {
            for oid in oids {
                self.remove_object(dir, oid)?;
            }
            self.list_all(dir)
        })
    }

    /// Remove a hashed file left without its attribute by an interrupted
    /// create.
    fn reclaim_orphan(&self, path: &Path) -> IndexResult<()> {
        warn!(path = %path.display(), "removing hashed entry without attribute");
        self.unlink_path(path)
    }

    /// Remove every attribute-less hashed file directly in `dir`. Only
    /// sound once no live object of `dir` is left, since a reclaimed slot
    /// in the middle of a chain would cut it short.
    pub(crate) fn reclaim_orphans(&self, dir: &DirPath) -> IndexResult<usize> {
        let page = self
            .backend
            .list_dir(&self.dir_path(dir), &DirCursor::start(), 0)?;
        let mut reclaimed = 0;
        for entry in page.entries {
            if entry.kind != EntryKind::File
                || !matches!(self.codec.try_decode(&entry.name), Decoded::Hashed { .. })
            {
                continue;
            }
            let path = self.object_path(dir, &entry.name);
            if self.backend.get_attr(&path, self.codec.lfn_attr())?.is_none() {
                self.reclaim_orphan(&path)?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    fn unlink_path(&self, path: &Path) -> IndexResult<()> {
        match self.backend.unlink(path) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Directory primitives
    // -----------------------------------------------------------------------

    /// Unmangled names of the subdirectories of `dir`, in on-disk order.
    pub fn list_subdirs(&self, dir: &DirPath) -> IndexResult<Vec<String>> {
        let page = self
            .backend
            .list_dir(&self.dir_path(dir), &DirCursor::start(), 0)?;
        Ok(page
            .entries
            .into_iter()
            .filter(|e| e.kind == EntryKind::Dir)
            .filter_map(|e| match self.codec.try_decode(&e.name) {
                Decoded::Subdir(component) => Some(component),
                _ => None,
            })
            .collect())
    }

    /// Create `dir` and any missing ancestors.
    pub fn create_path(&self, dir: &DirPath) -> IndexResult<()> {
        let mut path = self.base.clone();
        for component in dir.components() {
            path.push(self.codec.mangle_component(component));
            match self.backend.create_dir(&path) {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Remove the empty directory `dir`. Missing is fine.
    pub fn remove_path(&self, dir: &DirPath) -> IndexResult<()> {
        match self.backend.remove_dir(&self.dir_path(dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path_exists(&self, dir: &DirPath) -> IndexResult<bool> {
        Ok(self.backend.dir_exists(&self.dir_path(dir))?)
    }

    pub fn fsync_dir(&self, dir: &DirPath) -> IndexResult<()> {
        Ok(self.backend.sync_dir(&self.dir_path(dir))?)
    }

    /// Set the hash metadata attribute `key` on `dir`.
    pub fn set_dir_attr(&self, dir: &DirPath, key: &str, value: &[u8]) -> IndexResult<()> {
        let name = format!("{PHASH_ATTR_PREFIX}{key}");
        Ok(self.backend.set_attr(&self.dir_path(dir), &name, value)?)
    }

    pub fn get_dir_attr(&self, dir: &DirPath, key: &str) -> IndexResult<Option<Vec<u8>>> {
        let name = format!("{PHASH_ATTR_PREFIX}{key}");
        Ok(self.backend.get_attr(&self.dir_path(dir), &name)?)
    }

    pub fn remove_dir_attr(&self, dir: &DirPath, key: &str) -> IndexResult<bool> {
        let name = format!("{PHASH_ATTR_PREFIX}{key}");
        Ok(self.backend.remove_attr(&self.dir_path(dir), &name)?)
    }

    /// All hash metadata attributes of `dir`, keyed without the prefix.
    pub fn dir_attrs(&self, dir: &DirPath) -> IndexResult<BTreeMap<String, Vec<u8>>> {
        let path = self.dir_path(dir);
        let mut out = BTreeMap::new();
        for name in self.backend.list_attrs(&path)? {
            let Some(key) = name.strip_prefix(PHASH_ATTR_PREFIX) else {
                continue;
            };
            if let Some(value) = self.backend.get_attr(&path, &name)? {
                out.insert(key.to_string(), value);
            }
        }
        Ok(out)
    }

    /// Remove empty subdirectories below `dir` that carry no hash
    /// metadata. Returns how many were removed; `dir` itself is kept.
    pub fn prune_empty_subdirs(&self, dir: &DirPath) -> IndexResult<usize> {
        let mut removed = 0;
        for component in self.list_subdirs(dir)? {
            let child = dir.child(component);
            removed += self.prune_empty_subdirs(&child)?;
            let path = self.dir_path(&child);
            let empty = self
                .backend
                .list_dir(&path, &DirCursor::start(), 1)?
                .entries
                .is_empty();
            if empty && self.dir_attrs(&child)?.is_empty() {
                self.remove_path(&child)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("base", &self.base)
            .field("codec", &self.codec)
            .field("layout", &self.layout)
            .field("config", &self.config)
            .finish()
    }
}
