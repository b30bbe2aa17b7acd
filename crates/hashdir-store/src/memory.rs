use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::traits::{
    AttributeStore, DirCursor, DirEntry, DirPage, DirectoryOps, EntryKind, EntryStat,
};

type Attrs = BTreeMap<String, Vec<u8>>;

#[derive(Debug)]
enum Node {
    Dir { attrs: Attrs },
    File { ino: u64 },
}

#[derive(Debug, Default)]
struct Inode {
    nlink: u32,
    attrs: Attrs,
}

#[derive(Debug)]
struct State {
    nodes: BTreeMap<PathBuf, Node>,
    inodes: HashMap<u64, Inode>,
    next_ino: u64,
    syncs: u64,
}

impl State {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(PathBuf::new(), Node::Dir { attrs: Attrs::new() });
        Self {
            nodes,
            inodes: HashMap::new(),
            next_ino: 1,
            syncs: 0,
        }
    }

    fn require_dir(&self, path: &Path) -> StoreResult<()> {
        match self.nodes.get(path) {
            Some(Node::Dir { .. }) => Ok(()),
            Some(Node::File { .. }) => Err(StoreError::NotADirectory(path.to_path_buf())),
            None => Err(StoreError::NotFound(path.to_path_buf())),
        }
    }

    fn require_parent(&self, path: &Path) -> StoreResult<()> {
        match path.parent() {
            Some(parent) => self.require_dir(parent),
            None => Err(StoreError::InvalidName(format!("{}", path.display()))),
        }
    }

    fn has_children(&self, dir: &Path) -> bool {
        self.nodes.keys().any(|k| k.parent() == Some(dir))
    }

    fn release(&mut self, ino: u64) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.nlink = inode.nlink.saturating_sub(1);
            if inode.nlink == 0 {
                self.inodes.remove(&ino);
            }
        }
    }

    fn attrs(&self, path: &Path) -> StoreResult<&Attrs> {
        match self.nodes.get(path) {
            Some(Node::Dir { attrs }) => Ok(attrs),
            Some(Node::File { ino }) => self
                .inodes
                .get(ino)
                .map(|inode| &inode.attrs)
                .ok_or_else(|| StoreError::NotFound(path.to_path_buf())),
            None => Err(StoreError::NotFound(path.to_path_buf())),
        }
    }

    fn attrs_mut(&mut self, path: &Path) -> StoreResult<&mut Attrs> {
        match self.nodes.get_mut(path) {
            Some(Node::Dir { attrs }) => Ok(attrs),
            Some(Node::File { ino }) => {
                let ino = *ino;
                self.inodes
                    .get_mut(&ino)
                    .map(|inode| &mut inode.attrs)
                    .ok_or_else(|| StoreError::NotFound(path.to_path_buf()))
            }
            None => Err(StoreError::NotFound(path.to_path_buf())),
        }
    }
}

/// In-memory filesystem model for tests and embedding.
///
/// Models what the index relies on from a POSIX filesystem: hard links share
/// one inode (and therefore its attributes), `rename` replaces files and
/// moves whole directory subtrees atomically, and directories must be empty
/// to be removed.
pub struct InMemoryBackend {
    state: RwLock<State>,
}

impl InMemoryBackend {
    /// Create a backend holding only the root directory.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::new()),
        }
    }

    /// Number of file entries (links, not inodes).
    pub fn file_count(&self) -> usize {
        self.state
            .read()
            .expect("lock poisoned")
            .nodes
            .values()
            .filter(|node| matches!(node, Node::File { .. }))
            .count()
    }

    /// Number of live inodes.
    pub fn inode_count(&self) -> usize {
        self.state.read().expect("lock poisoned").inodes.len()
    }

    /// Number of `sync_dir` calls so far.
    pub fn sync_count(&self) -> u64 {
        self.state.read().expect("lock poisoned").syncs
    }

    /// All paths beneath `prefix`, sorted, excluding `prefix` itself.
    pub fn paths_under(&self, prefix: &Path) -> Vec<PathBuf> {
        let state = self.state.read().expect("lock poisoned");
        state
            .nodes
            .keys()
            .filter(|k| k.starts_with(prefix) && k.as_path() != prefix)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryOps for InMemoryBackend {
    fn create_dir(&self, path: &Path) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        if state.nodes.contains_key(path) {
            return Err(StoreError::AlreadyExists(path.to_path_buf()));
        }
        state.require_parent(path)?;
        state
            .nodes
            .insert(path.to_path_buf(), Node::Dir { attrs: Attrs::new() });
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        if path.as_os_str().is_empty() {
            return Err(StoreError::InvalidName("cannot remove the root".into()));
        }
        state.require_dir(path)?;
        if state.has_children(path) {
            return Err(StoreError::NotEmpty(path.to_path_buf()));
        }
        state.nodes.remove(path);
        Ok(())
    }

    fn list_dir(&self, path: &Path, cursor: &DirCursor, max: usize) -> StoreResult<DirPage> {
        let state = self.state.read().expect("lock poisoned");
        state.require_dir(path)?;
        let mut entries: Vec<DirEntry> = state
            .nodes
            .iter()
            .filter(|(k, _)| k.parent() == Some(path))
            .filter_map(|(k, node)| {
                let name = k.file_name()?.to_str()?.to_string();
                let kind = match node {
                    Node::Dir { .. } => EntryKind::Dir,
                    Node::File { .. } => EntryKind::File,
                };
                Some(DirEntry { name, kind })
            })
            .filter(|entry| cursor.admits(&entry.name))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let mut next = None;
        if max > 0 && entries.len() > max {
            entries.truncate(max);
            next = entries.last().map(|e| DirCursor::after(e.name.clone()));
        }
        Ok(DirPage { entries, next })
    }

    fn sync_dir(&self, path: &Path) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        state.require_dir(path)?;
        state.syncs += 1;
        Ok(())
    }

    fn stat(&self, path: &Path) -> StoreResult<Option<EntryStat>> {
        let state = self.state.read().expect("lock poisoned");
        Ok(match state.nodes.get(path) {
            None => None,
            Some(Node::Dir { .. }) => Some(EntryStat {
                kind: EntryKind::Dir,
                nlink: 1,
            }),
            Some(Node::File { ino }) => Some(EntryStat {
                kind: EntryKind::File,
                nlink: state.inodes.get(ino).map(|i| i.nlink).unwrap_or(0),
            }),
        })
    }

    fn create_file(&self, path: &Path) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        if state.nodes.contains_key(path) {
            return Err(StoreError::AlreadyExists(path.to_path_buf()));
        }
        state.require_parent(path)?;
        let ino = state.next_ino;
        state.next_ino += 1;
        state.inodes.insert(
            ino,
            Inode {
                nlink: 1,
                attrs: Attrs::new(),
            },
        );
        state.nodes.insert(path.to_path_buf(), Node::File { ino });
        Ok(())
    }

    fn link(&self, from: &Path, to: &Path) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        let ino = match state.nodes.get(from) {
            Some(Node::File { ino }) => *ino,
            Some(Node::Dir { .. }) => {
                return Err(StoreError::Io(io::Error::from_raw_os_error(libc::EPERM)))
            }
            None => return Err(StoreError::NotFound(from.to_path_buf())),
        };
        if state.nodes.contains_key(to) {
            return Err(StoreError::AlreadyExists(to.to_path_buf()));
        }
        state.require_parent(to)?;
        if let Some(inode) = state.inodes.get_mut(&ino) {
            inode.nlink += 1;
        }
        state.nodes.insert(to.to_path_buf(), Node::File { ino });
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        if !state.nodes.contains_key(from) {
            return Err(StoreError::NotFound(from.to_path_buf()));
        }
        state.require_parent(to)?;
        if from == to {
            return Ok(());
        }

        match state.nodes.get(from) {
            Some(Node::File { ino }) => {
                let ino = *ino;
                match state.nodes.get(to) {
                    Some(Node::Dir { .. }) => {
                        return Err(StoreError::Io(io::Error::from_raw_os_error(libc::EISDIR)))
                    }
                    // Two links to one inode: rename leaves both in place.
                    Some(Node::File { ino: replaced }) if *replaced == ino => return Ok(()),
                    Some(Node::File { ino: replaced }) => {
                        let replaced = *replaced;
                        state.release(replaced);
                    }
                    None => {}
                }
                state.nodes.remove(from);
                state.nodes.insert(to.to_path_buf(), Node::File { ino });
            }
            Some(Node::Dir { .. }) => {
                if to.starts_with(from) {
                    return Err(StoreError::InvalidName(format!(
                        "cannot move {} beneath itself",
                        from.display()
                    )));
                }
                match state.nodes.get(to) {
                    Some(Node::File { .. }) => {
                        return Err(StoreError::NotADirectory(to.to_path_buf()))
                    }
                    Some(Node::Dir { .. }) => {
                        if state.has_children(to) {
                            return Err(StoreError::NotEmpty(to.to_path_buf()));
                        }
                        state.nodes.remove(to);
                    }
                    None => {}
                }
                let moved: Vec<PathBuf> = state
                    .nodes
                    .keys()
                    .filter(|k| k.starts_with(from))
                    .cloned()
                    .collect();
                for old in moved {
                    let Ok(rest) = old.strip_prefix(from) else {
                        continue;
                    };
                    let new = if rest.as_os_str().is_empty() {
                        to.to_path_buf()
                    } else {
                        to.join(rest)
                    };
                    if let Some(node) = state.nodes.remove(&old) {
                        state.nodes.insert(new, node);
                    }
                }
            }
            None => unreachable!("checked above"),
        }
        Ok(())
    }

    fn unlink(&self, path: &Path) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        match state.nodes.get(path) {
            Some(Node::File { ino }) => {
                let ino = *ino;
                state.nodes.remove(path);
                state.release(ino);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(StoreError::Io(io::Error::from_raw_os_error(
                libc::EISDIR,
            ))),
            None => Err(StoreError::NotFound(path.to_path_buf())),
        }
    }
}

impl AttributeStore for InMemoryBackend {
    fn get_attr(&self, path: &Path, name: &str) -> StoreResult<Option<Vec<u8>>> {
        let state = self.state.read().expect("lock poisoned");
        Ok(state.attrs(path)?.get(name).cloned())
    }

    fn set_attr(&self, path: &Path, name: &str, value: &[u8]) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        state
            .attrs_mut(path)?
            .insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn remove_attr(&self, path: &Path, name: &str) -> StoreResult<bool> {
        let mut state = self.state.write().expect("lock poisoned");
        Ok(state.attrs_mut(path)?.remove(name).is_some())
    }

    fn list_attrs(&self, path: &Path) -> StoreResult<Vec<String>> {
        let state = self.state.read().expect("lock poisoned");
        Ok(state.attrs(path)?.keys().cloned().collect())
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("file_count", &self.file_count())
            .field("inode_count", &self.inode_count())
            .finish()
    }
}
