//! In-memory [`FileSystem`] with watch support and failure injection.

use crate::{
    error::{FsError, FsResult},
    event::{EventSink, FileSystemEvent, FileSystemEventType},
    fs::FileSystem,
    path::DirectoryPath,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<DirectoryPath, Node>,
    watches: HashMap<DirectoryPath, EventSink>,
    denied: HashSet<DirectoryPath>,
}

impl State {
    fn emit(&mut self, kind: FileSystemEventType, path: &DirectoryPath) {
        self.watches.retain(|root, sink| {
            if path == root || !path.starts_with(root) {
                return true;
            }
            // a closed receiver means the watcher is gone
            sink.send(FileSystemEvent::new(kind, path.clone())).is_ok()
        });
    }

    fn check_denied(&self, path: &DirectoryPath) -> FsResult<()> {
        if self.denied.contains(path) {
            return Err(FsError::PermissionDenied(path.clone()));
        }
        Ok(())
    }
}

/// Tree of files and directories held in memory.
///
/// Every mutation is reported to watchers registered on an ancestor
/// directory, synchronously and in mutation order.
#[derive(Debug)]
pub struct MemoryFileSystem {
    state: Mutex<State>,
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        let mut state = State::default();
        state.nodes.insert(DirectoryPath::root(), Node::Dir);
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make reads and listings of `path` fail with `PermissionDenied`.
    pub fn deny_read(&self, path: &DirectoryPath) {
        self.state().denied.insert(path.clone());
    }

    pub fn allow_read(&self, path: &DirectoryPath) {
        self.state().denied.remove(path);
    }

    pub fn is_watched(&self, path: &DirectoryPath) -> bool {
        self.state().watches.contains_key(path)
    }

    /// Move `from` (a file or a whole subtree) to `to` in one step.
    ///
    /// Watchers see a single Deleted for `from` and a single Created for `to`,
    /// nothing for the entries carried along.
    pub fn rename(&self, from: &DirectoryPath, to: &DirectoryPath) -> FsResult<()> {
        if from.is_root() || to.starts_with(from) {
            return Err(FsError::PermissionDenied(to.clone()));
        }
        let parent = to
            .parent()
            .ok_or_else(|| FsError::PermissionDenied(to.clone()))?;
        let mut state = self.state();
        if !state.nodes.contains_key(from) {
            return Err(FsError::NotFound(from.clone()));
        }
        match state.nodes.get(&parent) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => return Err(FsError::NotADirectory(parent)),
            None => return Err(FsError::NotFound(parent)),
        }
        if let Some(Node::Dir) = state.nodes.get(to) {
            return Err(FsError::IsADirectory(to.clone()));
        }
        let carried: Vec<DirectoryPath> = state
            .nodes
            .keys()
            .filter(|k| k.starts_with(from))
            .cloned()
            .collect();
        for old in carried {
            let Some(node) = state.nodes.remove(&old) else {
                continue;
            };
            let rel = old.strip_root(from).unwrap_or_else(DirectoryPath::root);
            let new = to
                .join_path(&rel)
                .map_err(|_| FsError::PermissionDenied(to.clone()))?;
            state.nodes.insert(new, node);
        }
        state.emit(FileSystemEventType::Deleted, from);
        state.emit(FileSystemEventType::Created, to);
        Ok(())
    }

    /// Everything below `root`, keyed by root-relative path. Directories map
    /// to `None`, files to their content.
    pub fn tree(&self, root: &DirectoryPath) -> BTreeMap<DirectoryPath, Option<Vec<u8>>> {
        self.state()
            .nodes
            .iter()
            .filter_map(|(path, node)| {
                let rel = path.strip_root(root)?;
                if rel.is_root() {
                    return None;
                }
                let content = match node {
                    Node::File(data) => Some(data.clone()),
                    Node::Dir => None,
                };
                Some((rel, content))
            })
            .collect()
    }
}

impl FileSystem for MemoryFileSystem {
    fn listdir(&self, path: &DirectoryPath) -> FsResult<Vec<String>> {
        let state = self.state();
        state.check_denied(path)?;
        match state.nodes.get(path) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => return Err(FsError::NotADirectory(path.clone())),
            None => return Err(FsError::NotFound(path.clone())),
        }
        Ok(state
            .nodes
            .keys()
            .filter(|k| k.parent().as_ref() == Some(path))
            .filter_map(|k| k.file_name().map(str::to_string))
            .collect())
    }

    fn isfile(&self, path: &DirectoryPath) -> bool {
        matches!(self.state().nodes.get(path), Some(Node::File(_)))
    }

    fn isdir(&self, path: &DirectoryPath) -> bool {
        matches!(self.state().nodes.get(path), Some(Node::Dir))
    }

    fn exists(&self, path: &DirectoryPath) -> bool {
        self.state().nodes.contains_key(path)
    }

    fn readfile(&self, path: &DirectoryPath) -> FsResult<Vec<u8>> {
        let state = self.state();
        state.check_denied(path)?;
        match state.nodes.get(path) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir) => Err(FsError::IsADirectory(path.clone())),
            None => Err(FsError::NotFound(path.clone())),
        }
    }

    fn writefile(&self, path: &DirectoryPath, content: &[u8]) -> FsResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| FsError::IsADirectory(path.clone()))?;
        let mut state = self.state();
        match state.nodes.get(&parent) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => return Err(FsError::NotADirectory(parent)),
            None => return Err(FsError::NotFound(parent)),
        }
        let kind = match state.nodes.get(path) {
            Some(Node::Dir) => return Err(FsError::IsADirectory(path.clone())),
            Some(Node::File(_)) => FileSystemEventType::Modified,
            None => FileSystemEventType::Created,
        };
        state.nodes.insert(path.clone(), Node::File(content.to_vec()));
        state.emit(kind, path);
        Ok(())
    }

    fn makedirs(&self, path: &DirectoryPath) -> FsResult<()> {
        let mut state = self.state();
        let mut current = DirectoryPath::root();
        for seg in path.segments() {
            current = current
                .join(seg)
                .map_err(|_| FsError::NotFound(path.clone()))?;
            match state.nodes.get(&current) {
                Some(Node::Dir) => {}
                Some(Node::File(_)) => return Err(FsError::NotADirectory(current)),
                None => {
                    state.nodes.insert(current.clone(), Node::Dir);
                    state.emit(FileSystemEventType::Created, &current);
                }
            }
        }
        Ok(())
    }

    fn remove(&self, path: &DirectoryPath) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::PermissionDenied(path.clone()));
        }
        let mut state = self.state();
        if !state.nodes.contains_key(path) {
            return Err(FsError::NotFound(path.clone()));
        }
        let mut doomed: Vec<DirectoryPath> = state
            .nodes
            .keys()
            .filter(|k| k.starts_with(path))
            .cloned()
            .collect();
        // children before parents
        doomed.sort_by(|a, b| b.cmp(a));
        for victim in doomed {
            state.nodes.remove(&victim);
            state.emit(FileSystemEventType::Deleted, &victim);
        }
        Ok(())
    }

    fn watchdir(&self, path: &DirectoryPath, sink: EventSink) -> FsResult<()> {
        let mut state = self.state();
        match state.nodes.get(path) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => return Err(FsError::NotADirectory(path.clone())),
            None => return Err(FsError::NotFound(path.clone())),
        }
        if state.watches.contains_key(path) {
            return Err(FsError::AlreadyWatched(path.clone()));
        }
        state.watches.insert(path.clone(), sink);
        Ok(())
    }

    fn unwatchdir(&self, path: &DirectoryPath) -> FsResult<()> {
        match self.state().watches.remove(path) {
            Some(_) => Ok(()),
            None => Err(FsError::NotWatched(path.clone())),
        }
    }
}
