//! [`FileSystem`] backed by a directory on the host disk.

use crate::{
    error::{FsError, FsResult},
    event::{events_from_notify, EventSink, FileSystemEvent},
    fs::FileSystem,
    path::DirectoryPath,
};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Exposes the tree below `base` as a filesystem whose root `/` is `base`.
/// Host paths never appear in events or errors.
pub struct LocalFileSystem {
    base: PathBuf,
    watchers: Mutex<HashMap<DirectoryPath, RecommendedWatcher>>,
}

impl std::fmt::Debug for LocalFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileSystem")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl LocalFileSystem {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn host_path(&self, path: &DirectoryPath) -> PathBuf {
        let mut out = self.base.clone();
        for seg in path.segments() {
            out.push(seg);
        }
        out
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<DirectoryPath, RecommendedWatcher>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Map a host path reported by notify back into the filesystem namespace.
fn to_directory_path(base: &Path, host: &Path) -> Option<DirectoryPath> {
    let rel = host.strip_prefix(base).ok()?;
    let rel = rel.to_string_lossy().replace('\\', "/");
    DirectoryPath::parse(&rel).ok()
}

impl FileSystem for LocalFileSystem {
    fn listdir(&self, path: &DirectoryPath) -> FsResult<Vec<String>> {
        let host = self.host_path(path);
        let entries = std::fs::read_dir(&host).map_err(|e| FsError::io(path, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FsError::io(path, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn isfile(&self, path: &DirectoryPath) -> bool {
        self.host_path(path).is_file()
    }

    fn isdir(&self, path: &DirectoryPath) -> bool {
        self.host_path(path).is_dir()
    }

    fn exists(&self, path: &DirectoryPath) -> bool {
        self.host_path(path).exists()
    }

    fn readfile(&self, path: &DirectoryPath) -> FsResult<Vec<u8>> {
        let host = self.host_path(path);
        if host.is_dir() {
            return Err(FsError::IsADirectory(path.clone()));
        }
        std::fs::read(host).map_err(|e| FsError::io(path, e))
    }

    fn writefile(&self, path: &DirectoryPath, content: &[u8]) -> FsResult<()> {
        let host = self.host_path(path);
        if host.is_dir() {
            return Err(FsError::IsADirectory(path.clone()));
        }
        std::fs::write(host, content).map_err(|e| FsError::io(path, e))
    }

    fn makedirs(&self, path: &DirectoryPath) -> FsResult<()> {
        let host = self.host_path(path);
        if host.is_file() {
            return Err(FsError::NotADirectory(path.clone()));
        }
        std::fs::create_dir_all(host).map_err(|e| FsError::io(path, e))
    }

    fn remove(&self, path: &DirectoryPath) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::PermissionDenied(path.clone()));
        }
        let host = self.host_path(path);
        let meta = std::fs::symlink_metadata(&host).map_err(|e| FsError::io(path, e))?;
        if meta.is_dir() {
            std::fs::remove_dir_all(host).map_err(|e| FsError::io(path, e))
        } else {
            std::fs::remove_file(host).map_err(|e| FsError::io(path, e))
        }
    }

    fn watchdir(&self, path: &DirectoryPath, sink: EventSink) -> FsResult<()> {
        let mut watchers = self.watchers();
        if watchers.contains_key(path) {
            return Err(FsError::AlreadyWatched(path.clone()));
        }
        let host = self.host_path(path);
        // notify reports canonical paths on some platforms
        let base = self.base.canonicalize().unwrap_or_else(|_| self.base.clone());
        let raw_base = self.base.clone();
        let watch_path = path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for (kind, host_path) in events_from_notify(event) {
                        let mapped = to_directory_path(&base, &host_path)
                            .or_else(|| to_directory_path(&raw_base, &host_path));
                        if let Some(p) = mapped {
                            let _ = sink.send(FileSystemEvent::new(kind, p));
                        }
                    }
                }
                Err(e) => tracing::warn!(path = %watch_path, "watch error: {e}"),
            },
            notify::Config::default(),
        )
        .map_err(|e| FsError::Watch {
            path: path.clone(),
            message: e.to_string(),
        })?;
        watcher
            .watch(&host, RecursiveMode::Recursive)
            .map_err(|e| FsError::Watch {
                path: path.clone(),
                message: e.to_string(),
            })?;
        watchers.insert(path.clone(), watcher);
        Ok(())
    }

    fn unwatchdir(&self, path: &DirectoryPath) -> FsResult<()> {
        let mut watcher = self
            .watchers()
            .remove(path)
            .ok_or_else(|| FsError::NotWatched(path.clone()))?;
        if let Err(e) = watcher.unwatch(&self.host_path(path)) {
            // the directory may already be gone; dropping the watcher releases it anyway
            tracing::debug!(path = %path, "unwatch: {e}");
        }
        Ok(())
    }
}
