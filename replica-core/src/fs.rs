use crate::{
    error::FsResult,
    event::EventSink,
    path::DirectoryPath,
};

/// Filesystem collaborator used by both sides of a replication pair.
///
/// Paths are absolute within the filesystem's own namespace. Implementations
/// must be shareable across threads; the source reads from the walker and the
/// event task at the same time.
pub trait FileSystem: Send + Sync + 'static {
    /// Entry names (not paths) directly below `path`.
    fn listdir(&self, path: &DirectoryPath) -> FsResult<Vec<String>>;
    fn isfile(&self, path: &DirectoryPath) -> bool;
    fn isdir(&self, path: &DirectoryPath) -> bool;
    fn exists(&self, path: &DirectoryPath) -> bool;
    fn readfile(&self, path: &DirectoryPath) -> FsResult<Vec<u8>>;
    /// Create or truncate `path`. The parent directory must exist.
    fn writefile(&self, path: &DirectoryPath, content: &[u8]) -> FsResult<()>;
    /// Create `path` and any missing ancestors. Existing directories are fine.
    fn makedirs(&self, path: &DirectoryPath) -> FsResult<()>;
    /// Remove a file, or a directory together with everything below it.
    fn remove(&self, path: &DirectoryPath) -> FsResult<()>;
    /// Start delivering change events for everything below `path` into `sink`.
    fn watchdir(&self, path: &DirectoryPath, sink: EventSink) -> FsResult<()>;
    /// Drop the registration made by `watchdir`. Fails with `NotWatched` if none.
    fn unwatchdir(&self, path: &DirectoryPath) -> FsResult<()>;
}
