use crate::path::{DirectoryPath, PathError};
use thiserror::Error;

/// Failures reported by a [`FileSystem`](crate::FileSystem) implementation.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(DirectoryPath),
    #[error("not a directory: {0}")]
    NotADirectory(DirectoryPath),
    #[error("is a directory: {0}")]
    IsADirectory(DirectoryPath),
    #[error("permission denied: {0}")]
    PermissionDenied(DirectoryPath),
    #[error("already watching {0}")]
    AlreadyWatched(DirectoryPath),
    #[error("not watching {0}")]
    NotWatched(DirectoryPath),
    #[error("watch error on {path}: {message}")]
    Watch {
        path: DirectoryPath,
        message: String,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: DirectoryPath,
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    pub fn io(path: &DirectoryPath, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(path.clone()),
            std::io::ErrorKind::PermissionDenied => FsError::PermissionDenied(path.clone()),
            _ => FsError::Io {
                path: path.clone(),
                source,
            },
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// Failures of the source -> target channel itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("channel closed")]
    Closed,
    /// The target received the operation but could not apply it.
    #[error("rejected by target: {0}")]
    Rejected(String),
    #[error("encode error: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Vanished files, permission problems, full disks. Recovered locally.
    #[error(transparent)]
    TransientIo(#[from] FsError),
    /// Malformed or unknown operation. Only that operation is rejected.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The replication pair cannot be brought up at all.
    #[error("fatal: {0}")]
    Fatal(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// The source stopped watching before the operation went out.
    #[error("source stopped")]
    Stopped,
}

impl From<PathError> for ReplicationError {
    fn from(e: PathError) -> Self {
        ReplicationError::Protocol(e.to_string())
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        ReplicationError::Protocol(e.to_string())
    }
}
