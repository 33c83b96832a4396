use crate::{
    error::ReplicationError,
    event::{FileSystemEvent, FileSystemEventType},
    fs::FileSystem,
    path::DirectoryPath,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Copy,
    Modify,
    Delete,
}

/// Single unit of change sent from source to target.
///
/// `path` is always relative to the replicated root, so the same operation is
/// valid for any target root. Applying an operation twice leaves the target in
/// the same state as applying it once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationOperation {
    pub action: Action,
    pub path: DirectoryPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
}

impl ReplicationOperation {
    pub fn copy(path: DirectoryPath, content: Vec<u8>) -> Self {
        Self {
            action: Action::Copy,
            path,
            content: Some(content),
        }
    }

    /// A content-less copy: make sure the directory exists on the target.
    pub fn directory(path: DirectoryPath) -> Self {
        Self {
            action: Action::Copy,
            path,
            content: None,
        }
    }

    pub fn modify(path: DirectoryPath, content: Vec<u8>) -> Self {
        Self {
            action: Action::Modify,
            path,
            content: Some(content),
        }
    }

    pub fn delete(path: DirectoryPath) -> Self {
        Self {
            action: Action::Delete,
            path,
            content: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.action == Action::Copy && self.content.is_none()
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, ReplicationError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, ReplicationError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Translate one watcher event into the operation to send, if any.
///
/// File content is read here, at encode time, so the target receives what the
/// file holds now rather than when the event fired. A failed read is returned
/// as an error and the caller decides whether to drop the event.
pub fn encode_event(
    fs: &dyn FileSystem,
    root: &DirectoryPath,
    event: &FileSystemEvent,
) -> Result<Option<ReplicationOperation>, ReplicationError> {
    let rel = match event.path.strip_root(root) {
        Some(rel) if !rel.is_root() => rel,
        _ => return Ok(None),
    };
    let op = match event.kind {
        FileSystemEventType::Created => {
            if fs.isdir(&event.path) {
                ReplicationOperation::directory(rel)
            } else {
                ReplicationOperation::copy(rel, fs.readfile(&event.path)?)
            }
        }
        FileSystemEventType::Modified => {
            // directory mtime changes carry nothing to replicate
            if fs.isdir(&event.path) {
                return Ok(None);
            }
            ReplicationOperation::modify(rel, fs.readfile(&event.path)?)
        }
        FileSystemEventType::Deleted => ReplicationOperation::delete(rel),
        FileSystemEventType::Other => return Ok(None),
    };
    Ok(Some(op))
}
