use crate::{
    error::{FsError, ReplicationError},
    fs::FileSystem,
    operation::{Action, ReplicationOperation},
    path::DirectoryPath,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Applies operations received from a [`ReplicatorSource`](crate::ReplicatorSource).
///
/// Holds no history: the filesystem itself decides whether an operation still
/// has anything to do, which is what makes re-delivery harmless.
pub struct ReplicatorTarget {
    fs: Arc<dyn FileSystem>,
    root: DirectoryPath,
}

impl std::fmt::Debug for ReplicatorTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatorTarget")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ReplicatorTarget {
    pub fn new(fs: Arc<dyn FileSystem>, root: DirectoryPath) -> Self {
        Self { fs, root }
    }

    pub fn root(&self) -> &DirectoryPath {
        &self.root
    }

    fn resolve(&self, rel: &DirectoryPath) -> Result<DirectoryPath, ReplicationError> {
        Ok(self.root.join_path(rel)?)
    }

    /// Whether a root-relative path is present in the replica.
    pub fn exists(&self, rel: &DirectoryPath) -> Result<bool, ReplicationError> {
        Ok(self.fs.exists(&self.resolve(rel)?))
    }

    /// Decode a wire-encoded operation and apply it.
    pub fn handle_wire(&self, bytes: &[u8]) -> Result<(), ReplicationError> {
        let op = ReplicationOperation::from_wire(bytes)?;
        self.handle_request(op)
    }

    pub fn handle_request(&self, op: ReplicationOperation) -> Result<(), ReplicationError> {
        let target = self.resolve(&op.path)?;
        let result = match (op.action, op.content) {
            (Action::Copy, None) => self.fs.makedirs(&target).map_err(Into::into),
            (Action::Copy | Action::Modify, Some(content)) => self.write(&target, &content),
            (Action::Modify, None) => Err(ReplicationError::Protocol(format!(
                "modify without content for {}",
                op.path
            ))),
            (Action::Delete, _) => self.delete(&op.path, &target),
        };
        match &result {
            Ok(()) => debug!(action = ?op.action, path = %op.path, "applied"),
            Err(e) => warn!(action = ?op.action, path = %op.path, "apply failed: {e}"),
        }
        result
    }

    fn write(&self, target: &DirectoryPath, content: &[u8]) -> Result<(), ReplicationError> {
        if let Some(parent) = target.parent() {
            if !self.fs.isdir(&parent) {
                self.fs.makedirs(&parent)?;
            }
        }
        self.fs.writefile(target, content)?;
        Ok(())
    }

    fn delete(&self, rel: &DirectoryPath, target: &DirectoryPath) -> Result<(), ReplicationError> {
        if rel.is_root() {
            return Err(ReplicationError::Protocol(
                "refusing to delete the replica root".to_string(),
            ));
        }
        match self.fs.remove(target) {
            Ok(()) => Ok(()),
            // already gone: a later delete was applied first or it never existed here
            Err(FsError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
