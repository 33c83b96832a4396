use crate::path::DirectoryPath;
use notify::{
    event::{ModifyKind, RenameMode},
    EventKind,
};
use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileSystemEventType {
    Created,
    Modified,
    Deleted,
    /// Anything else the watcher reports (access, unknown kinds). Dropped by the source.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileSystemEvent {
    pub kind: FileSystemEventType,
    pub path: DirectoryPath,
}

impl FileSystemEvent {
    pub fn new(kind: FileSystemEventType, path: DirectoryPath) -> Self {
        Self { kind, path }
    }

    pub fn created(path: DirectoryPath) -> Self {
        Self::new(FileSystemEventType::Created, path)
    }

    pub fn modified(path: DirectoryPath) -> Self {
        Self::new(FileSystemEventType::Modified, path)
    }

    pub fn deleted(path: DirectoryPath) -> Self {
        Self::new(FileSystemEventType::Deleted, path)
    }
}

/// Where a watch registration delivers its events.
pub type EventSink = mpsc::UnboundedSender<FileSystemEvent>;
pub type EventStream = mpsc::UnboundedReceiver<FileSystemEvent>;

pub fn event_channel() -> (EventSink, EventStream) {
    mpsc::unbounded_channel()
}

/// Convert a notify::Event into zero or more (kind, host path) pairs.
pub fn events_from_notify(event: notify::Event) -> Vec<(FileSystemEventType, PathBuf)> {
    let mut out = Vec::new();
    match event.kind {
        EventKind::Create(_) => {
            for p in event.paths {
                out.push((FileSystemEventType::Created, p));
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => {
                for p in event.paths {
                    out.push((FileSystemEventType::Deleted, p));
                }
            }
            RenameMode::To => {
                for p in event.paths {
                    out.push((FileSystemEventType::Created, p));
                }
            }
            _ => {
                // rename with both ends carries (from, to)
                let mut paths = event.paths.into_iter();
                if let (Some(from), Some(to)) = (paths.next(), paths.next()) {
                    out.push((FileSystemEventType::Deleted, from));
                    out.push((FileSystemEventType::Created, to));
                }
            }
        },
        EventKind::Modify(_) => {
            for p in event.paths {
                out.push((FileSystemEventType::Modified, p));
            }
        }
        EventKind::Remove(_) => {
            for p in event.paths {
                out.push((FileSystemEventType::Deleted, p));
            }
        }
        _ => {
            for p in event.paths {
                out.push((FileSystemEventType::Other, p));
            }
        }
    }
    out
}
