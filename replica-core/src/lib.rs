//! Core library for replica – one-way directory replication over an RPC channel.
//!
//! A [`ReplicatorSource`] walks its tree once, then turns watcher events into
//! [`ReplicationOperation`]s and pushes them through an [`RpcChannel`]. A
//! [`ReplicatorTarget`] applies those operations idempotently to its own
//! [`FileSystem`].

mod error;
mod event;
mod filter;
mod fs;
mod local;
mod manager;
mod memory;
mod operation;
mod options;
mod path;
mod rpc;
mod source;
mod target;

pub use error::{FsError, FsResult, ReplicationError, RpcError};
pub use event::{event_channel, events_from_notify, EventSink, EventStream, FileSystemEvent, FileSystemEventType};
pub use filter::PathFilter;
pub use fs::FileSystem;
pub use local::LocalFileSystem;
pub use manager::ReplicationManager;
pub use memory::MemoryFileSystem;
pub use operation::{encode_event, Action, ReplicationOperation};
pub use options::{Pattern, SourceOptions};
pub use path::{DirectoryPath, PathError};
pub use rpc::{channel, serve, ChannelReceiver, ChannelSender, LoopbackChannel, Request, RpcChannel};
pub use source::{EventOutcome, ReplicatorSource, SkippedEntry, SyncReport, WatchState};
pub use target::ReplicatorTarget;
