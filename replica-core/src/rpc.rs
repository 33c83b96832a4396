use crate::{
    error::{ReplicationError, RpcError},
    operation::ReplicationOperation,
    path::DirectoryPath,
    target::ReplicatorTarget,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Ordered, reliable path from a source to its target.
#[async_trait]
pub trait RpcChannel: Send + Sync + 'static {
    /// Deliver one operation. Returns once the target has applied it or
    /// refused it.
    async fn send(&self, op: ReplicationOperation) -> Result<(), RpcError>;
    /// Whether a root-relative path is already present on the target.
    async fn exists(&self, path: &DirectoryPath) -> Result<bool, RpcError>;
}

fn rejected(e: ReplicationError) -> RpcError {
    RpcError::Rejected(e.to_string())
}

/// Hands operations straight to an in-process target.
#[derive(Debug, Clone)]
pub struct LoopbackChannel {
    target: Arc<ReplicatorTarget>,
}

impl LoopbackChannel {
    pub fn new(target: Arc<ReplicatorTarget>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl RpcChannel for LoopbackChannel {
    async fn send(&self, op: ReplicationOperation) -> Result<(), RpcError> {
        self.target.handle_request(op).map_err(rejected)
    }

    async fn exists(&self, path: &DirectoryPath) -> Result<bool, RpcError> {
        self.target.exists(path).map_err(rejected)
    }
}

#[derive(Debug)]
pub enum Request {
    /// Wire-encoded [`ReplicationOperation`].
    Apply {
        payload: Vec<u8>,
        ack: oneshot::Sender<Result<(), RpcError>>,
    },
    Exists {
        path: DirectoryPath,
        reply: oneshot::Sender<Result<bool, RpcError>>,
    },
}

/// Sending half of a message-passing channel; see [`channel`].
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<Request>,
}

pub type ChannelReceiver = mpsc::Receiver<Request>;

/// Message-passing transport: operations cross as wire bytes and every request
/// is acknowledged. Pair the receiver with [`serve`].
pub fn channel(capacity: usize) -> (ChannelSender, ChannelReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (ChannelSender { tx }, rx)
}

#[async_trait]
impl RpcChannel for ChannelSender {
    async fn send(&self, op: ReplicationOperation) -> Result<(), RpcError> {
        let payload = op.to_wire().map_err(|e| RpcError::Encode(e.to_string()))?;
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(Request::Apply { payload, ack })
            .await
            .map_err(|_| RpcError::Closed)?;
        ack_rx.await.map_err(|_| RpcError::Closed)?
    }

    async fn exists(&self, path: &DirectoryPath) -> Result<bool, RpcError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(Request::Exists {
                path: path.clone(),
                reply,
            })
            .await
            .map_err(|_| RpcError::Closed)?;
        reply_rx.await.map_err(|_| RpcError::Closed)?
    }
}

/// Apply requests to `target` one at a time, in arrival order, until every
/// sender is gone.
pub async fn serve(target: Arc<ReplicatorTarget>, mut rx: ChannelReceiver) {
    info!(root = %target.root(), "target serving");
    while let Some(req) = rx.recv().await {
        match req {
            Request::Apply { payload, ack } => {
                let res = target.handle_wire(&payload).map_err(rejected);
                if ack.send(res).is_err() {
                    debug!("sender went away before ack");
                }
            }
            Request::Exists { path, reply } => {
                if reply.send(target.exists(&path).map_err(rejected)).is_err() {
                    debug!(path = %path, "sender went away before exists reply");
                }
            }
        }
    }
    info!(root = %target.root(), "target channel closed");
}
