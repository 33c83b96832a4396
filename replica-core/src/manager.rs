use crate::{
    error::ReplicationError,
    fs::FileSystem,
    options::SourceOptions,
    path::DirectoryPath,
    rpc::RpcChannel,
    source::ReplicatorSource,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Running sources keyed by a caller-chosen name.
#[derive(Debug, Default)]
pub struct ReplicationManager {
    sources: HashMap<String, ReplicatorSource>,
}

impl ReplicationManager {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }

    /// Start replicating `root` under `name`. A name that is already running
    /// is left alone.
    pub async fn start(
        &mut self,
        name: impl Into<String>,
        fs: Arc<dyn FileSystem>,
        root: DirectoryPath,
        channel: Arc<dyn RpcChannel>,
        options: SourceOptions,
    ) -> Result<(), ReplicationError> {
        let name = name.into();
        if self.sources.contains_key(&name) {
            debug!(name = %name, "already running");
            return Ok(());
        }
        let source = ReplicatorSource::start_with(fs, root, channel, options).await?;
        self.sources.insert(name, source);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ReplicatorSource> {
        self.sources.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Returns whether `name` was running.
    pub async fn stop(&mut self, name: &str) -> bool {
        match self.sources.remove(name) {
            Some(source) => {
                source.stop_watching().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&mut self) {
        for (_, source) in self.sources.drain() {
            source.stop_watching().await;
        }
    }
}
