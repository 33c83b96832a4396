use crate::{
    error::{FsError, ReplicationError, RpcError},
    event::{event_channel, EventStream, FileSystemEvent, FileSystemEventType},
    filter::PathFilter,
    fs::FileSystem,
    operation::{encode_event, ReplicationOperation},
    options::SourceOptions,
    path::DirectoryPath,
    rpc::RpcChannel,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How a walk treats the entries it meets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkMode {
    /// Ask the target first and send only what it lacks.
    Reconcile,
    /// Send everything; used for subtrees that just appeared under the root.
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Only while the source is being constructed.
    Unwatched,
    Watching,
    Stopped,
}

/// What became of one watcher event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Sent,
    /// Nothing to replicate: unknown kind, filtered, outside the root.
    Ignored,
    /// Content could not be read or the target never accepted the operation.
    Dropped,
    /// Arrived after `stop_watching`.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub path: DirectoryPath,
    pub reason: String,
}

/// Outcome of one initial synchronization walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub files_copied: usize,
    pub directories_created: usize,
    pub already_present: usize,
    pub filtered: usize,
    pub skipped: Vec<SkippedEntry>,
}

impl SyncReport {
    pub fn transfers(&self) -> usize {
        self.files_copied + self.directories_created
    }
}

struct SourceInner {
    fs: Arc<dyn FileSystem>,
    root: DirectoryPath,
    channel: Arc<dyn RpcChannel>,
    filter: PathFilter,
    options: SourceOptions,
    state: RwLock<WatchState>,
    /// Set while the filesystem holds our watch registration.
    registered: AtomicBool,
}

/// Source side of a replication pair.
///
/// Construction walks the tree once and only then registers the watch, so no
/// live event is processed while the walk runs. Events are drained by a single
/// task in the order the watcher delivered them.
pub struct ReplicatorSource {
    inner: Arc<SourceInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    report: SyncReport,
}

impl std::fmt::Debug for ReplicatorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatorSource")
            .field("root", &self.inner.root)
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}

impl ReplicatorSource {
    pub async fn start(
        fs: Arc<dyn FileSystem>,
        root: DirectoryPath,
        channel: Arc<dyn RpcChannel>,
    ) -> Result<Self, ReplicationError> {
        Self::start_with(fs, root, channel, SourceOptions::default()).await
    }

    pub async fn start_with(
        fs: Arc<dyn FileSystem>,
        root: DirectoryPath,
        channel: Arc<dyn RpcChannel>,
        options: SourceOptions,
    ) -> Result<Self, ReplicationError> {
        if !fs.isdir(&root) {
            return Err(ReplicationError::Fatal(format!(
                "source root {root} is not a directory"
            )));
        }
        let inner = Arc::new(SourceInner {
            filter: PathFilter::new(&options.include, &options.exclude),
            fs,
            root,
            channel,
            options,
            state: RwLock::new(WatchState::Unwatched),
            registered: AtomicBool::new(false),
        });

        let report = inner.initial_sync().await?;
        info!(
            root = %inner.root,
            files = report.files_copied,
            dirs = report.directories_created,
            present = report.already_present,
            skipped = report.skipped.len(),
            "initial sync done"
        );

        let (sink, events) = event_channel();
        {
            let mut state = inner.state.write().await;
            inner.fs.watchdir(&inner.root, sink).map_err(|e| {
                ReplicationError::Fatal(format!("cannot watch {}: {e}", inner.root))
            })?;
            inner.registered.store(true, Ordering::SeqCst);
            *state = WatchState::Watching;
        }
        let worker = tokio::spawn(run_events(inner.clone(), events));
        info!(root = %inner.root, "watching");

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
            report,
        })
    }

    pub fn root(&self) -> &DirectoryPath {
        &self.inner.root
    }

    /// Report of the walk performed at construction.
    pub fn report(&self) -> &SyncReport {
        &self.report
    }

    pub async fn state(&self) -> WatchState {
        *self.inner.state.read().await
    }

    /// Walk the tree again, sending whatever the target is missing. Safe to
    /// repeat: entries already on the target are not transferred twice.
    pub async fn initial_sync(&self) -> Result<SyncReport, ReplicationError> {
        self.inner.initial_sync().await
    }

    /// Encode one event and deliver it. Failures are logged and reported in
    /// the outcome, never returned.
    pub async fn handle_event(&self, event: FileSystemEvent) -> EventOutcome {
        self.inner.handle_event(event).await
    }

    /// Release the watch registration. Calling it again is a no-op. Once it
    /// returns no further event reaches the channel.
    pub async fn stop_watching(&self) {
        {
            // waits for a send attempt in flight; backoff sleeps hold no lock
            let mut state = self.inner.state.write().await;
            if !self.inner.release_watch() {
                debug!(root = %self.inner.root, "stop_watching on a stopped source");
            }
            *state = WatchState::Stopped;
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.abort();
        }
    }
}

impl Drop for ReplicatorSource {
    fn drop(&mut self) {
        if let Some(worker) = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            worker.abort();
        }
        // the aborted worker may still hold a read guard until its next poll,
        // so the registration is released without the state lock
        self.inner.release_watch();
        match self.inner.state.try_write() {
            Ok(mut state) => *state = WatchState::Stopped,
            Err(_) => debug!(root = %self.inner.root, "state busy at drop"),
        }
    }
}

async fn run_events(inner: Arc<SourceInner>, mut events: EventStream) {
    while let Some(event) = events.recv().await {
        if inner.handle_event(event).await == EventOutcome::Stopped {
            break;
        }
    }
    debug!(root = %inner.root, "event stream closed");
}

impl SourceInner {
    /// Unregister the watch if we still hold it. Returns whether it was held.
    fn release_watch(&self) -> bool {
        if !self.registered.swap(false, Ordering::SeqCst) {
            return false;
        }
        match self.fs.unwatchdir(&self.root) {
            Ok(()) => info!(root = %self.root, "stopped watching"),
            Err(FsError::NotWatched(_)) | Err(FsError::NotFound(_)) => {
                debug!(root = %self.root, "watch already released")
            }
            Err(e) => warn!(root = %self.root, "unwatch failed: {e}"),
        }
        true
    }

    async fn is_watching(&self) -> bool {
        *self.state.read().await == WatchState::Watching
    }

    async fn initial_sync(&self) -> Result<SyncReport, ReplicationError> {
        let mut report = SyncReport::default();
        let names = self.fs.listdir(&self.root)?;
        self.walk(&DirectoryPath::root(), names, WalkMode::Reconcile, &mut report)
            .await;
        Ok(report)
    }

    /// Depth-first pre-order walk below `dir` (root-relative). Per-entry
    /// failures land in `report.skipped` and the walk moves on.
    async fn walk(
        &self,
        dir: &DirectoryPath,
        names: Vec<String>,
        mode: WalkMode,
        report: &mut SyncReport,
    ) {
        // children are pushed in reverse so they pop in name order
        let mut stack: Vec<DirectoryPath> = Vec::new();
        push_children(&mut stack, dir, names, report);

        while let Some(rel) = stack.pop() {
            match self.sync_entry(&rel, mode, &mut stack, report).await {
                Ok(()) => {}
                Err(ReplicationError::Stopped) => {
                    debug!(path = %rel, "walk cut short by stop");
                    break;
                }
                Err(e) => {
                    warn!(path = %rel, "walk skipped entry: {e}");
                    report.skipped.push(SkippedEntry {
                        path: rel,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn sync_entry(
        &self,
        rel: &DirectoryPath,
        mode: WalkMode,
        stack: &mut Vec<DirectoryPath>,
        report: &mut SyncReport,
    ) -> Result<(), ReplicationError> {
        let source = self.root.join_path(rel)?;
        if self.fs.isfile(&source) {
            if !self.filter.check(rel) {
                report.filtered += 1;
                return Ok(());
            }
            if mode == WalkMode::Reconcile && self.channel.exists(rel).await? {
                report.already_present += 1;
                return Ok(());
            }
            let content = self.fs.readfile(&source)?;
            self.transfer(ReplicationOperation::copy(rel.clone(), content), mode)
                .await?;
            report.files_copied += 1;
        } else if self.fs.isdir(&source) {
            if !self.filter.check_dir(rel) {
                report.filtered += 1;
                return Ok(());
            }
            if mode == WalkMode::Reconcile && self.channel.exists(rel).await? {
                report.already_present += 1;
            } else {
                self.transfer(ReplicationOperation::directory(rel.clone()), mode)
                    .await?;
                report.directories_created += 1;
            }
            let names = self.fs.listdir(&source)?;
            push_children(stack, rel, names, report);
        } else {
            debug!(path = %rel, "entry vanished during walk");
        }
        Ok(())
    }

    async fn transfer(
        &self,
        op: ReplicationOperation,
        mode: WalkMode,
    ) -> Result<(), ReplicationError> {
        match mode {
            WalkMode::Reconcile => Ok(self.channel.send(op).await?),
            WalkMode::Live => self.send_with_retry(op).await,
        }
    }

    async fn handle_event(&self, event: FileSystemEvent) -> EventOutcome {
        if !self.is_watching().await {
            debug!(path = %event.path, kind = ?event.kind, "event after stop dropped");
            return EventOutcome::Stopped;
        }
        match event.path.strip_root(&self.root) {
            Some(rel) if !rel.is_root() && self.filter.check(&rel) => {}
            _ => return EventOutcome::Ignored,
        }
        let op = match encode_event(self.fs.as_ref(), &self.root, &event) {
            Ok(Some(op)) => op,
            Ok(None) => return EventOutcome::Ignored,
            Err(e) => {
                // usually deleted before we got to read it; its Deleted event follows
                warn!(path = %event.path, kind = ?event.kind, "skipping event: {e}");
                return EventOutcome::Dropped;
            }
        };
        let (action, path) = (op.action, op.path.clone());
        // a directory that appears already populated (moved in, renamed) gets
        // no events for what it holds
        let populated = event.kind == FileSystemEventType::Created && op.is_directory();
        match self.send_with_retry(op).await {
            Ok(()) => debug!(action = ?action, path = %path, "replicated"),
            Err(ReplicationError::Stopped) => return EventOutcome::Stopped,
            Err(e) => {
                error!(action = ?action, path = %path, "giving up on operation: {e}");
                return EventOutcome::Dropped;
            }
        }
        if populated {
            self.replicate_subtree(&path).await;
        }
        EventOutcome::Sent
    }

    fn list_relative(&self, rel: &DirectoryPath) -> Result<Vec<String>, ReplicationError> {
        Ok(self.fs.listdir(&self.root.join_path(rel)?)?)
    }

    async fn replicate_subtree(&self, rel: &DirectoryPath) {
        let names = match self.list_relative(rel) {
            Ok(names) if names.is_empty() => return,
            Ok(names) => names,
            Err(e) => {
                warn!(path = %rel, "cannot list new directory: {e}");
                return;
            }
        };
        let mut report = SyncReport::default();
        self.walk(rel, names, WalkMode::Live, &mut report).await;
        debug!(
            path = %rel,
            files = report.files_copied,
            dirs = report.directories_created,
            skipped = report.skipped.len(),
            "replicated new subtree"
        );
    }

    /// Send with retries. The state is checked before every attempt and only
    /// held for the attempt itself, so a stop never waits on a backoff.
    async fn send_with_retry(&self, op: ReplicationOperation) -> Result<(), ReplicationError> {
        let mut attempt: u32 = 0;
        let mut backoff = self.options.retry_backoff_ms;
        loop {
            let result = {
                let state = self.state.read().await;
                if *state != WatchState::Watching {
                    return Err(ReplicationError::Stopped);
                }
                self.channel.send(op.clone()).await
            };
            match result {
                Ok(()) => return Ok(()),
                Err(RpcError::Closed) => return Err(RpcError::Closed.into()),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.options.retry_max {
                        return Err(e.into());
                    }
                    warn!(path = %op.path, attempt, "send failed, retrying: {e}");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }
}

fn push_children(
    stack: &mut Vec<DirectoryPath>,
    dir: &DirectoryPath,
    mut names: Vec<String>,
    report: &mut SyncReport,
) {
    names.sort();
    for name in names.into_iter().rev() {
        match dir.join(&name) {
            Ok(child) => stack.push(child),
            Err(e) => report.skipped.push(SkippedEntry {
                path: dir.clone(),
                reason: format!("bad entry name {name:?}: {e}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::MemoryFileSystem, options::Pattern,
        rpc::LoopbackChannel, target::ReplicatorTarget,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn p(s: &str) -> DirectoryPath {
        DirectoryPath::parse(s).unwrap()
    }

    /// Loopback that counts sends and can refuse the first few.
    struct TestChannel {
        inner: LoopbackChannel,
        sends: AtomicUsize,
        fail_first: AtomicUsize,
    }

    impl TestChannel {
        fn new(target: Arc<ReplicatorTarget>) -> Self {
            Self {
                inner: LoopbackChannel::new(target),
                sends: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
            }
        }

        fn sends(&self) -> usize {
            self.sends.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RpcChannel for TestChannel {
        async fn send(&self, op: ReplicationOperation) -> Result<(), RpcError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RpcError::Rejected("disk full".into()));
            }
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.inner.send(op).await
        }

        async fn exists(&self, path: &DirectoryPath) -> Result<bool, RpcError> {
            self.inner.exists(path).await
        }
    }

    /// Loopback whose next send hangs forever once armed.
    struct StallChannel {
        inner: LoopbackChannel,
        armed: AtomicBool,
        entered: Notify,
    }

    #[async_trait]
    impl RpcChannel for StallChannel {
        async fn send(&self, op: ReplicationOperation) -> Result<(), RpcError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                std::future::pending::<()>().await;
            }
            self.inner.send(op).await
        }

        async fn exists(&self, path: &DirectoryPath) -> Result<bool, RpcError> {
            self.inner.exists(path).await
        }
    }

    struct Pair {
        src: Arc<MemoryFileSystem>,
        dst: Arc<MemoryFileSystem>,
        channel: Arc<TestChannel>,
    }

    fn pair() -> Pair {
        let src = Arc::new(MemoryFileSystem::new());
        src.makedirs(&p("/src")).unwrap();
        let dst = Arc::new(MemoryFileSystem::new());
        let target = Arc::new(ReplicatorTarget::new(dst.clone(), p("/dst")));
        let channel = Arc::new(TestChannel::new(target));
        Pair { src, dst, channel }
    }

    impl Pair {
        async fn start(&self) -> ReplicatorSource {
            self.start_with(SourceOptions::default()).await
        }

        async fn start_with(&self, options: SourceOptions) -> ReplicatorSource {
            ReplicatorSource::start_with(
                self.src.clone(),
                p("/src"),
                self.channel.clone(),
                options,
            )
            .await
            .unwrap()
        }
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn initial_sync_copies_whole_tree() {
        let t = pair();
        t.src.makedirs(&p("/src/a/b")).unwrap();
        t.src.makedirs(&p("/src/empty")).unwrap();
        t.src.writefile(&p("/src/top.txt"), b"top").unwrap();
        t.src.writefile(&p("/src/a/one"), b"1").unwrap();
        t.src.writefile(&p("/src/a/b/two"), b"2").unwrap();

        let source = t.start().await;
        assert_eq!(source.report().files_copied, 3);
        assert_eq!(source.report().directories_created, 3);
        assert!(source.report().skipped.is_empty());
        assert_eq!(t.dst.tree(&p("/dst")), t.src.tree(&p("/src")));
        assert_eq!(source.state().await, WatchState::Watching);
        source.stop_watching().await;
    }

    #[tokio::test]
    async fn second_initial_sync_transfers_nothing() {
        let t = pair();
        t.src.makedirs(&p("/src/d")).unwrap();
        t.src.writefile(&p("/src/d/f"), b"x").unwrap();
        let source = t.start().await;
        let after_first = t.channel.sends();
        assert_eq!(after_first, 2);

        let again = source.initial_sync().await.unwrap();
        assert_eq!(again.transfers(), 0);
        assert_eq!(again.already_present, 2);
        assert_eq!(t.channel.sends(), after_first);
        source.stop_watching().await;
    }

    #[tokio::test]
    async fn unreadable_entries_do_not_block_siblings() {
        let t = pair();
        t.src.writefile(&p("/src/a"), b"x").unwrap();
        t.src.writefile(&p("/src/b"), b"secret").unwrap();
        t.src.makedirs(&p("/src/locked")).unwrap();
        t.src.writefile(&p("/src/locked/inner"), b"i").unwrap();
        t.src.makedirs(&p("/src/open")).unwrap();
        t.src.writefile(&p("/src/open/c"), b"c").unwrap();
        t.src.deny_read(&p("/src/b"));
        t.src.deny_read(&p("/src/locked"));

        let source = t.start().await;
        assert_eq!(t.dst.readfile(&p("/dst/a")).unwrap(), b"x");
        assert!(!t.dst.exists(&p("/dst/b")));
        assert!(!t.dst.exists(&p("/dst/locked/inner")));
        assert_eq!(t.dst.readfile(&p("/dst/open/c")).unwrap(), b"c");

        let skipped: Vec<_> = source.report().skipped.iter().map(|s| s.path.clone()).collect();
        assert_eq!(skipped, vec![p("/b"), p("/locked")]);
        source.stop_watching().await;
    }

    #[tokio::test]
    async fn live_events_follow_the_source() {
        let t = pair();
        t.src.makedirs(&p("/src/docs")).unwrap();
        t.src.writefile(&p("/src/docs/readme.txt"), b"hello").unwrap();
        let source = t.start().await;
        assert_eq!(t.dst.readfile(&p("/dst/docs/readme.txt")).unwrap(), b"hello");

        t.src
            .writefile(&p("/src/docs/readme.txt"), b"hello world")
            .unwrap();
        eventually(|| {
            t.dst.readfile(&p("/dst/docs/readme.txt")).ok().as_deref() == Some(&b"hello world"[..])
        })
        .await;

        t.src.makedirs(&p("/src/new/deep")).unwrap();
        eventually(|| t.dst.isdir(&p("/dst/new/deep"))).await;

        t.src.remove(&p("/src/docs/readme.txt")).unwrap();
        eventually(|| !t.dst.exists(&p("/dst/docs/readme.txt"))).await;
        source.stop_watching().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_final() {
        let t = pair();
        let source = t.start().await;
        assert!(t.src.is_watched(&p("/src")));

        source.stop_watching().await;
        source.stop_watching().await;
        assert_eq!(source.state().await, WatchState::Stopped);
        assert!(!t.src.is_watched(&p("/src")));

        let sends = t.channel.sends();
        t.src.writefile(&p("/src/late"), b"x").unwrap();
        let outcome = source
            .handle_event(FileSystemEvent::created(p("/src/late")))
            .await;
        assert_eq!(outcome, EventOutcome::Stopped);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(t.channel.sends(), sends);
        assert!(!t.dst.exists(&p("/dst/late")));
    }

    #[tokio::test]
    async fn bad_events_never_kill_the_watch() {
        let t = pair();
        let source = t.start().await;

        let vanished = source
            .handle_event(FileSystemEvent::created(p("/src/ghost")))
            .await;
        assert_eq!(vanished, EventOutcome::Dropped);
        let unknown = source
            .handle_event(FileSystemEvent::new(FileSystemEventType::Other, p("/src/x")))
            .await;
        assert_eq!(unknown, EventOutcome::Ignored);
        let foreign = source
            .handle_event(FileSystemEvent::deleted(p("/elsewhere")))
            .await;
        assert_eq!(foreign, EventOutcome::Ignored);

        t.src.writefile(&p("/src/real"), b"r").unwrap();
        eventually(|| t.dst.exists(&p("/dst/real"))).await;
        source.stop_watching().await;
    }

    #[tokio::test]
    async fn watch_failure_is_fatal() {
        let t = pair();
        let (other, _rx) = event_channel();
        t.src.watchdir(&p("/src"), other).unwrap();
        let err = ReplicatorSource::start(t.src.clone(), p("/src"), t.channel.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Fatal(_)));

        let err = ReplicatorSource::start(t.src.clone(), p("/missing"), t.channel.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Fatal(_)));
    }

    #[tokio::test]
    async fn transient_send_failures_are_retried() {
        let t = pair();
        t.src.writefile(&p("/src/f"), b"v").unwrap();
        let source = t
            .start_with(SourceOptions {
                retry_backoff_ms: 1,
                ..SourceOptions::default()
            })
            .await;
        t.channel.fail_first.store(2, Ordering::SeqCst);
        let outcome = source
            .handle_event(FileSystemEvent::modified(p("/src/f")))
            .await;
        assert_eq!(outcome, EventOutcome::Sent);

        t.channel.fail_first.store(10, Ordering::SeqCst);
        let outcome = source
            .handle_event(FileSystemEvent::modified(p("/src/f")))
            .await;
        assert_eq!(outcome, EventOutcome::Dropped);
        source.stop_watching().await;
    }

    #[tokio::test]
    async fn excluded_paths_stay_local() {
        let t = pair();
        t.src.makedirs(&p("/src/target/debug")).unwrap();
        t.src.writefile(&p("/src/target/debug/app"), b"bin").unwrap();
        t.src.writefile(&p("/src/main.rs"), b"fn main() {}").unwrap();
        let source = t
            .start_with(SourceOptions {
                exclude: vec![Pattern::from("target")],
                ..SourceOptions::default()
            })
            .await;
        assert!(!t.dst.exists(&p("/dst/target")));
        assert!(t.dst.exists(&p("/dst/main.rs")));
        assert_eq!(source.report().filtered, 1);

        let outcome = source
            .handle_event(FileSystemEvent::modified(p("/src/target/debug/app")))
            .await;
        assert_eq!(outcome, EventOutcome::Ignored);
        source.stop_watching().await;
    }

    #[tokio::test]
    async fn moved_and_renamed_directories_bring_their_contents() {
        let t = pair();
        t.src.makedirs(&p("/staging/pkg/sub")).unwrap();
        t.src.writefile(&p("/staging/pkg/a.txt"), b"a").unwrap();
        t.src.writefile(&p("/staging/pkg/sub/b.txt"), b"b").unwrap();
        t.src.makedirs(&p("/src/old")).unwrap();
        t.src.writefile(&p("/src/old/c.txt"), b"c").unwrap();
        let source = t.start().await;

        t.src.rename(&p("/staging/pkg"), &p("/src/pkg")).unwrap();
        eventually(|| t.dst.tree(&p("/dst")) == t.src.tree(&p("/src"))).await;
        assert_eq!(t.dst.readfile(&p("/dst/pkg/sub/b.txt")).unwrap(), b"b");

        t.src.rename(&p("/src/old"), &p("/src/new")).unwrap();
        eventually(|| t.dst.tree(&p("/dst")) == t.src.tree(&p("/src"))).await;
        assert_eq!(t.dst.readfile(&p("/dst/new/c.txt")).unwrap(), b"c");
        assert!(!t.dst.exists(&p("/dst/old")));
        source.stop_watching().await;
    }

    #[tokio::test]
    async fn moved_in_directory_respects_filter() {
        let t = pair();
        t.src.makedirs(&p("/staging/crate/target")).unwrap();
        t.src.writefile(&p("/staging/crate/lib.rs"), b"lib").unwrap();
        t.src.writefile(&p("/staging/crate/target/out"), b"bin").unwrap();
        let source = t
            .start_with(SourceOptions {
                exclude: vec![Pattern::from("**/target")],
                ..SourceOptions::default()
            })
            .await;

        t.src.rename(&p("/staging/crate"), &p("/src/crate")).unwrap();
        // events are handled in order, so the marker lands after the walk
        t.src.writefile(&p("/src/marker"), b"m").unwrap();
        eventually(|| t.dst.exists(&p("/dst/marker"))).await;
        assert_eq!(t.dst.readfile(&p("/dst/crate/lib.rs")).unwrap(), b"lib");
        assert!(!t.dst.exists(&p("/dst/crate/target")));
        source.stop_watching().await;
    }

    #[tokio::test]
    async fn stop_does_not_wait_out_retry_backoff() {
        let t = pair();
        let source = t
            .start_with(SourceOptions {
                retry_max: 5,
                retry_backoff_ms: 60_000,
                ..SourceOptions::default()
            })
            .await;
        t.channel.fail_first.store(100, Ordering::SeqCst);
        t.src.writefile(&p("/src/f"), b"v").unwrap();
        // first attempt refused; the worker is now sleeping before the retry
        eventually(|| t.channel.fail_first.load(Ordering::SeqCst) < 100).await;

        tokio::time::timeout(Duration::from_secs(5), source.stop_watching())
            .await
            .expect("stop_watching blocked on a retry sleep");
        assert_eq!(source.state().await, WatchState::Stopped);
        assert_eq!(t.channel.sends(), 0);
        assert!(!t.dst.exists(&p("/dst/f")));
    }

    #[tokio::test]
    async fn drop_releases_watch_with_send_in_flight() {
        let src = Arc::new(MemoryFileSystem::new());
        src.makedirs(&p("/src")).unwrap();
        let dst = Arc::new(MemoryFileSystem::new());
        let target = Arc::new(ReplicatorTarget::new(dst.clone(), p("/dst")));
        let channel = Arc::new(StallChannel {
            inner: LoopbackChannel::new(target),
            armed: AtomicBool::new(false),
            entered: Notify::new(),
        });

        let source = ReplicatorSource::start(src.clone(), p("/src"), channel.clone())
            .await
            .unwrap();
        channel.armed.store(true, Ordering::SeqCst);
        src.writefile(&p("/src/f"), b"v").unwrap();
        // the worker is parked inside send, holding the state read lock
        channel.entered.notified().await;

        drop(source);
        assert!(!src.is_watched(&p("/src")));

        let again = ReplicatorSource::start(src.clone(), p("/src"), channel.clone())
            .await
            .unwrap();
        assert_eq!(again.report().files_copied, 1);
        assert_eq!(dst.readfile(&p("/dst/f")).unwrap(), b"v");
        again.stop_watching().await;
    }
}
