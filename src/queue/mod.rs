//! Transfer queue engine.
//!
//! A queue expands its sources into leaf [`TransferItem`]s, then a driver task
//! hands them out one by one, each on its own pooled connection. Items whose
//! destination already exists wait in `pending` until [`TransferQueue::resolve`]
//! decides what to do with them.

pub mod copy;
pub mod download;
pub mod remove;
pub mod upload;

use crate::client::{ConnectionId, FileItem};
use crate::connection::{ConnectionManager, PooledHandle};
use crate::error::ConnectionError;
use crate::utils;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify, OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAction {
    Skip,
    Replace,
    /// Keep both: write to the first free `name (n).ext`.
    Rename,
}

impl fmt::Display for ConflictAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictAction::Skip => "skip",
            ConflictAction::Replace => "replace",
            ConflictAction::Rename => "rename",
        })
    }
}

impl FromStr for ConflictAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(ConflictAction::Skip),
            "replace" | "overwrite" => Ok(ConflictAction::Replace),
            "rename" | "keep-both" => Ok(ConflictAction::Rename),
            other => Err(format!(
                "unknown conflict action '{}' (expected skip, replace or rename)",
                other
            )),
        }
    }
}

/// One leaf file operation.
#[derive(Debug, Clone)]
pub struct TransferItem {
    pub seq: usize,
    pub source: FileItem,
    /// Destination root the whole selection lands in.
    pub dest_dir: String,
    /// Directories between the selected source and this file.
    pub dirs: Vec<String>,
    pub target_name: String,
    pub action: Option<ConflictAction>,
}

impl TransferItem {
    pub fn destination_dir(&self) -> String {
        utils::join_all(&self.dest_dir, self.dirs.iter().map(String::as_str))
    }

    pub fn destination(&self) -> String {
        utils::join(&self.destination_dir(), &self.target_name)
    }

    /// Every directory from the destination root down to the item's own.
    pub fn touched_dirs(&self) -> impl Iterator<Item = String> + '_ {
        (0..=self.dirs.len()).map(|depth| {
            utils::join_all(&self.dest_dir, self.dirs[..depth].iter().map(String::as_str))
        })
    }

    /// The path the user originally selected this item through.
    pub fn source_root(&self) -> String {
        (0..self.dirs.len()).fold(self.source.path.clone(), |path, _| utils::parent(&path))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueState {
    pub total_cnt: usize,
    pub done_cnt: usize,
    pub total_size: u64,
    pub done_size: u64,
    pub pending_cnt: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    State(QueueState),
    Conflict { source: String, destination: String },
    Error { path: String, reason: String },
    Complete,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransferOptions {
    /// Items in flight at once, on top of whatever the pool allows.
    pub max_concurrent: Option<usize>,
    /// Answer every conflict with this from the start.
    pub on_conflict: Option<ConflictAction>,
}

/// What a concrete queue (download, upload, copy...) plugs into the engine.
#[async_trait]
pub trait TransferJob: Send + Sync {
    /// Endpoint the sources are listed on.
    fn source(&self) -> &ConnectionId;

    fn connections(&self) -> &ConnectionManager;

    /// Last chance to rewrite items after expansion, before totals are fixed.
    async fn prepare(&self, _items: &mut Vec<TransferItem>) {}

    async fn acquire(&self) -> Result<PooledHandle, ConnectionError>;

    async fn exists(&self, handle: &PooledHandle, destination: &str) -> Result<bool>;

    async fn transfer(
        &self,
        handle: &PooledHandle,
        item: &TransferItem,
        destination: &str,
    ) -> Result<()>;

    /// Runs once after the last item settles.
    async fn finalize(&self);

    /// Action applied to conflicts nobody answered.
    fn default_action(&self) -> Option<ConflictAction> {
        None
    }
}

/// Lists `sources` (recursing into directories) into transfer items bound for
/// `destination`. Listing failures are reported and the source skipped.
pub async fn expand(
    job: &dyn TransferJob,
    sources: &[String],
    destination: &str,
    events: &mpsc::UnboundedSender<QueueEvent>,
) -> Vec<TransferItem> {
    let connections = job.connections();
    let id = job.source();
    let mut parents: HashMap<String, Vec<FileItem>> = HashMap::new();
    let mut items = Vec::new();

    for source in utils::remove_nested(sources) {
        let parent = utils::parent(&source);
        if !parents.contains_key(&parent) {
            match connections.list(id, &parent).await {
                Ok(listing) => {
                    parents.insert(parent.clone(), listing);
                }
                Err(e) => {
                    report(events, &source, &e);
                    continue;
                }
            }
        }
        let name = utils::basename(&source);
        let Some(root) = parents
            .get(&parent)
            .and_then(|listing| listing.iter().find(|item| item.name == name))
            .cloned()
        else {
            report(events, &source, &anyhow::anyhow!("no such file or directory"));
            continue;
        };

        let mut stack = vec![(root, Vec::<String>::new())];
        while let Some((item, dirs)) = stack.pop() {
            if !item.is_dir {
                items.push(TransferItem {
                    seq: items.len(),
                    target_name: item.name.clone(),
                    source: item,
                    dest_dir: destination.to_string(),
                    dirs,
                    action: None,
                });
                continue;
            }
            // A selected link is followed; links met while recursing are not.
            if item.symlink_target.is_some() && !dirs.is_empty() {
                debug!(path = %item.path, "not following directory link");
                continue;
            }
            match connections.list(id, &item.path).await {
                Ok(children) => {
                    let mut trail = dirs;
                    trail.push(item.name.clone());
                    for child in children.into_iter().rev() {
                        stack.push((child, trail.clone()));
                    }
                }
                Err(e) => report(events, &item.path, &e),
            }
        }
    }
    items
}

fn report(events: &mpsc::UnboundedSender<QueueEvent>, path: &str, err: &anyhow::Error) {
    warn!(path = %path, error = %err, "transfer error");
    let _ = events.send(QueueEvent::Error {
        path: path.to_string(),
        reason: format!("{:#}", err),
    });
}

#[derive(Default)]
struct Progress {
    ready: VecDeque<TransferItem>,
    pending: Vec<TransferItem>,
    for_all: Option<ConflictAction>,
    state: QueueState,
}

struct Shared {
    job: Arc<dyn TransferJob>,
    progress: Mutex<Progress>,
    wakeup: Notify,
    stopped: AtomicBool,
    events: mpsc::UnboundedSender<QueueEvent>,
    done: watch::Sender<bool>,
    limiter: Option<Arc<Semaphore>>,
}

impl Shared {
    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn finish_item(&self, item: &TransferItem) {
        let state = {
            let mut progress = self.progress.lock();
            progress.state.done_cnt += 1;
            progress.state.done_size += item.source.size;
            progress.state
        };
        self.emit(QueueEvent::State(state));
    }

    fn fail_item(&self, item: &TransferItem, err: &anyhow::Error) {
        report(&self.events, &item.source.path, err);
        self.finish_item(item);
    }

    fn park(&self, mut item: TransferItem) {
        let mut progress = self.progress.lock();
        if let Some(action) = progress.for_all {
            // Answered for all while this item was being checked.
            item.action = Some(action);
            progress.ready.push_front(item);
            drop(progress);
            self.wakeup.notify_one();
            return;
        }
        let destination = item.destination();
        let source = item.source.path.clone();
        progress.pending.push(item);
        progress.state.pending_cnt = progress.pending.len();
        if progress.pending.len() == 1 {
            debug!(source = %source, destination = %destination, "conflict");
            self.emit(QueueEvent::Conflict {
                source,
                destination,
            });
        }
        self.emit(QueueEvent::State(progress.state));
        drop(progress);
        self.wakeup.notify_one();
    }

    async fn free_name(&self, handle: &PooledHandle, item: &TransferItem) -> Result<String> {
        let dir = item.destination_dir();
        let mut n = 1;
        loop {
            let candidate = utils::join(&dir, &utils::numbered_name(&item.target_name, n));
            if !self.job.exists(handle, &candidate).await? {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    async fn run_item(
        self: Arc<Self>,
        item: TransferItem,
        handle: PooledHandle,
        _permit: Option<OwnedSemaphorePermit>,
    ) {
        let destination = item.destination();
        let exists = match self.job.exists(&handle, &destination).await {
            Ok(exists) => exists,
            Err(e) => return self.fail_item(&item, &e),
        };

        let target = if !exists {
            destination
        } else {
            let for_all = self.progress.lock().for_all;
            match item.action.or(for_all).or(self.job.default_action()) {
                None => {
                    drop(handle);
                    return self.park(item);
                }
                Some(ConflictAction::Skip) => {
                    debug!(path = %destination, "skipping existing destination");
                    return self.finish_item(&item);
                }
                Some(ConflictAction::Replace) => destination,
                Some(ConflictAction::Rename) => match self.free_name(&handle, &item).await {
                    Ok(target) => target,
                    Err(e) => return self.fail_item(&item, &e),
                },
            }
        };

        match self.job.transfer(&handle, &item, &target).await {
            Ok(()) => {
                debug!(source = %item.source.path, target = %target, "transferred");
                self.finish_item(&item);
            }
            Err(e) => self.fail_item(&item, &e),
        }
    }

    fn idle(&self) -> bool {
        let progress = self.progress.lock();
        progress.ready.is_empty() && progress.pending.is_empty()
    }

    async fn drive(self: Arc<Self>) {
        let mut tasks = JoinSet::new();
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            let next = self.progress.lock().ready.pop_front();
            match next {
                Some(item) => {
                    let permit = match &self.limiter {
                        Some(limiter) => limiter.clone().acquire_owned().await.ok(),
                        None => None,
                    };
                    match self.job.acquire().await {
                        Ok(handle) => {
                            tasks.spawn(self.clone().run_item(item, handle, permit));
                        }
                        Err(e) => self.fail_item(&item, &e.into()),
                    }
                }
                None => {
                    if tasks.is_empty() && self.idle() {
                        break;
                    }
                    tokio::select! {
                        _ = self.wakeup.notified() => {}
                        Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                            if let Err(e) = joined {
                                warn!(error = %e, "transfer task failed");
                            }
                        }
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "transfer task failed");
            }
        }
        self.job.finalize().await;

        let state = self.progress.lock().state;
        info!(
            done = state.done_cnt,
            total = state.total_cnt,
            bytes = state.done_size,
            "queue complete"
        );
        self.emit(QueueEvent::State(state));
        self.emit(QueueEvent::Complete);
        self.done.send_replace(true);
    }
}

/// A running transfer queue. Cheap to clone; all clones drive the same queue.
#[derive(Clone)]
pub struct TransferQueue {
    shared: Arc<Shared>,
}

impl TransferQueue {
    /// Expands `sources`, fixes the totals and starts processing.
    pub async fn spawn(
        job: Arc<dyn TransferJob>,
        sources: Vec<String>,
        destination: String,
        options: TransferOptions,
    ) -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let mut items = expand(job.as_ref(), &sources, &destination, &events).await;
        job.prepare(&mut items).await;

        let state = QueueState {
            total_cnt: items.len(),
            total_size: items.iter().map(|item| item.source.size).sum(),
            ..QueueState::default()
        };
        debug!(items = state.total_cnt, bytes = state.total_size, "queue expanded");
        let _ = events.send(QueueEvent::State(state));

        let (done, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            job,
            progress: Mutex::new(Progress {
                ready: items.into(),
                pending: Vec::new(),
                for_all: options.on_conflict,
                state,
            }),
            wakeup: Notify::new(),
            stopped: AtomicBool::new(false),
            events,
            done,
            limiter: options
                .max_concurrent
                .map(|limit| Arc::new(Semaphore::new(limit.max(1)))),
        });
        tokio::spawn(shared.clone().drive());
        (Self { shared }, rx)
    }

    /// Answers the conflict at the head of `pending`, or every pending conflict
    /// (and all future ones) with `for_all`.
    pub fn resolve(&self, action: ConflictAction, for_all: bool) {
        let mut progress = self.shared.progress.lock();
        if progress.pending.is_empty() {
            return;
        }
        let mut resolved = if for_all {
            progress.for_all = Some(action);
            std::mem::take(&mut progress.pending)
        } else {
            vec![progress.pending.remove(0)]
        };
        resolved.sort_by_key(|item| item.seq);
        for mut item in resolved.into_iter().rev() {
            item.action = Some(action);
            progress.ready.push_front(item);
        }

        progress.state.pending_cnt = progress.pending.len();
        if let Some(head) = progress.pending.first() {
            self.shared.emit(QueueEvent::Conflict {
                source: head.source.path.clone(),
                destination: head.destination(),
            });
        }
        self.shared.emit(QueueEvent::State(progress.state));
        drop(progress);
        self.shared.wakeup.notify_one();
    }

    /// Stops handing out new items. In-flight work still finishes.
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::SeqCst) {
            debug!("queue stopping");
        }
        self.shared.wakeup.notify_one();
    }

    /// Stops the queue and waits for it to complete.
    pub async fn close(&self) {
        self.stop();
        self.wait().await;
    }

    pub async fn wait(&self) {
        let mut done = self.shared.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    pub fn state(&self) -> QueueState {
        self.shared.progress.lock().state
    }

    pub fn is_complete(&self) -> bool {
        *self.shared.done.borrow()
    }
}

/// Creates destination directories at most once per queue, however many items
/// race to need them.
#[derive(Default)]
pub struct DirMaker {
    made: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl DirMaker {
    /// Makes every directory from `root` down through `dirs`.
    pub async fn ensure(&self, handle: &PooledHandle, root: &str, dirs: &[String]) {
        let mut path = root.to_string();
        for dir in dirs {
            path = utils::join(&path, dir);
            let cell = self.made.lock().entry(path.clone()).or_default().clone();
            cell.get_or_init(|| async {
                // Already existing is the common failure; the transfer
                // itself reports anything worse.
                if let Err(e) = handle.mkdir(&path).await {
                    debug!(path = %path, error = %e, "mkdir failed");
                }
            })
            .await;
        }
    }
}

/// Remote directory listings memoized for conflict checks.
#[derive(Default)]
pub struct ListingCache {
    names: Mutex<HashMap<String, Arc<OnceCell<Mutex<HashSet<String>>>>>>,
}

impl ListingCache {
    pub async fn exists(&self, handle: &PooledHandle, path: &str) -> bool {
        let dir = utils::parent(path);
        let cell = self.names.lock().entry(dir.clone()).or_default().clone();
        let names = cell
            .get_or_init(|| async {
                // A directory that can't be listed doesn't exist yet.
                let names = match handle.ls(&dir).await {
                    Ok(items) => items.into_iter().map(|item| item.name).collect(),
                    Err(_) => HashSet::new(),
                };
                Mutex::new(names)
            })
            .await;
        let names = names.lock();
        names.contains(utils::basename(path))
    }

    /// Records a name this queue has just written.
    pub fn insert(&self, path: &str) {
        let cell = self.names.lock().get(&utils::parent(path)).cloned();
        if let Some(names) = cell.as_ref().and_then(|cell| cell.get()) {
            names.lock().insert(utils::basename(path).to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FileItem;

    fn item(seq: usize, path: &str, dirs: &[&str]) -> TransferItem {
        let source = FileItem::file(path, 10);
        TransferItem {
            seq,
            target_name: source.name.clone(),
            source,
            dest_dir: "/dst".to_string(),
            dirs: dirs.iter().map(|d| d.to_string()).collect(),
            action: None,
        }
    }

    #[test]
    fn test_destination_paths() {
        let nested = item(0, "/src/sub/deeper/b", &["src", "sub", "deeper"]);
        assert_eq!(nested.destination_dir(), "/dst/src/sub/deeper");
        assert_eq!(nested.destination(), "/dst/src/sub/deeper/b");
        assert_eq!(nested.source_root(), "/src");

        let flat = item(1, "/src/a", &[]);
        assert_eq!(flat.destination(), "/dst/a");
        assert_eq!(flat.source_root(), "/src/a");
    }

    #[test]
    fn test_conflict_action_parsing() {
        assert_eq!("skip".parse::<ConflictAction>(), Ok(ConflictAction::Skip));
        assert_eq!("Replace".parse::<ConflictAction>(), Ok(ConflictAction::Replace));
        assert_eq!("keep-both".parse::<ConflictAction>(), Ok(ConflictAction::Rename));
        assert!("merge".parse::<ConflictAction>().is_err());
        assert_eq!(ConflictAction::Rename.to_string(), "rename");
    }
}
