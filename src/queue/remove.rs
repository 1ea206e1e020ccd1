//! Recursive delete.
//!
//! Works on the whole tree at once instead of item by item: everything is
//! listed first, then removed one depth level at a time, deepest first, so a
//! directory is only removed after its children.

use super::{QueueEvent, QueueState, TransferOptions};
use crate::client::{ConnectionId, FileItem};
use crate::connection::ConnectionManager;
use crate::utils;
use crate::watcher::Refresh;
use anyhow::anyhow;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const DEFAULT_CONCURRENCY: usize = 4;

struct Entry {
    item: FileItem,
    depth: usize,
}

struct Shared {
    connections: ConnectionManager,
    id: ConnectionId,
    refresher: Arc<dyn Refresh>,
    concurrency: usize,
    stopped: AtomicBool,
    state: Mutex<QueueState>,
    events: mpsc::UnboundedSender<QueueEvent>,
    done: watch::Sender<bool>,
}

impl Shared {
    fn report(&self, path: &str, reason: String) {
        warn!(path = %path, error = %reason, "remove failed");
        let _ = self.events.send(QueueEvent::Error {
            path: path.to_string(),
            reason,
        });
    }

    async fn walk(&self, paths: &[String]) -> Vec<Entry> {
        let mut parents: HashMap<String, Vec<FileItem>> = HashMap::new();
        let mut entries = Vec::new();

        for path in utils::remove_nested(paths) {
            let parent = utils::parent(&path);
            if !parents.contains_key(&parent) {
                match self.connections.list(&self.id, &parent).await {
                    Ok(listing) => {
                        parents.insert(parent.clone(), listing);
                    }
                    Err(e) => {
                        self.report(&path, format!("{:#}", e));
                        continue;
                    }
                }
            }
            let name = utils::basename(&path);
            let Some(root) = parents
                .get(&parent)
                .and_then(|listing| listing.iter().find(|item| item.name == name))
                .cloned()
            else {
                self.report(&path, "no such file or directory".to_string());
                continue;
            };

            let mut stack = vec![(root, 0)];
            while let Some((item, depth)) = stack.pop() {
                // Symlinked directories are removed as links, never followed.
                if item.is_dir && item.symlink_target.is_none() {
                    match self.connections.list(&self.id, &item.path).await {
                        Ok(children) => {
                            stack.extend(children.into_iter().map(|child| (child, depth + 1)))
                        }
                        Err(e) => self.report(&item.path, format!("{:#}", e)),
                    }
                }
                entries.push(Entry { item, depth });
            }
        }
        entries
    }

    async fn remove_one(&self, item: FileItem) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let result = match self.connections.transmit(&self.id).await {
            Ok(handle) => handle.rm(&item.path, false).await,
            Err(e) => Err(anyhow!(e)),
        };
        match result {
            Ok(()) => debug!(path = %item.path, "removed"),
            Err(e) => self.report(&item.path, format!("{:#}", e)),
        }

        let state = {
            let mut state = self.state.lock();
            state.done_cnt += 1;
            state.done_size += item.size;
            *state
        };
        let _ = self.events.send(QueueEvent::State(state));
    }

    async fn run(self: Arc<Self>, entries: Vec<Entry>) {
        let mut touched = BTreeSet::new();
        let mut levels: BTreeMap<usize, Vec<FileItem>> = BTreeMap::new();
        for entry in entries {
            touched.insert(utils::parent(&entry.item.path));
            levels.entry(entry.depth).or_default().push(entry.item);
        }

        for (depth, items) in levels.into_iter().rev() {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            debug!(depth, count = items.len(), "removing level");
            stream::iter(items)
                .map(|item| self.remove_one(item))
                .buffer_unordered(self.concurrency)
                .collect::<Vec<_>>()
                .await;
        }

        for dir in touched {
            self.refresher.refresh(&self.id, &dir).await;
        }

        let state = *self.state.lock();
        info!(id = %self.id, removed = state.done_cnt, total = state.total_cnt, "remove complete");
        let _ = self.events.send(QueueEvent::State(state));
        let _ = self.events.send(QueueEvent::Complete);
        self.done.send_replace(true);
    }
}

#[derive(Clone)]
pub struct RemoveQueue {
    shared: Arc<Shared>,
}

impl RemoveQueue {
    /// Lists everything under `paths` and starts removing it.
    pub async fn spawn(
        connections: ConnectionManager,
        id: ConnectionId,
        paths: Vec<String>,
        refresher: Arc<dyn Refresh>,
        options: TransferOptions,
    ) -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (done, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            connections,
            id,
            refresher,
            concurrency: options.max_concurrent.unwrap_or(DEFAULT_CONCURRENCY).max(1),
            stopped: AtomicBool::new(false),
            state: Mutex::new(QueueState::default()),
            events,
            done,
        });

        let entries = shared.walk(&paths).await;
        let state = {
            let mut state = shared.state.lock();
            state.total_cnt = entries.len();
            state.total_size = entries.iter().map(|entry| entry.item.size).sum();
            *state
        };
        let _ = shared.events.send(QueueEvent::State(state));

        tokio::spawn(shared.clone().run(entries));
        (Self { shared }, rx)
    }

    /// Lets removals already running finish but starts no new ones.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
    }

    pub async fn close(&self) {
        self.stop();
        self.wait().await;
    }

    pub async fn wait(&self) {
        let mut done = self.shared.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    pub fn state(&self) -> QueueState {
        *self.shared.state.lock()
    }
}
