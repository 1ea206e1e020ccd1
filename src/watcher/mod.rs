//! Keeping listings live.
//!
//! Each watcher keeps a refcounted registry of what callers are interested in
//! and reports changes as [`WatchEvent`]s on a channel. Queues poke the
//! watchers through [`Refresh`] when they finish writing somewhere.

pub mod file;
pub mod local;
pub mod remote;

use crate::client::{ConnectionId, FileItem};
use crate::connection::ConnectionManager;
use async_trait::async_trait;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Fresh contents of a watched directory. `target` is the path for local
    /// watches and the full URI for remote ones.
    Listing { target: String, items: Vec<FileItem> },
    /// A watched directory is gone; its watch has been dropped.
    Missing { target: String },
    /// A watched file changed; `None` once it no longer exists.
    File { path: String, stat: Option<FileItem> },
}

/// Hook for decorating listings before they are reported.
pub trait ListingTransform: Send + Sync {
    fn transform(&self, dir: &str, items: Vec<FileItem>) -> Vec<FileItem>;
}

#[async_trait]
pub trait Refresh: Send + Sync {
    /// Something under `path` on `id` changed.
    async fn refresh(&self, id: &ConnectionId, path: &str);
}

/// For queues nobody is watching.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRefresh;

#[async_trait]
impl Refresh for NoRefresh {
    async fn refresh(&self, _id: &ConnectionId, _path: &str) {}
}

/// The three watchers sharing one event channel.
pub struct Watchers {
    pub local: local::LocalWatcher,
    pub remote: remote::RemoteWatcher,
    pub file: file::FileWatcher,
}

impl Watchers {
    pub fn new(
        connections: ConnectionManager,
        transform: Option<Arc<dyn ListingTransform>>,
    ) -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let watchers = Self {
            local: local::LocalWatcher::new(connections.clone(), events.clone(), transform.clone()),
            remote: remote::RemoteWatcher::new(connections, events.clone(), transform),
            file: file::FileWatcher::new(events),
        };
        (watchers, rx)
    }
}

#[async_trait]
impl Refresh for Watchers {
    async fn refresh(&self, id: &ConnectionId, path: &str) {
        if id.is_local() {
            self.local.refresh(id, path).await;
        } else {
            self.remote.refresh(id, path).await;
        }
    }
}

/// Raw notify events, forwarded from notify's own thread.
type FsEvents = mpsc::UnboundedSender<notify::Result<Event>>;

fn subscribe(path: &Path, sink: FsEvents) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = sink.send(res);
    })?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Waits for the next event and drains whatever else already arrived.
async fn next_batch(rx: &mut mpsc::UnboundedReceiver<notify::Result<Event>>) -> Option<Vec<Event>> {
    let first = rx.recv().await?;
    let mut batch = Vec::new();
    let mut push = |res: notify::Result<Event>| match res {
        Ok(event) => batch.push(event),
        Err(e) => tracing::debug!(error = %e, "watch error"),
    };
    push(first);
    while let Ok(res) = rx.try_recv() {
        push(res);
    }
    Some(batch)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Remembers every refresh, in order.
    #[derive(Default)]
    pub(crate) struct RecordingRefresh {
        calls: Mutex<Vec<(ConnectionId, String)>>,
    }

    impl RecordingRefresh {
        pub(crate) fn paths(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(_, path)| path.clone()).collect()
        }
    }

    #[async_trait]
    impl Refresh for RecordingRefresh {
        async fn refresh(&self, id: &ConnectionId, path: &str) {
            self.calls.lock().push((id.clone(), path.to_string()));
        }
    }

    #[tokio::test]
    async fn test_no_refresh_is_inert() {
        NoRefresh.refresh(&ConnectionId::Local, "/tmp").await;
        let recorder = RecordingRefresh::default();
        recorder.refresh(&ConnectionId::Local, "/tmp").await;
        assert_eq!(recorder.paths(), vec!["/tmp".to_string()]);
    }
}
