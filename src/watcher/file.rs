use super::{next_batch, subscribe, FsEvents, WatchEvent};
use crate::client::local::LocalClient;
use crate::refcount::RefCountMap;
use crate::utils;
use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

struct Shared {
    registry: Mutex<RefCountMap<String, RecommendedWatcher>>,
    fs_events: FsEvents,
    events: mpsc::UnboundedSender<WatchEvent>,
}

/// Watches single local files. The subscription sits on the parent directory
/// so a save that replaces the file by rename is still seen.
#[derive(Clone)]
pub struct FileWatcher {
    shared: Arc<Shared>,
}

impl FileWatcher {
    pub fn new(events: mpsc::UnboundedSender<WatchEvent>) -> Self {
        let (fs_events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            registry: Mutex::new(RefCountMap::new()),
            fs_events,
            events,
        });
        tokio::spawn(pump(Arc::downgrade(&shared), rx));
        Self { shared }
    }

    pub fn watch(&self, path: &str) -> Result<()> {
        let mut registry = self.shared.registry.lock();
        if registry.inc(path) == 0 {
            let parent = utils::parent(path);
            let watcher = subscribe(Path::new(&parent), self.shared.fs_events.clone())
                .with_context(|| format!("watching {}", parent))?;
            registry.set(path.to_string(), watcher);
        }
        Ok(())
    }

    pub fn unwatch(&self, path: &str) {
        self.shared.registry.lock().dec(path);
    }

    pub fn is_watching(&self, path: &str) -> bool {
        self.shared.registry.lock().has(path)
    }
}

impl Shared {
    fn affected(&self, batch: &[Event]) -> BTreeSet<String> {
        let registry = self.registry.lock();
        batch
            .iter()
            .flat_map(|event| event.paths.iter())
            .map(|path| path.to_string_lossy().into_owned())
            .filter(|path| registry.has(path.as_str()))
            .collect()
    }

    async fn report(&self, path: String) {
        let stat = LocalClient::stat(Path::new(&path)).await.ok();
        debug!(path = %path, exists = stat.is_some(), "watched file changed");
        let _ = self.events.send(WatchEvent::File { path, stat });
    }
}

async fn pump(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>) {
    while let Some(batch) = next_batch(&mut rx).await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        for path in shared.affected(&batch) {
            shared.report(path).await;
        }
    }
}
