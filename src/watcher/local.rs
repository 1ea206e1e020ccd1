use super::{next_batch, subscribe, FsEvents, ListingTransform, WatchEvent};
use crate::client::{ConnectionId, FileItem};
use crate::connection::ConnectionManager;
use crate::refcount::RefCountMap;
use crate::utils;
use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Device and inode of a watched directory.
type Identity = (u64, u64);

#[cfg(unix)]
fn identity(path: &Path) -> Option<Identity> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|meta| (meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn identity(_path: &Path) -> Option<Identity> {
    None
}

struct DirWatch {
    _watcher: RecommendedWatcher,
    identity: Option<Identity>,
}

impl DirWatch {
    fn start(dir: &str, sink: FsEvents) -> notify::Result<Self> {
        let path = Path::new(dir);
        Ok(Self {
            _watcher: subscribe(path, sink)?,
            identity: identity(path),
        })
    }
}

struct Shared {
    connections: ConnectionManager,
    registry: Mutex<RefCountMap<String, DirWatch>>,
    fs_events: FsEvents,
    events: mpsc::UnboundedSender<WatchEvent>,
    transform: Option<Arc<dyn ListingTransform>>,
}

/// Refcounted OS subscriptions on local directories.
#[derive(Clone)]
pub struct LocalWatcher {
    shared: Arc<Shared>,
}

impl LocalWatcher {
    pub fn new(
        connections: ConnectionManager,
        events: mpsc::UnboundedSender<WatchEvent>,
        transform: Option<Arc<dyn ListingTransform>>,
    ) -> Self {
        let (fs_events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            connections,
            registry: Mutex::new(RefCountMap::new()),
            fs_events,
            events,
            transform,
        });
        tokio::spawn(pump(Arc::downgrade(&shared), rx));
        Self { shared }
    }

    /// Starts (or adds a reference to) the watch on `dir` and reports its
    /// current listing.
    pub async fn watch(&self, dir: &str) -> Result<()> {
        {
            let mut registry = self.shared.registry.lock();
            if registry.inc(dir) == 0 {
                let watch = DirWatch::start(dir, self.shared.fs_events.clone())
                    .with_context(|| format!("watching {}", dir))?;
                registry.set(dir.to_string(), watch);
                debug!(path = %dir, "watch started");
            }
        }
        self.shared.relist(dir).await;
        Ok(())
    }

    /// Drops one reference; the last one ends the OS subscription.
    pub fn unwatch(&self, dir: &str) {
        if self.shared.registry.lock().dec(dir).is_some() {
            debug!(path = %dir, "watch stopped");
        }
    }

    pub fn is_watching(&self, dir: &str) -> bool {
        self.shared.registry.lock().has(dir)
    }

    pub fn watch_count(&self, dir: &str) -> usize {
        self.shared.registry.lock().count(dir)
    }

    pub async fn refresh(&self, id: &ConnectionId, dir: &str) {
        if id.is_local() && self.is_watching(dir) {
            self.shared.relist(dir).await;
        }
    }
}

impl Shared {
    async fn relist(&self, dir: &str) {
        match self.connections.list(&ConnectionId::Local, dir).await {
            Ok(items) => {
                let items = self.decorate(dir, items);
                let _ = self.events.send(WatchEvent::Listing {
                    target: dir.to_string(),
                    items,
                });
            }
            Err(e) => {
                // Drop the subscription together with the registry entry.
                let removed = self.registry.lock().del(dir);
                if removed.is_some() {
                    warn!(path = %dir, error = %e, "watched directory is gone");
                    let _ = self.events.send(WatchEvent::Missing {
                        target: dir.to_string(),
                    });
                }
            }
        }
    }

    fn decorate(&self, dir: &str, items: Vec<FileItem>) -> Vec<FileItem> {
        match &self.transform {
            Some(transform) => transform.transform(dir, items),
            None => items,
        }
    }

    /// Moves the watch on `from` to `to` after the directory was renamed.
    /// Returns false when `from` was not watched.
    fn migrate(&self, from: &str, to: &str) -> bool {
        let mut registry = self.registry.lock();
        if !registry.has(from) {
            return false;
        }
        let displaced = registry.rename_key(from, to.to_string());
        drop(displaced);
        match DirWatch::start(to, self.fs_events.clone()) {
            Ok(watch) => {
                // Replacing the old value ends the subscription on the old path.
                registry.modify(to, watch);
                debug!(from = %from, to = %to, "watch followed rename");
            }
            Err(e) => debug!(path = %to, error = %e, "could not re-subscribe after rename"),
        }
        true
    }

    /// Where a watched directory that moved itself went. Only the old path
    /// is reported, so look for the same inode next to where it was.
    fn moved_to(&self, from: &str) -> Option<String> {
        let wanted = self.registry.lock().get(from)?.identity?;
        let old = Path::new(from);
        if old.exists() {
            return None;
        }
        std::fs::read_dir(old.parent()?)
            .ok()?
            .flatten()
            .map(|entry| entry.path())
            .find(|path| identity(path) == Some(wanted))
            .map(|path| path.to_string_lossy().into_owned())
    }

    /// Watched directories an event batch may have changed.
    fn affected(&self, batch: &[Event]) -> BTreeSet<String> {
        let mut dirs = BTreeSet::new();
        // Renames seen from a watched parent carry both paths.
        for event in batch {
            if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
                if let [from, to] = event.paths.as_slice() {
                    let to = to.to_string_lossy();
                    if self.migrate(&from.to_string_lossy(), &to) {
                        dirs.insert(to.into_owned());
                    }
                }
            }
        }
        // The directory's own watch only reports the old path.
        for event in batch {
            if let EventKind::Modify(ModifyKind::Name(RenameMode::From | RenameMode::Any)) =
                event.kind
            {
                for path in &event.paths {
                    let from = path.to_string_lossy();
                    if let Some(to) = self.moved_to(&from) {
                        if self.migrate(&from, &to) {
                            dirs.insert(to);
                        }
                    }
                }
            }
        }

        let registry = self.registry.lock();
        for path in batch.iter().flat_map(|event| event.paths.iter()) {
            let path = path.to_string_lossy().into_owned();
            let parent = utils::parent(&path);
            if registry.has(parent.as_str()) {
                dirs.insert(parent);
            }
            if registry.has(path.as_str()) {
                dirs.insert(path);
            }
        }
        dirs
    }
}

async fn pump(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>) {
    while let Some(batch) = next_batch(&mut rx).await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        for dir in shared.affected(&batch) {
            shared.relist(&dir).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn path_str(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> WatchEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no watch event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_watch_lists_immediately_and_refcounts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = LocalWatcher::new(ConnectionManager::default(), tx, None);
        let target = path_str(dir.path());

        watcher.watch(&target).await.unwrap();
        match next_event(&mut rx).await {
            WatchEvent::Listing { target: t, items } => {
                assert_eq!(t, target);
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].name, "a.txt");
                assert!(items[0].uri.as_deref().unwrap().starts_with("file://"));
            }
            other => panic!("unexpected {:?}", other),
        }

        watcher.watch(&target).await.unwrap();
        assert_eq!(watcher.watch_count(&target), 2);
        watcher.unwatch(&target);
        assert!(watcher.is_watching(&target));
        watcher.unwatch(&target);
        assert!(!watcher.is_watching(&target));
    }

    #[tokio::test]
    async fn test_new_file_triggers_listing() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = LocalWatcher::new(ConnectionManager::default(), tx, None);
        let target = path_str(dir.path());
        watcher.watch(&target).await.unwrap();
        let _initial = next_event(&mut rx).await;

        std::fs::write(dir.path().join("new.txt"), b"hello").unwrap();

        loop {
            if let WatchEvent::Listing { items, .. } = next_event(&mut rx).await {
                if items.iter().any(|item| item.name == "new.txt") {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_removed_directory_reports_missing_once() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = LocalWatcher::new(ConnectionManager::default(), tx, None);
        let target = path_str(&sub);
        watcher.watch(&target).await.unwrap();
        let _initial = next_event(&mut rx).await;

        std::fs::remove_dir(&sub).unwrap();
        watcher.refresh(&ConnectionId::Local, &target).await;

        let mut missing = 0;
        while let Ok(Some(event)) = timeout(Duration::from_millis(300), rx.recv()).await {
            if event == (WatchEvent::Missing { target: target.clone() }) {
                missing += 1;
            }
        }
        assert_eq!(missing, 1);
        assert!(!watcher.is_watching(&target));
    }

    /// Waits for the listing of `want`; a `Missing` on the way fails.
    async fn listing_of(rx: &mut mpsc::UnboundedReceiver<WatchEvent>, want: &str) -> Vec<String> {
        loop {
            match next_event(rx).await {
                WatchEvent::Listing { target, items } if target == want => {
                    return items.into_iter().map(|item| item.name).collect();
                }
                WatchEvent::Missing { target } => panic!("{} reported missing", target),
                _ => {}
            }
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_renamed_directory_is_followed() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("a.txt"), b"a").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = LocalWatcher::new(ConnectionManager::default(), tx, None);
        let old = path_str(&sub);
        watcher.watch(&old).await.unwrap();
        watcher.watch(&old).await.unwrap();
        let _initial = next_event(&mut rx).await;
        let _again = next_event(&mut rx).await;

        let renamed = dir.path().join("renamed");
        std::fs::rename(&sub, &renamed).unwrap();
        let new = path_str(&renamed);

        assert_eq!(listing_of(&mut rx, &new).await, vec!["a.txt".to_string()]);
        assert!(!watcher.is_watching(&old));
        assert_eq!(watcher.watch_count(&new), 2);

        // The new subscription is live.
        std::fs::write(renamed.join("b.txt"), b"b").unwrap();
        loop {
            if listing_of(&mut rx, &new).await.contains(&"b.txt".to_string()) {
                break;
            }
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_rename_under_watched_parent_is_followed() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = LocalWatcher::new(ConnectionManager::default(), tx, None);
        let parent = path_str(dir.path());
        let old = path_str(&sub);
        watcher.watch(&parent).await.unwrap();
        watcher.watch(&old).await.unwrap();
        let _initial = next_event(&mut rx).await;
        let _initial = next_event(&mut rx).await;

        let renamed = dir.path().join("renamed");
        std::fs::rename(&sub, &renamed).unwrap();
        let new = path_str(&renamed);

        assert!(listing_of(&mut rx, &new).await.is_empty());
        assert!(!watcher.is_watching(&old));
        assert!(watcher.is_watching(&new));
        assert!(watcher.is_watching(&parent));
    }
}
