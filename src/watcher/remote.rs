use super::{ListingTransform, WatchEvent};
use crate::client::{ConnectionId, FileItem};
use crate::connection::ConnectionManager;
use crate::refcount::RefCountMap;
use crate::utils;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct Shared {
    connections: ConnectionManager,
    /// URI -> where to list it.
    registry: Mutex<RefCountMap<String, (ConnectionId, String)>>,
    events: mpsc::UnboundedSender<WatchEvent>,
    transform: Option<Arc<dyn ListingTransform>>,
}

/// Interest in remote directories. Remote endpoints push nothing, so listings
/// are only re-read when someone calls [`RemoteWatcher::refresh`].
#[derive(Clone)]
pub struct RemoteWatcher {
    shared: Arc<Shared>,
}

impl RemoteWatcher {
    pub fn new(
        connections: ConnectionManager,
        events: mpsc::UnboundedSender<WatchEvent>,
        transform: Option<Arc<dyn ListingTransform>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connections,
                registry: Mutex::new(RefCountMap::new()),
                events,
                transform,
            }),
        }
    }

    /// Registers interest in `path` and lists it right away.
    pub async fn watch(&self, id: &ConnectionId, path: &str) {
        let uri = id.uri(path);
        {
            let mut registry = self.shared.registry.lock();
            if registry.inc(&uri) == 0 {
                registry.set(uri.clone(), (id.clone(), path.to_string()));
            }
        }
        self.shared.relist(&uri, id, path).await;
    }

    pub fn unwatch(&self, id: &ConnectionId, path: &str) {
        self.shared.registry.lock().dec(&id.uri(path));
    }

    pub fn is_watching(&self, id: &ConnectionId, path: &str) -> bool {
        self.shared.registry.lock().has(&id.uri(path))
    }

    /// Re-lists `path` and every watched directory below it.
    pub async fn refresh(&self, id: &ConnectionId, path: &str) {
        let uri = id.uri(path);
        let targets: Vec<(String, ConnectionId, String)> = self
            .shared
            .registry
            .lock()
            .iter()
            .filter(|(watched, _)| **watched == uri || utils::is_descendant(watched, &uri))
            .map(|(watched, (id, path))| (watched.clone(), id.clone(), path.clone()))
            .collect();
        debug!(uri = %uri, targets = targets.len(), "refresh");

        for (target, id, path) in targets {
            self.shared.relist(&target, &id, &path).await;
        }
    }
}

impl Shared {
    async fn relist(&self, uri: &str, id: &ConnectionId, path: &str) {
        match self.connections.list(id, path).await {
            Ok(items) => {
                let items: Vec<FileItem> = match &self.transform {
                    Some(transform) => transform.transform(path, items),
                    None => items,
                };
                let _ = self.events.send(WatchEvent::Listing {
                    target: uri.to_string(),
                    items,
                });
            }
            Err(e) => {
                if self.registry.lock().del(uri).is_some() {
                    warn!(uri = %uri, error = %e, "watched directory is gone");
                    let _ = self.events.send(WatchEvent::Missing {
                        target: uri.to_string(),
                    });
                }
            }
        }
    }
}
